//! # routes::monitor
//!
//! **Monitor** is a read-only view of a running engine.
//!
//! ## Endpoints
//!
//! | Method    | Path                                 | Description                          |
//! |-----------|--------------------------------------|--------------------------------------|
//! | GET (WS)  | `/ws/monitor`                        | JSON stream of trader events         |
//! | GET       | `/api/monitor/health`                | uptime, balance, position counts     |
//! | GET       | `/api/monitor/positions`             | open positions                       |
//! | GET       | `/api/monitor/positions/closed`      | closed positions                     |
//! | GET       | `/api/monitor/positions/:reference`  | one open position                    |
//! | GET       | `/api/monitor/orders`                | pending limit orders                 |
//! | GET       | `/api/monitor/performance`           | stored performance records           |
//! | GET       | `/api/monitor/performance/latest`    | most recent performance record       |

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    response::IntoResponse,
    Json,
};
use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info};

use crate::error::AppError;
use crate::models::PositionRef;
use crate::state::SharedState;

// ─── WebSocket Handler ────────────────────────────────────────────────────────

/// Upgrades to a WebSocket, sends a snapshot, then forwards every
/// [`EngineEvent`](crate::events::EngineEvent) as a JSON text frame.
pub async fn ws_monitor(
    ws: WebSocketUpgrade,
    State(state): State<SharedState>,
) -> impl IntoResponse {
    ws.on_upgrade(|socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: SharedState) {
    let mut rx = state.events.subscribe();
    let (mut sender, mut receiver) = socket.split();

    info!("🔌 [MONITOR] WebSocket client connected");

    let snapshot = json!({
        "event":          "SNAPSHOT",
        "instrument":     state.instrument,
        "balance":        state.wallet.balance().await,
        "open_positions": state.wallet.open_positions().await,
        "open_orders":    state.wallet.open_orders().await,
    })
    .to_string();

    if sender.send(Message::Text(snapshot)).await.is_err() {
        return;
    }

    loop {
        tokio::select! {
            result = rx.recv() => {
                match result {
                    Ok(event) => {
                        if sender.send(Message::Text(event.to_json())).await.is_err() {
                            break;
                        }
                    }
                    Err(RecvError::Lagged(n)) => {
                        debug!("WS client lagged, skipped {n} events");
                    }
                    Err(RecvError::Closed) => break,
                }
            }

            result = receiver.next() => {
                match result {
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(Message::Ping(data))) => {
                        let _ = sender.send(Message::Pong(data)).await;
                    }
                    _ => {}
                }
            }
        }
    }

    info!("🔌 [MONITOR] WebSocket client disconnected");
}

// ─── REST Endpoints ───────────────────────────────────────────────────────────

/// GET /api/monitor/health
pub async fn get_health(State(state): State<SharedState>) -> impl IntoResponse {
    let uptime = Utc::now() - state.started_at;
    Json(json!({
        "ok":               true,
        "instrument":       state.instrument,
        "uptime_secs":      uptime.num_seconds(),
        "balance":          state.wallet.balance().await,
        "open_positions":   state.wallet.open_positions().await.len(),
        "closed_positions": state.wallet.closed_positions().await.len(),
        "open_orders":      state.wallet.open_orders().await.len(),
    }))
}

/// GET /api/monitor/positions
pub async fn get_open_positions(State(state): State<SharedState>) -> impl IntoResponse {
    let positions = state.wallet.open_positions().await;
    Json(json!({
        "ok":        true,
        "count":     positions.len(),
        "positions": positions,
    }))
}

/// GET /api/monitor/positions/closed
pub async fn get_closed_positions(State(state): State<SharedState>) -> impl IntoResponse {
    let positions = state.wallet.closed_positions().await;
    Json(json!({
        "ok":        true,
        "count":     positions.len(),
        "positions": positions,
    }))
}

/// GET /api/monitor/positions/:reference
pub async fn get_open_position(
    State(state): State<SharedState>,
    Path(reference): Path<PositionRef>,
) -> Result<impl IntoResponse, AppError> {
    let position = state.wallet.open_position(reference).await?;
    Ok(Json(json!({
        "ok":       true,
        "position": position,
    })))
}

/// GET /api/monitor/orders
pub async fn get_open_orders(State(state): State<SharedState>) -> impl IntoResponse {
    let orders = state.wallet.open_orders().await;
    Json(json!({
        "ok":     true,
        "count":  orders.len(),
        "orders": orders,
    }))
}

/// GET /api/monitor/performance
pub async fn get_performance(State(state): State<SharedState>) -> Result<impl IntoResponse, AppError> {
    let records = state.store.performance_records().await?;
    Ok(Json(json!({
        "ok":      true,
        "count":   records.len(),
        "records": records,
    })))
}

/// GET /api/monitor/performance/latest
pub async fn get_latest_performance(State(state): State<SharedState>) -> Result<impl IntoResponse, AppError> {
    let record = state
        .store
        .performance_records()
        .await?
        .pop()
        .ok_or_else(|| AppError::NotFound("no performance record stored yet".into()))?;
    Ok(Json(json!({
        "ok":     true,
        "record": record,
    })))
}

// ─── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::paper_wallet::PaperWallet;
    use crate::engine::performance::{PerformanceRecord, RunInfo};
    use crate::events;
    use crate::models::position::tests::make_position;
    use crate::models::{Direction, Order, Tick};
    use crate::routes::router;
    use crate::state::build_state;
    use crate::store::{CandleStore, MemoryStore};
    use axum::body::{to_bytes, Body};
    use axum::http::{Request, StatusCode};
    use chrono::TimeDelta;
    use rust_decimal_macros::dec;
    use std::sync::Arc;
    use tower::ServiceExt;

    async fn make_state() -> (SharedState, Arc<PaperWallet>, Arc<MemoryStore>) {
        let wallet = Arc::new(PaperWallet::default());
        wallet
            .set_current_price(Tick::new("EURUSD", Utc::now(), dec!(1.1000), dec!(1.1002)))
            .await
            .unwrap();
        let store = Arc::new(MemoryStore::new());
        let (events, _) = events::channel();
        let state = build_state("EURUSD", wallet.clone(), store.clone() as Arc<dyn CandleStore>, events);
        (state, wallet, store)
    }

    async fn get_json(state: SharedState, uri: &str) -> (StatusCode, serde_json::Value) {
        let response = router(state)
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&body).unwrap())
    }

    #[tokio::test]
    async fn test_health() {
        let (state, _, _) = make_state().await;
        let (status, body) = get_json(state, "/api/monitor/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["ok"], true);
        assert_eq!(body["instrument"], "EURUSD");
        assert_eq!(body["open_positions"], 0);
    }

    #[tokio::test]
    async fn test_positions() {
        let (state, wallet, _) = make_state().await;
        wallet.buy(Order::market(Direction::Long, 1.0, "EURUSD", None, None)).await.unwrap();
        let reference = wallet.open_positions().await[0].reference;

        let (status, body) = get_json(state.clone(), "/api/monitor/positions").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["count"], 1);

        let (status, body) = get_json(state.clone(), &format!("/api/monitor/positions/{reference}")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["position"]["direction"], "LONG");

        let (status, body) = get_json(state, "/api/monitor/positions/closed").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["count"], 0);
    }

    #[tokio::test]
    async fn test_unknown_position_is_404() {
        let (state, _, _) = make_state().await;
        let uri = format!("/api/monitor/positions/{}", uuid::Uuid::new_v4());
        let (status, body) = get_json(state, &uri).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["ok"], false);
        assert_eq!(body["error"], "Broker error: position not found");
    }

    #[tokio::test]
    async fn test_orders() {
        let (state, wallet, _) = make_state().await;
        wallet
            .buy(Order::limit(Direction::Long, 1.0, "EURUSD", dec!(1.0500), None, None))
            .await
            .unwrap();
        let (status, body) = get_json(state, "/api/monitor/orders").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["count"], 1);
    }

    #[tokio::test]
    async fn test_performance_records() {
        let (state, _, store) = make_state().await;

        let (status, _) = get_json(state.clone(), "/api/monitor/performance/latest").await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let info = RunInfo {
            strategy_name:            "heikin_ashi".into(),
            strategy:                 "heikin_ashi()".into(),
            instrument:               "EURUSD".into(),
            candle_duration:          TimeDelta::hours(1),
            max_concurrent_positions: 1,
        };
        let closed = vec![make_position(Direction::Long, dec!(1.1000), Some(dec!(1.1010)))];
        let record = PerformanceRecord::from_closed_positions(&info, closed).unwrap().unwrap();
        store.save_performance_record(&record).await.unwrap();

        let (status, body) = get_json(state.clone(), "/api/monitor/performance").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["count"], 1);

        let (status, body) = get_json(state, "/api/monitor/performance/latest").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["record"]["trades"], 1);
    }
}
