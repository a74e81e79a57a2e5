//! # routes
//!
//! HTTP surface of a running engine.

pub mod monitor;

use axum::{routing::get, Router};

use crate::state::SharedState;
use monitor::{get_closed_positions, get_health, get_latest_performance, get_open_orders, get_open_position, get_open_positions, get_performance, ws_monitor};

/// Monitor router with state applied. Middleware is added by the caller.
pub fn router(state: SharedState) -> Router {
    Router::new()
        .route("/ws/monitor",                        get(ws_monitor))
        .route("/api/monitor/health",                get(get_health))
        .route("/api/monitor/positions",             get(get_open_positions))
        .route("/api/monitor/positions/closed",      get(get_closed_positions))
        .route("/api/monitor/positions/:reference",  get(get_open_position))
        .route("/api/monitor/orders",                get(get_open_orders))
        .route("/api/monitor/performance",           get(get_performance))
        .route("/api/monitor/performance/latest",    get(get_latest_performance))
        .with_state(state)
}
