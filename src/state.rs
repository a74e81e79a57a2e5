//! # state
//!
//! Shared state of the read-only monitor API.
//!
//! * `Arc<MonitorState>` is cloned into every Axum handler via
//!   `axum::extract::State`.
//! * The paper wallet and the store carry their own locks, so handlers only
//!   ever take short read guards and never block the trader.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::broadcast;

use crate::engine::paper_wallet::PaperWallet;
use crate::events::EngineEvent;
use crate::store::CandleStore;

// ─── MonitorState ─────────────────────────────────────────────────────────────

pub struct MonitorState {
    pub instrument: String,
    pub wallet:     Arc<PaperWallet>,
    pub store:      Arc<dyn CandleStore>,
    /// Sender side of the trader's event channel. Each WebSocket client
    /// subscribes its own receiver.
    pub events:     broadcast::Sender<EngineEvent>,
    pub started_at: DateTime<Utc>,
}

pub type SharedState = Arc<MonitorState>;

pub fn build_state(
    instrument: impl Into<String>,
    wallet:     Arc<PaperWallet>,
    store:      Arc<dyn CandleStore>,
    events:     broadcast::Sender<EngineEvent>,
) -> SharedState {
    Arc::new(MonitorState {
        instrument: instrument.into(),
        wallet,
        store,
        events,
        started_at: Utc::now(),
    })
}
