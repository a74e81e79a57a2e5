//! # events
//!
//! Defines [`EngineEvent`], everything the trader publishes to its
//! subscribers while it runs.
//!
//! Events go out on a `tokio::sync::broadcast` channel. The monitor turns
//! them into JSON for WebSocket clients; tests subscribe directly.

use serde::Serialize;
use tokio::sync::broadcast;

use crate::engine::candle_builder::Candle;
use crate::models::{Order, Position};

pub const EVENT_CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EngineEvent {
    /// A strategy-duration candle closed and was handed to the strategy.
    CandleClosed {
        candle: Box<Candle>,
    },

    /// The broker closed a position since the last check. Sent once per
    /// position.
    PositionClosed {
        position: Box<Position>,
    },

    /// An order from the strategy was accepted by the broker.
    OrderPlaced {
        order: Box<Order>,
    },
}

impl EngineEvent {
    #[inline]
    pub fn to_json(&self) -> String {
        serde_json::to_string(self)
            .unwrap_or_else(|_| r#"{"event":"SERIALIZATION_ERROR"}"#.to_string())
    }
}

pub fn channel() -> (broadcast::Sender<EngineEvent>, broadcast::Receiver<EngineEvent>) {
    broadcast::channel(EVENT_CHANNEL_CAPACITY)
}
