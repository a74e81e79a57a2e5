//! # broker
//!
//! The [`Broker`] contract the trader executes against, and the tick channel
//! a broker's price feed writes into.
//!
//! ```text
//!  feed task ──FeedTick──▶ unbounded mpsc ──▶ trader consumer
//!      ▲                                            │
//!      └──────────── done (oneshot, optional) ◀─────┘
//! ```
//!
//! Live feeds send ticks without `done`. The backtest replay attaches a
//! `done` sender to every tick and waits for it before advancing the paper
//! wallet, which keeps wallet price and trader decisions in lock-step.

pub mod backtest;
pub mod feed;
pub mod report;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};

use crate::error::BrokerError;
use crate::models::{Order, OrderId, Position, PositionRef, Tick};

/// One tick on its way from a price feed to the trader.
#[derive(Debug)]
pub struct FeedTick {
    pub tick: Tick,
    /// Signalled once the trader finished processing `tick`.
    pub done: Option<oneshot::Sender<()>>,
}

impl FeedTick {
    pub fn live(tick: Tick) -> Self {
        Self { tick, done: None }
    }

    /// Tick plus the receiver that resolves once it has been processed.
    pub fn acked(tick: Tick) -> (Self, oneshot::Receiver<()>) {
        let (done, processed) = oneshot::channel();
        (Self { tick, done: Some(done) }, processed)
    }

    pub fn ack(self) {
        if let Some(done) = self.done {
            let _ = done.send(());
        }
    }
}

pub type TickSender   = mpsc::UnboundedSender<FeedTick>;
pub type TickReceiver = mpsc::UnboundedReceiver<FeedTick>;

#[async_trait]
pub trait Broker: Send + Sync {
    async fn buy(&self, order: Order) -> Result<OrderId, BrokerError>;

    async fn cancel_order(&self, order_id: OrderId) -> Result<(), BrokerError>;

    async fn sell(&self, position: &Position) -> Result<(), BrokerError>;

    async fn open_position(&self, reference: PositionRef) -> Result<Position, BrokerError>;

    async fn open_positions(&self) -> Result<Vec<Position>, BrokerError>;

    async fn open_positions_by_instrument(&self, instrument: &str) -> Result<Vec<Position>, BrokerError>;

    async fn closed_positions(&self) -> Result<Vec<Position>, BrokerError>;

    async fn open_orders(&self) -> Result<Vec<Order>, BrokerError>;

    /// Streams ticks into `ticks` until the feed is exhausted or fails.
    /// Dropping `ticks` on return closes the stream.
    async fn listen_to_price_feed(&self, ticks: TickSender) -> Result<(), BrokerError>;
}
