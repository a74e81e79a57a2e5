//! # broker::backtest
//!
//! Replays a historical candle feed through a [`PaperWallet`].
//!
//! ```text
//!  CandleSource ─▶ spawn_feed ─▶ candle ─▶ to_ticks ─▶ wallet.set_current_price
//!                                                   └▶ trader (waits for ack)
//! ```
//!
//! Each tick reaches the wallet first, so target/stop exits fire before the
//! strategy sees the tick, and the next tick is only released once the
//! trader acknowledged the current one. When the feed is exhausted all
//! remaining positions are liquidated and the CSV report is written. A
//! replay cut short by the trader leaves the wallet as is and writes nothing.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{error, info, warn};

use crate::broker::feed::{spawn_feed, CandleSource};
use crate::broker::report::ReportWriter;
use crate::broker::{Broker, FeedTick, TickSender};
use crate::engine::paper_wallet::PaperWallet;
use crate::error::{BrokerError, FatalError};
use crate::models::{Order, OrderId, Position, PositionRef};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Replay {
    Exhausted,
    Interrupted,
}

pub struct Backtest {
    instrument: String,
    wallet:     Arc<PaperWallet>,
    source:     Arc<dyn CandleSource>,
    report:     ReportWriter,
}

impl Backtest {
    pub fn new(
        instrument: impl Into<String>,
        wallet:     Arc<PaperWallet>,
        source:     Arc<dyn CandleSource>,
        report:     ReportWriter,
    ) -> Self {
        Self {
            instrument: instrument.into(),
            wallet,
            source,
            report,
        }
    }

    pub fn wallet(&self) -> &Arc<PaperWallet> {
        &self.wallet
    }

    /// Streams every candle as four ticks. `Interrupted` means the trader
    /// stopped consuming before the feed was exhausted.
    async fn replay(&self, ticks: &TickSender) -> Result<Replay, BrokerError> {
        let (mut candles, feed) = spawn_feed(self.source.clone());
        let mut sent = 0usize;

        while let Some(candle) = candles.recv().await {
            for tick in candle.to_ticks() {
                if let Err(err) = self.wallet.set_current_price(tick.clone()).await {
                    if err.is_fatal() {
                        error!(error = %err, "💥 [BACKTEST] Paper wallet failed");
                        feed.abort();
                        return Err(err);
                    }
                    warn!(error = %err, time = %tick.time, "⚠️ [BACKTEST] Price update rejected");
                }

                let (feed_tick, processed) = FeedTick::acked(tick);
                // A failed send or a dropped ack means the consumer is gone
                if ticks.send(feed_tick).is_err() || processed.await.is_err() {
                    warn!(ticks = sent, "[BACKTEST] Trader stopped listening, replay interrupted");
                    feed.abort();
                    return Ok(Replay::Interrupted);
                }
                sent += 1;
            }
        }

        match feed.await {
            Ok(Ok(total)) => info!(candles = total, ticks = sent, instrument = %self.instrument, "🏁 [BACKTEST] Feed exhausted"),
            Ok(Err(err))  => {
                error!(error = %err, "💥 [BACKTEST] Feed retrieval failed");
                return Err(err.into());
            }
            Err(join) => return Err(FatalError::Feed(format!("feed task failed: {join}")).into()),
        }
        Ok(Replay::Exhausted)
    }

    async fn finish(&self) -> Result<(), BrokerError> {
        self.wallet.close_all_open_positions().await?;

        let closed = self.wallet.closed_positions().await;
        let open = self.wallet.open_positions().await;
        let last_tick = self.wallet.current_tick().await;
        self.report.write(&closed, &open, last_tick.as_ref())?;

        self.wallet.print_summary().await;
        Ok(())
    }
}

#[async_trait]
impl Broker for Backtest {
    async fn buy(&self, order: Order) -> Result<OrderId, BrokerError> {
        self.wallet.buy(order).await
    }

    async fn cancel_order(&self, order_id: OrderId) -> Result<(), BrokerError> {
        self.wallet.cancel_order(order_id).await
    }

    async fn sell(&self, position: &Position) -> Result<(), BrokerError> {
        self.wallet.sell(position).await
    }

    async fn open_position(&self, reference: PositionRef) -> Result<Position, BrokerError> {
        self.wallet.open_position(reference).await
    }

    async fn open_positions(&self) -> Result<Vec<Position>, BrokerError> {
        Ok(self.wallet.open_positions().await)
    }

    async fn open_positions_by_instrument(&self, instrument: &str) -> Result<Vec<Position>, BrokerError> {
        Ok(self.wallet.open_positions_by_instrument(instrument).await)
    }

    async fn closed_positions(&self) -> Result<Vec<Position>, BrokerError> {
        Ok(self.wallet.closed_positions().await)
    }

    async fn open_orders(&self) -> Result<Vec<Order>, BrokerError> {
        Ok(self.wallet.open_orders().await)
    }

    async fn listen_to_price_feed(&self, ticks: TickSender) -> Result<(), BrokerError> {
        info!(source = %self.source.describe(), instrument = %self.instrument, "▶️ [BACKTEST] Replay started");
        let replay = self.replay(&ticks).await?;
        drop(ticks);
        match replay {
            Replay::Exhausted   => self.finish().await,
            // Partial data, no liquidation and no report
            Replay::Interrupted => Ok(()),
        }
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────
