//! # models::tick
//!
//! Defines [`Tick`], one observed bid/ask quote for an instrument.
//!
//! Ticks are produced by a price feed (live or replayed), validated by the
//! trader and consumed once by the candle aggregator and the paper wallet.
//! They are never mutated after construction.

use std::fmt;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

use crate::error::TickError;

/// A single price tick.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tick {
    /// Instrument id, e.g. `"EURUSD"` or `"XETR.DE0007164600"`.
    pub instrument: String,

    /// UTC timestamp of the quote.
    pub time: DateTime<Utc>,

    /// Price at which the market buys from us.
    pub bid: Decimal,

    /// Price at which the market sells to us.
    pub ask: Decimal,
}

impl Tick {
    pub fn new(instrument: impl Into<String>, time: DateTime<Utc>, bid: Decimal, ask: Decimal) -> Self {
        Self {
            instrument: instrument.into(),
            time,
            bid,
            ask,
        }
    }

    /// Mid price: `(bid + ask) / 2`.
    #[inline]
    pub fn price(&self) -> Decimal {
        (self.bid + self.ask) / dec!(2)
    }

    pub fn spread(&self) -> Decimal {
        (self.ask - self.bid).abs()
    }

    /// Spread relative to bid. Zero when bid is zero.
    pub fn spread_in_percent(&self) -> Decimal {
        if self.bid.is_zero() {
            return Decimal::ZERO;
        }
        ((self.ask - self.bid) / self.bid * dec!(100)).abs()
    }

    pub fn validate(&self) -> Result<(), TickError> {
        if self.time == DateTime::<Utc>::default() {
            return Err(TickError::EmptyDatetime);
        }
        if self.bid.is_zero() {
            return Err(TickError::EmptyBid);
        }
        if self.ask.is_zero() {
            return Err(TickError::EmptyAsk);
        }
        if self.ask < self.bid {
            return Err(TickError::AskBelowBid);
        }
        Ok(())
    }
}

impl fmt::Display for Tick {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{Datetime={} Bid={} Ask={}}}", self.time, self.bid, self.ask)
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────
