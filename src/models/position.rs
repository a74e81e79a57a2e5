//! # models::position
//!
//! A [`Position`] is an opened (and eventually closed) trade.
//!
//! `sell_price == None` means the position is open. Once the broker sets it,
//! the position moves to the closed set and is never touched again.

use std::fmt;

use chrono::{DateTime, TimeDelta, Utc};
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::order::Direction;

pub type PositionRef = Uuid;

// ─── Position ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub reference:        PositionRef,
    pub instrument:       String,
    pub direction:        Direction,
    pub size:             f64,
    pub buy_price:        Decimal,
    pub buy_time:         DateTime<Utc>,
    pub sell_price:       Option<Decimal>,
    pub sell_time:        Option<DateTime<Utc>>,
    pub target_price:     Option<Decimal>,
    pub stop_loss_price:  Option<Decimal>,
    /// Copied from the order that opened the position.
    pub note:             String,
    /// Start of the strategy candle during which the trader first saw it.
    pub candle_buy_time:  Option<DateTime<Utc>>,
    pub candle_sell_time: Option<DateTime<Utc>>,

    // ── Backtesting annotations ──────────────────────────────────────────────
    pub max_surge:         f64,      // pips
    pub max_drawdown:      f64,      // pips
    pub today_performance: Decimal,  // percent
    pub gap_to_sma:        Decimal,
}

impl Position {
    #[inline]
    pub fn is_open(&self) -> bool {
        self.sell_price.is_none()
    }

    /// Absolute P&L as exact decimal. Open positions are valued at the given
    /// bid (long) or ask (short); closed positions at their sell price.
    pub fn pnl(&self, bid: Decimal, ask: Decimal) -> Decimal {
        let exit = match (self.sell_price, self.direction) {
            (Some(sell), _)             => sell,
            (None, Direction::Long)     => bid,
            (None, Direction::Short)    => ask,
        };
        let diff = match self.direction {
            Direction::Long  => exit - self.buy_price,
            Direction::Short => self.buy_price - exit,
        };
        // An unrepresentable size never produces P&L
        diff * Decimal::from_f64(self.size).unwrap_or(Decimal::ZERO)
    }

    pub fn performance_absolute(&self, bid: Decimal, ask: Decimal) -> f64 {
        self.pnl(bid, ask).to_f64().unwrap_or(0.0)
    }

    pub fn performance_in_percentage(&self, bid: Decimal, ask: Decimal) -> f64 {
        let (numerator, divisor) = match (self.sell_price, self.direction) {
            (None, Direction::Long)        => (bid - self.buy_price, self.buy_price),
            (None, Direction::Short)       => {
                if ask.is_zero() {
                    return 0.0;
                }
                (self.buy_price - ask, ask)
            }
            (Some(sell), Direction::Long)  => (sell - self.buy_price, self.buy_price),
            (Some(sell), Direction::Short) => (self.buy_price - sell, sell),
        };

        numerator
            .checked_div(divisor)
            .map(|ratio| ratio * dec!(100))
            .and_then(|p| p.to_f64())
            .unwrap_or(0.0)
    }

    /// Performance of a closed position in percent, rounded to 2 places.
    pub fn pretty_performance(&self) -> f64 {
        let perf = self.performance_in_percentage(Decimal::ZERO, Decimal::ZERO);
        (perf * 100.0).round() / 100.0
    }

    /// Time between buy and sell. Zero while the position is open.
    pub fn duration(&self) -> TimeDelta {
        self.sell_time
            .map(|sell| sell - self.buy_time)
            .unwrap_or_else(TimeDelta::zero)
    }

    pub fn age(&self, now: DateTime<Utc>) -> TimeDelta {
        now - self.buy_time
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}: Direction={} BuyLevel={} BuyTime={} Size={:.2}",
            self.instrument, self.reference, self.direction, self.buy_price, self.buy_time, self.size
        )
    }
}

// ─── Close reason ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CloseReason {
    TargetHit,
    StopLossHit,
    Trader,
    Liquidation,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::TargetHit   => write!(f, "Target hit"),
            CloseReason::StopLossHit => write!(f, "Stop loss hit"),
            CloseReason::Trader      => write!(f, "Initiated by trader"),
            CloseReason::Liquidation => write!(f, "Liquidation"),
        }
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────
