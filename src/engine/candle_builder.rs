//! # engine::candle_builder
//!
//! OHLC candle state machine. Turns a forward-only, possibly gappy price
//! stream into time-boxed candles.
//!
//! ```text
//!   Open (no data) ──new_price──▶ Open (has data) ──time ≥ end──▶ Closed
//!          │                             │                          ▲
//!          └────────── force_close ──────┴──────────────────────────┘
//! ```
//!
//! The window is half-open: a price at or after `end` closes the candle and
//! is *not* absorbed. `force_close` freezes `end` at the last admitted
//! timestamp so that `end` always reflects real data coverage.

use std::fmt;

use chrono::{DateTime, DurationRound, TimeDelta, TimeZone, Utc};
use chrono_tz::Tz;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

use crate::error::CandleError;
use crate::models::Tick;

/// Seconds between two admitted prices above which the candle is flagged
/// as gappy.
pub const MAX_GAP_BETWEEN_TICKS_SECS: i64 = 60;

const HUNDRED: Decimal = dec!(100);

// ─── Candle ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub instrument: String,
    pub open:       Decimal,
    pub high:       Decimal,
    pub high_time:  DateTime<Utc>,
    pub low:        Decimal,
    pub low_time:   DateTime<Utc>,
    pub close:      Decimal,
    pub start:      DateTime<Utc>,
    pub end:        DateTime<Utc>,
    #[serde(with = "duration_secs")]
    pub duration:   TimeDelta,
    pub gaps:       bool,

    #[serde(default)]
    price_data_seen: bool,
    #[serde(default)]
    closed:          bool,
    #[serde(default)]
    last_received:   Option<DateTime<Utc>>,
}

impl Candle {
    /// Opens an empty candle. With `round`, `start` is truncated down to the
    /// nearest multiple of `duration` (21:24:07 with 15m → 21:15:00).
    pub fn new(instrument: impl Into<String>, now: DateTime<Utc>, duration: TimeDelta, round: bool) -> Self {
        let start = if round { smooth_candle_start(now, duration) } else { now };
        Self::starting_at(instrument, start, duration)
    }

    /// Opens an empty candle whose window is aligned in `tz`, so a daily
    /// candle starts at local midnight and an hourly one on the local hour.
    pub fn new_in_tz(instrument: impl Into<String>, now: DateTime<Utc>, duration: TimeDelta, tz: Tz) -> Self {
        Self::starting_at(instrument, local_candle_start(now, duration, tz), duration)
    }

    fn starting_at(instrument: impl Into<String>, start: DateTime<Utc>, duration: TimeDelta) -> Self {
        Self {
            instrument:      instrument.into(),
            open:            Decimal::ZERO,
            high:            Decimal::ZERO,
            high_time:       start,
            low:             Decimal::ZERO,
            low_time:        start,
            close:           Decimal::ZERO,
            start,
            end:             start + duration,
            duration,
            gaps:            false,
            price_data_seen: false,
            closed:          false,
            last_received:   None,
        }
    }

    /// Builds an already closed candle from pre-aggregated OHLC values, as
    /// delivered by historical price sources. High and low are stamped with
    /// `start`.
    #[allow(clippy::too_many_arguments)]
    pub fn from_ohlc(
        instrument: impl Into<String>,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        duration: TimeDelta,
        open: Decimal,
        high: Decimal,
        low: Decimal,
        close: Decimal,
    ) -> Self {
        Self {
            instrument:      instrument.into(),
            open,
            high,
            high_time:       start,
            low,
            low_time:        start,
            close,
            start,
            end,
            duration,
            gaps:            false,
            price_data_seen: true,
            closed:          true,
            last_received:   Some(end),
        }
    }

    // ─── State transitions ────────────────────────────────────────────────────

    /// Offers a price to the candle. Returns `true` if it was absorbed.
    ///
    /// Returns `false` without mutation when already closed. A price at or
    /// after `end` closes the candle and is rejected.
    pub fn new_price(&mut self, price: Decimal, now: DateTime<Utc>) -> bool {
        if self.closed {
            return false;
        }

        if now >= self.end {
            self.closed = true;
            return false;
        }

        if !self.price_data_seen {
            self.open      = price;
            self.high      = price;
            self.high_time = now;
            self.low       = price;
            self.low_time  = now;
        } else {
            if price > self.high {
                self.high      = price;
                self.high_time = now;
            } else if price < self.low {
                self.low      = price;
                self.low_time = now;
            }

            if let Some(last) = self.last_received {
                if now - last > TimeDelta::seconds(MAX_GAP_BETWEEN_TICKS_SECS) {
                    self.gaps = true;
                }
            }
        }

        self.last_received   = Some(now);
        self.close           = price;
        self.price_data_seen = true;

        true
    }

    /// Closes the candle regardless of elapsed time. `end` becomes the
    /// timestamp of the last admitted price; a candle without data keeps its
    /// nominal end.
    pub fn force_close(&mut self) {
        self.closed = true;
        if let Some(last) = self.last_received {
            self.end = last;
        }
    }

    // ─── Flags ────────────────────────────────────────────────────────────────

    #[inline]
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    #[inline]
    pub fn has_gaps(&self) -> bool {
        self.gaps
    }

    #[inline]
    pub fn has_price_data(&self) -> bool {
        self.price_data_seen
    }

    pub fn last_received(&self) -> Option<DateTime<Utc>> {
        self.last_received
    }

    pub fn validate(&self) -> Result<(), CandleError> {
        if !self.price_data_seen {
            return Err(CandleError::NoPriceData);
        }
        if self.low > self.high {
            return Err(CandleError::LowAboveHigh);
        }
        if self.open > self.high {
            return Err(CandleError::OpenAboveHigh);
        }
        if self.open < self.low {
            return Err(CandleError::OpenBelowLow);
        }
        if self.close > self.high {
            return Err(CandleError::CloseAboveHigh);
        }
        if self.close < self.low {
            return Err(CandleError::CloseBelowLow);
        }
        if self.end < self.start {
            return Err(CandleError::EndBeforeStart);
        }
        if self.instrument.is_empty() {
            return Err(CandleError::EmptyInstrument);
        }
        Ok(())
    }

    // ─── Derived queries ──────────────────────────────────────────────────────

    /// Close vs open in percent, 4 decimal places.
    pub fn performance_in_percentage(&self) -> Decimal {
        percent_of(self.close - self.open, self.open)
    }

    /// High-low range vs open in percent, 4 decimal places.
    pub fn volatility_in_percentage(&self) -> Decimal {
        percent_of(self.high - self.low, self.open)
    }

    pub fn performance_open_to_high(&self) -> Decimal {
        percent_of(self.high - self.open, self.open)
    }

    pub fn performance_open_to_low(&self) -> Decimal {
        percent_of(self.low - self.open, self.open)
    }

    pub fn reversion_from_high(&self) -> Decimal {
        percent_of(self.close - self.high, self.high)
    }

    pub fn age(&self, now: DateTime<Utc>) -> TimeDelta {
        now - self.start
    }

    /// Re-expands the candle into open, low/high by occurrence, close.
    /// High goes first when both share a timestamp.
    pub fn to_ticks(&self) -> [Tick; 4] {
        let open  = self.synthetic_tick(self.open, self.start);
        let high  = self.synthetic_tick(self.high, self.high_time);
        let low   = self.synthetic_tick(self.low, self.low_time);
        let close = self.synthetic_tick(self.close, self.end);

        if self.high_time > self.low_time {
            [open, low, high, close]
        } else {
            [open, high, low, close]
        }
    }

    fn synthetic_tick(&self, price: Decimal, time: DateTime<Utc>) -> Tick {
        Tick::new(self.instrument.clone(), time, price, price)
    }
}

impl fmt::Display for Candle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "OHLC({}, Open={} High={} Low={} Close={}, Start={} End={})",
            self.instrument, self.open, self.high, self.low, self.close, self.start, self.end
        )
    }
}

// ─── Transforms ───────────────────────────────────────────────────────────────

/// Smoothed candle from two adjacent raw candles. Inputs are untouched.
pub fn to_heikin_ashi(previous: &Candle, current: &Candle) -> Candle {
    let mut ha = current.clone();
    ha.open  = (previous.open + previous.close) / dec!(2);
    ha.close = (current.open + current.close + current.high + current.low) / dec!(4);
    ha.high  = current.high.max(ha.open).max(ha.close);
    ha.low   = current.low.min(ha.open).min(ha.close);
    ha
}

/// Sorts candles ascending by `end`.
pub fn sort_by_end(candles: &mut [Candle]) {
    candles.sort_by_key(|c| c.end);
}

fn smooth_candle_start(ts: DateTime<Utc>, duration: TimeDelta) -> DateTime<Utc> {
    ts.duration_trunc(duration).unwrap_or(ts)
}

/// Truncates the local wall-clock time, then maps it back to UTC. Falls back
/// to UTC truncation when the local start does not exist (DST gap).
fn local_candle_start(ts: DateTime<Utc>, duration: TimeDelta, tz: Tz) -> DateTime<Utc> {
    ts.with_timezone(&tz)
        .naive_local()
        .duration_trunc(duration)
        .ok()
        .and_then(|local| tz.from_local_datetime(&local).earliest())
        .map(|start| start.with_timezone(&Utc))
        .unwrap_or_else(|| smooth_candle_start(ts, duration))
}

fn percent_of(diff: Decimal, base: Decimal) -> Decimal {
    diff.checked_div(base)
        .map(|ratio| (ratio * HUNDRED).round_dp(4))
        .unwrap_or(Decimal::ZERO)
}

pub(crate) mod duration_secs {
    use chrono::TimeDelta;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(duration: &TimeDelta, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_i64(duration.num_seconds())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<TimeDelta, D::Error> {
        let secs = i64::deserialize(deserializer)?;
        TimeDelta::try_seconds(secs).ok_or_else(|| serde::de::Error::custom("duration out of range"))
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────
