//! # helper
//!
//! Price arithmetic shared by the wallet, the report writer and strategies.
//! One pip is 1/10000 of a price unit.

use chrono::TimeDelta;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use crate::models::Direction;

pub const PIPS_FACTOR: Decimal = dec!(10000);
const HUNDRED: Decimal = dec!(100);

/// Pips → price distance.
#[inline]
pub fn pips_to_cent(pips: Decimal) -> Decimal {
    pips / PIPS_FACTOR
}

/// Price distance → pips.
#[inline]
pub fn cent_to_pips(cent: Decimal) -> Decimal {
    cent * PIPS_FACTOR
}

pub fn stop_loss_price_by_percentage(price: Decimal, percentage: Decimal, direction: Direction) -> Decimal {
    let offset = price / HUNDRED * percentage;
    match direction {
        Direction::Long  => (price - offset).round_dp(6),
        Direction::Short => (price + offset).round_dp(6),
    }
}

pub fn target_price_by_percentage(price: Decimal, percentage: Decimal, direction: Direction) -> Decimal {
    let offset = price / HUNDRED * percentage;
    match direction {
        Direction::Long  => (price + offset).round_dp(6),
        Direction::Short => (price - offset).round_dp(6),
    }
}

/// Distance from `from` to `to` in percent of `from`. Zero when `from` is zero.
pub fn distance_in_percentage(from: Decimal, to: Decimal) -> Decimal {
    if from.is_zero() {
        return Decimal::ZERO;
    }
    (to - from) / from * HUNDRED
}

/// Nearest-rank percentile of an ascending slice. `None` for an empty slice.
pub fn percentile(sorted: &[f64], percentile: u32) -> Option<f64> {
    if sorted.is_empty() {
        return None;
    }
    let pos = sorted.len() * percentile as usize / 100;
    sorted.get(pos.clamp(1, sorted.len()) - 1).copied()
}

pub fn median(sorted: &[f64]) -> Option<f64> {
    percentile(sorted, 50)
}

/// Human readable duration, e.g. `1h 30m 0s`, `45m 10s`, `12s`.
pub fn format_duration(duration: TimeDelta) -> String {
    let sign = if duration < TimeDelta::zero() { "-" } else { "" };
    let secs = duration.num_seconds().abs();
    let (h, m, s) = (secs / 3600, secs % 3600 / 60, secs % 60);
    match (h, m) {
        (0, 0) => format!("{sign}{s}s"),
        (0, _) => format!("{sign}{m}m {s}s"),
        _      => format!("{sign}{h}h {m}m {s}s"),
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────
