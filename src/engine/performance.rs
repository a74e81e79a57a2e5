//! # engine::performance
//!
//! **Performance Tracking** aggregates the closed-position list
//! of a run. Produces a [`PerformanceRecord`] that is logged as a summary and
//! handed to the [`CandleStore`](crate::store::CandleStore) for persistence.
//!
//! A trade counts as a win when its percentage performance is `>= 0`.

use std::collections::BTreeMap;

use chrono::{DateTime, Datelike, TimeDelta, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::engine::candle_builder::duration_secs;
use crate::error::FatalError;
use crate::helper::format_duration;
use crate::models::{Direction, Position};

const PIPS_FACTOR: f64 = 10_000.0;

// ─── Run info ─────────────────────────────────────────────────────────────────

/// Static facts about the run the record describes.
#[derive(Debug, Clone, PartialEq)]
pub struct RunInfo {
    pub strategy_name:            String,
    /// Human readable strategy configuration.
    pub strategy:                 String,
    pub instrument:               String,
    pub candle_duration:          TimeDelta,
    pub max_concurrent_positions: usize,
}

// ─── Record ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceRecord {
    pub backtesting_id:                 String,
    pub strategy_name:                  String,
    pub strategy:                       String,
    pub instrument:                     String,
    #[serde(with = "duration_secs")]
    pub candle_duration:                TimeDelta,

    pub total_performance_in_pips:      f64,
    pub avg_performance_in_pips:        f64,
    pub max_aggregate_drawdown_in_pips: f64,
    pub max_loss_in_pips:               f64,
    pub max_loss_in_percent:            f64,
    pub max_win_in_pips:                f64,
    pub max_win_in_percent:             f64,
    pub trades_win_ratio_in_percent:    f64,

    pub trades:                         usize,
    pub trades_win:                     usize,
    pub trades_loss:                    usize,
    pub trades_loss_long:               usize,
    pub trades_loss_short:              usize,
    pub trades_long:                    usize,
    pub trades_short:                   usize,
    pub max_consecutive_trades_loss:    usize,
    pub max_concurrent_positions:       usize,

    pub first_trade:                    DateTime<Utc>,
    pub last_trade:                     DateTime<Utc>,
    #[serde(with = "duration_secs")]
    pub total_time_in_market:           TimeDelta,
    #[serde(with = "duration_secs")]
    pub avg_time_in_market:             TimeDelta,
    pub avg_trade_duration_in_seconds:  f64,
    pub total_exposure_in_percent:      f64,

    /// JSON encoded run configuration, when the caller provides one.
    #[serde(default)]
    pub config_json:                    Option<String>,
    pub closed_positions:               Vec<Position>,
}

impl PerformanceRecord {
    /// Aggregates `closed` (ordered by buy time). `None` when nothing closed.
    pub fn from_closed_positions(info: &RunInfo, closed: Vec<Position>) -> Result<Option<Self>, FatalError> {
        let (Some(first), Some(last)) = (closed.first(), closed.last()) else {
            return Ok(None);
        };
        let first_trade = first.buy_time;
        let last_trade  = last.buy_time;

        let trades = closed.len();
        let total_performance_in_pips = total_performance_in_pips(&closed);
        let total_time_in_market = total_time_in_market(&closed);
        let avg_time_in_market = total_time_in_market / trades as i32;

        let trades_win = wins(&closed, Direction::Long) + wins(&closed, Direction::Short);
        let trades_loss_long  = losses(&closed, Direction::Long);
        let trades_loss_short = losses(&closed, Direction::Short);

        let record = Self {
            backtesting_id:                 format!("strategy_{}_{}", info.strategy_name, info.instrument),
            strategy_name:                  info.strategy_name.clone(),
            strategy:                       info.strategy.clone(),
            instrument:                     info.instrument.clone(),
            candle_duration:                info.candle_duration,
            total_performance_in_pips,
            avg_performance_in_pips:        total_performance_in_pips / trades as f64,
            max_aggregate_drawdown_in_pips: max_aggregate_drawdown_in_pips(&closed),
            max_loss_in_pips:               max_loss_in_pips(&closed),
            max_loss_in_percent:            max_loss_in_percent(&closed),
            max_win_in_pips:                max_win_in_pips(&closed),
            max_win_in_percent:             max_win_in_percent(&closed),
            trades_win_ratio_in_percent:    trades_win as f64 * 100.0 / trades as f64,
            trades,
            trades_win,
            trades_loss:                    trades_loss_long + trades_loss_short,
            trades_loss_long,
            trades_loss_short,
            trades_long:                    count_direction(&closed, Direction::Long),
            trades_short:                   count_direction(&closed, Direction::Short),
            max_consecutive_trades_loss:    max_consecutive_losses(&closed),
            max_concurrent_positions:       info.max_concurrent_positions,
            first_trade,
            last_trade,
            total_time_in_market,
            avg_time_in_market,
            avg_trade_duration_in_seconds:  total_time_in_market.num_milliseconds() as f64 / 1000.0 / trades as f64,
            total_exposure_in_percent:      total_exposure_in_percent(total_time_in_market, first_trade, last_trade),
            config_json:                    None,
            closed_positions:               closed,
        };

        record.reconcile()?;
        Ok(Some(record))
    }

    /// Win/loss and long/short counts must both add up to the trade count.
    pub fn reconcile(&self) -> Result<(), FatalError> {
        if self.trades_win + self.trades_loss != self.trades {
            return Err(FatalError::Bookkeeping(format!(
                "TradesWin({}) + TradesLoss({}) != Trades({})",
                self.trades_win, self.trades_loss, self.trades
            )));
        }
        if self.trades_long + self.trades_short != self.trades {
            return Err(FatalError::Bookkeeping(format!(
                "TradesLong({}) + TradesShort({}) != Trades({})",
                self.trades_long, self.trades_short, self.trades
            )));
        }
        Ok(())
    }

    pub fn log_summary(&self) {
        info!("{:>25}: {}", "Instrument", self.instrument);
        info!("{:>25}: {}", "Strategy", self.strategy);
        info!("{:>25}: {}", "Candle duration", format_duration(self.candle_duration));
        info!(
            "{:>25}: {} -> {}",
            "Period",
            self.first_trade.format("%d.%m.%Y"),
            self.last_trade.format("%d.%m.%Y")
        );
        info!("{:>25}: {} ({} long, {} short)", "Total positions", self.trades, self.trades_long, self.trades_short);
        info!(
            "{:>25}: {} ({:.2}%)",
            "Total time in market",
            format_duration(self.total_time_in_market),
            self.total_exposure_in_percent
        );
        info!("{:>25}: {}", "AVG time in market", format_duration(self.avg_time_in_market));
        info!("{:>25}: {} ({:.2}%)", "Profit positions", self.trades_win, self.trades_win_ratio_in_percent);
        info!("{:>25}: {}", "Loss positions", self.trades_loss);
        info!("{:>25}: {}", "Loss positions long", self.trades_loss_long);
        info!("{:>25}: {}", "Loss positions short", self.trades_loss_short);
        info!("{:>25}: {}", "Max consecutive losses", self.max_consecutive_trades_loss);
        info!("{:>25}: {}", "Max concurrent positions", self.max_concurrent_positions);
        info!(
            "{:>25}: {:.2}% {:.2} ({:.2} pips)",
            "Max win",
            self.max_win_in_percent,
            self.max_win_in_pips / PIPS_FACTOR,
            self.max_win_in_pips
        );
        info!(
            "{:>25}: {:.2}% {:.2} ({:.2} pips)",
            "Max loss",
            self.max_loss_in_percent,
            self.max_loss_in_pips / PIPS_FACTOR,
            self.max_loss_in_pips
        );
        info!("{:>25}: {:.2} pips", "Max aggregate drawdown", self.max_aggregate_drawdown_in_pips);
        info!(
            "{:>25}: {:.2} ({:.2} pips)",
            "Total performance",
            self.total_performance_in_pips / PIPS_FACTOR,
            self.total_performance_in_pips
        );
        info!(
            "{:>25}: {:.2} ({:.2} pips)",
            "AVG Performance",
            self.avg_performance_in_pips / PIPS_FACTOR,
            self.avg_performance_in_pips
        );
    }
}

// ─── Aggregates ───────────────────────────────────────────────────────────────

fn perf_pips(position: &Position) -> f64 {
    position.performance_absolute(Decimal::ZERO, Decimal::ZERO) * PIPS_FACTOR
}

fn perf_percent(position: &Position) -> f64 {
    position.performance_in_percentage(Decimal::ZERO, Decimal::ZERO)
}

fn count_direction(closed: &[Position], direction: Direction) -> usize {
    closed.iter().filter(|p| p.direction == direction).count()
}

fn wins(closed: &[Position], direction: Direction) -> usize {
    closed
        .iter()
        .filter(|p| p.direction == direction && perf_percent(p) >= 0.0)
        .count()
}

fn losses(closed: &[Position], direction: Direction) -> usize {
    closed
        .iter()
        .filter(|p| p.direction == direction && perf_percent(p) < 0.0)
        .count()
}

fn max_win_in_pips(closed: &[Position]) -> f64 {
    closed.iter().map(perf_pips).fold(0.0, f64::max)
}

fn max_loss_in_pips(closed: &[Position]) -> f64 {
    closed.iter().map(perf_pips).fold(0.0, f64::min)
}

fn max_win_in_percent(closed: &[Position]) -> f64 {
    closed.iter().map(perf_percent).fold(0.0, f64::max)
}

fn max_loss_in_percent(closed: &[Position]) -> f64 {
    closed.iter().map(perf_percent).fold(0.0, f64::min)
}

/// Longest run of losing trades in the given order.
pub fn max_consecutive_losses(closed: &[Position]) -> usize {
    let mut max_streak = 0;
    let mut streak = 0;
    for position in closed {
        if perf_percent(position) < 0.0 {
            streak += 1;
            max_streak = max_streak.max(streak);
        } else {
            streak = 0;
        }
    }
    max_streak
}

pub fn total_performance_in_pips(closed: &[Position]) -> f64 {
    closed.iter().map(perf_pips).sum()
}

/// Peak-to-trough decline of the cumulative pip curve.
pub fn max_aggregate_drawdown_in_pips(closed: &[Position]) -> f64 {
    let mut running_pips = 0.0_f64;
    let mut peak_pips    = 0.0_f64;
    let mut max_drawdown = 0.0_f64;

    for position in closed {
        running_pips += perf_pips(position);
        if running_pips > peak_pips { peak_pips = running_pips; }
        let drawdown = peak_pips - running_pips;
        if drawdown > max_drawdown { max_drawdown = drawdown; }
    }
    max_drawdown
}

pub fn total_time_in_market(closed: &[Position]) -> TimeDelta {
    closed.iter().map(Position::duration).fold(TimeDelta::zero(), |acc, d| acc + d)
}

/// Time in market relative to the span between first and last buy.
/// Zero when the span is empty.
pub fn total_exposure_in_percent(time_in_market: TimeDelta, first: DateTime<Utc>, last: DateTime<Utc>) -> f64 {
    let span = (last - first).num_milliseconds();
    if span <= 0 {
        return 0.0;
    }
    time_in_market.num_milliseconds() as f64 * 100.0 / span as f64
}

// ─── By note ──────────────────────────────────────────────────────────────────

/// Pip performance grouped by `"{buy year}-{note}"`, sorted by key.
pub fn performance_by_note(closed: &[Position]) -> BTreeMap<String, f64> {
    let mut by_note = BTreeMap::new();
    for position in closed {
        let key = format!("{}-{}", position.buy_time.year(), position.note);
        *by_note.entry(key).or_insert(0.0) += perf_pips(position);
    }
    by_note
}

pub fn log_performance_by_note(closed: &[Position]) {
    for (note, pips) in performance_by_note(closed) {
        info!("{:>25}: {} {:.2} pips", "Total profit for note", note, pips);
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::position::tests::make_position;
    use rust_decimal_macros::dec;

    fn make_win() -> Position {
        make_position(Direction::Long, dec!(1), Some(dec!(2)))
    }

    fn make_loss() -> Position {
        make_position(Direction::Long, dec!(2), Some(dec!(1)))
    }

    fn make_info() -> RunInfo {
        RunInfo {
            strategy_name:            "heikin_ashi".into(),
            strategy:                 "HeikinAshi(target=1%)".into(),
            instrument:               "EURUSD".into(),
            candle_duration:          TimeDelta::hours(1),
            max_concurrent_positions: 3,
        }
    }

    #[test]
    fn test_max_consecutive_losses() {
        let closed = vec![make_win(), make_loss(), make_loss(), make_win(), make_win(), make_loss()];
        assert_eq!(max_consecutive_losses(&closed), 2);
        assert_eq!(max_consecutive_losses(&[make_loss(), make_win(), make_loss()]), 1);
        assert_eq!(max_consecutive_losses(&[]), 0);
    }

    #[test]
    fn test_max_aggregate_drawdown() {
        // +1.0, -1.0, -1.0, +1.0 → peak 10000, trough -10000
        let closed = vec![make_win(), make_loss(), make_loss(), make_win()];
        assert_eq!(max_aggregate_drawdown_in_pips(&closed), 20_000.0);
        assert_eq!(max_aggregate_drawdown_in_pips(&[make_win(), make_win()]), 0.0);
    }

    #[test]
    fn test_record_counts() {
        let mut short_win = make_position(Direction::Short, dec!(2), Some(dec!(1.5)));
        short_win.buy_time += TimeDelta::hours(10);
        short_win.sell_time = Some(short_win.buy_time + TimeDelta::hours(2));
        let closed = vec![make_win(), make_loss(), short_win];

        let record = PerformanceRecord::from_closed_positions(&make_info(), closed)
            .unwrap()
            .unwrap();

        assert_eq!(record.trades, 3);
        assert_eq!(record.trades_win, 2);
        assert_eq!(record.trades_loss, 1);
        assert_eq!(record.trades_loss_long, 1);
        assert_eq!(record.trades_loss_short, 0);
        assert_eq!(record.trades_long, 2);
        assert_eq!(record.trades_short, 1);
        assert_eq!(record.max_win_in_pips, 10_000.0);
        assert_eq!(record.max_loss_in_pips, -10_000.0);
        assert_eq!(record.max_win_in_percent, 100.0);
        assert_eq!(record.max_loss_in_percent, -50.0);
        assert_eq!(record.total_performance_in_pips, 5_000.0);
        assert_eq!(record.max_concurrent_positions, 3);
        assert_eq!(record.total_time_in_market, TimeDelta::hours(6));
        assert_eq!(record.avg_time_in_market, TimeDelta::hours(2));
        assert_eq!(record.avg_trade_duration_in_seconds, 7200.0);
        assert_eq!(record.total_exposure_in_percent, 60.0);
        record.log_summary();
    }

    #[test]
    fn test_empty_history_has_no_record() {
        assert_eq!(PerformanceRecord::from_closed_positions(&make_info(), vec![]), Ok(None));
    }

    #[test]
    fn test_reconcile_mismatch_is_fatal() {
        let mut record = PerformanceRecord::from_closed_positions(&make_info(), vec![make_win(), make_loss()])
            .unwrap()
            .unwrap();
        record.trades_win = 2;
        let err = record.reconcile().unwrap_err();
        assert_eq!(err.to_string(), "TradesWin(2) + TradesLoss(1) != Trades(2)");

        record.trades_win = 1;
        record.trades_short = 1;
        let err = record.reconcile().unwrap_err();
        assert_eq!(err.to_string(), "TradesLong(2) + TradesShort(1) != Trades(2)");
    }

    #[test]
    fn test_zero_span_exposure() {
        let t = make_win().buy_time;
        assert_eq!(total_exposure_in_percent(TimeDelta::hours(1), t, t), 0.0);
    }

    #[test]
    fn test_performance_by_note() {
        let mut a = make_win();
        a.note = "breakout".into();
        let mut b = make_loss();
        b.note = "breakout".into();
        let mut c = make_win();
        c.note = "reversal".into();

        let by_note = performance_by_note(&[a, b, c]);
        assert_eq!(by_note.len(), 2);
        assert_eq!(by_note["2021-breakout"], 0.0);
        assert_eq!(by_note["2021-reversal"], 10_000.0);
    }
}
