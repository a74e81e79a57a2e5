//! # broker::report
//!
//! Writes `backtesting_result.csv`: one row per position, closed positions
//! first and still-open ones after, with a running pip total down the file.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use rust_decimal::Decimal;
use tracing::info;

use crate::error::FatalError;
use crate::helper::{cent_to_pips, format_duration};
use crate::models::{Direction, Position, Tick};

pub const DEFAULT_REPORT_PATH: &str = "./results/backtesting_result.csv";

const HEADER: [&str; 19] = [
    "#",
    "Weekday",
    "BuyTime",
    "SellTime",
    "Direction",
    "Size",
    "BuyPrice",
    "SellPrice",
    "TargetPrice",
    "StopLossPrice",
    "TargePips",
    "StopLossPips",
    "PerformanceInPips",
    "TotalPerformanceInPips",
    "MaxSurgePips",
    "MaxDrawdownPips",
    "Duration",
    "TodayPerf",
    "GapToSMA",
];

const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

#[derive(Debug, Clone)]
pub struct ReportWriter {
    path: PathBuf,
    tz:   Tz,
}

impl ReportWriter {
    pub fn new(path: impl Into<PathBuf>, tz: Tz) -> Self {
        Self { path: path.into(), tz }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Open positions are valued at `last_tick`; without one they count zero pips.
    pub fn write(&self, closed: &[Position], open: &[Position], last_tick: Option<&Tick>) -> Result<(), FatalError> {
        if let Some(dir) = self.path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir).map_err(|e| io_error(dir, e))?;
        }

        let mut writer = csv::Writer::from_path(&self.path).map_err(|e| io_error(&self.path, e))?;
        writer.write_record(HEADER).map_err(|e| io_error(&self.path, e))?;

        let mut total_pips = Decimal::ZERO;
        for (i, position) in closed.iter().chain(open).enumerate() {
            let record = self.row(i + 1, position, last_tick, &mut total_pips);
            writer.write_record(&record).map_err(|e| io_error(&self.path, e))?;
        }
        writer.flush().map_err(|e| io_error(&self.path, e))?;

        info!(
            path   = %self.path.display(),
            closed = closed.len(),
            open   = open.len(),
            "📄 [REPORT] Backtest result written"
        );
        Ok(())
    }

    fn row(&self, number: usize, position: &Position, last_tick: Option<&Tick>, total_pips: &mut Decimal) -> Vec<String> {
        let sign = match position.direction {
            Direction::Long  => Decimal::ONE,
            Direction::Short => Decimal::NEGATIVE_ONE,
        };
        let target_pips = position
            .target_price
            .map(|target| cent_to_pips(target - position.buy_price).round_dp(2) * sign);
        let stop_loss_pips = position
            .stop_loss_price
            .map(|stop| cent_to_pips(position.buy_price - stop).round_dp(2) * sign);

        let perf_pips = match (position.is_open(), last_tick) {
            (false, _)         => cent_to_pips(position.pnl(Decimal::ZERO, Decimal::ZERO)),
            (true, Some(tick)) => cent_to_pips(position.pnl(tick.bid, tick.ask)),
            (true, None)       => Decimal::ZERO,
        };
        *total_pips += perf_pips;

        let duration = match (position.is_open(), last_tick) {
            (true, Some(tick)) => position.age(tick.time),
            _                  => position.duration(),
        };

        let buy_local = position.buy_time.with_timezone(&self.tz);
        vec![
            number.to_string(),
            buy_local.format("%A").to_string(),
            buy_local.format(TIME_FORMAT).to_string(),
            position.sell_time.map(|t| self.local(t)).unwrap_or_default(),
            position.direction.to_string(),
            format!("{:.1}", position.size),
            price(position.buy_price),
            opt(position.sell_price.map(price)),
            opt(position.target_price.map(price)),
            opt(position.stop_loss_price.map(price)),
            opt(target_pips.map(|p| p.normalize().to_string())),
            opt(stop_loss_pips.map(|p| p.normalize().to_string())),
            perf_pips.round_dp(2).normalize().to_string(),
            total_pips.round_dp(2).normalize().to_string(),
            format!("{:.2}", position.max_surge),
            format!("{:.2}", position.max_drawdown),
            format_duration(duration),
            position.today_performance.round_dp(2).normalize().to_string(),
            position.gap_to_sma.round_dp(5).normalize().to_string(),
        ]
    }

    fn local(&self, time: DateTime<Utc>) -> String {
        time.with_timezone(&self.tz).format(TIME_FORMAT).to_string()
    }
}

fn price(value: Decimal) -> String {
    value.round_dp(5).normalize().to_string()
}

fn opt(value: Option<String>) -> String {
    value.unwrap_or_default()
}

fn io_error(path: &Path, err: impl std::fmt::Display) -> FatalError {
    FatalError::Io(format!("{}: {err}", path.display()))
}

// ─── Tests ────────────────────────────────────────────────────────────────────
