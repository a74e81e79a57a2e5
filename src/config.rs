//! # config: Backtest runner configuration from environment variables
//!
//! | Variable                | Default                             |
//! |-------------------------|-------------------------------------|
//! | `INSTRUMENT`            | `EURUSD`                            |
//! | `STRATEGY`              | `heikin_ashi`                       |
//! | `CANDLE_DURATION`       | `1h`                                |
//! | `PRICE_SOURCE`          | `csv`                               |
//! | `PRICE_CSV_FILE`        | required for `csv`                  |
//! | `PRICE_API_URL`         | per source                          |
//! | `PERIOD_FROM`           | required for `coinbase`             |
//! | `PERIOD_TO`             | required for `coinbase`             |
//! | `INITIAL_BALANCE`       | `1000`                              |
//! | `TRADING_FEE_PERCENT`   | `0.01`                              |
//! | `SLIPPAGE`              | `0`                                 |
//! | `SPREAD`                | `0`                                 |
//! | `CURRENCY_CODE`         | `USD`                               |
//! | `DISPLAY_TZ`            | `Europe/Berlin`                     |
//! | `RESULT_CSV`            | `./results/backtesting_result.csv`  |
//! | `MAX_TICK_JUMP_PERCENT` | disabled                            |
//! | `MONITOR_BIND_ADDR`     | disabled                            |

use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{bail, Context};
use chrono::{DateTime, TimeDelta, Utc};
use chrono_tz::Tz;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde_json::json;

use crate::broker::feed::{CandleSource, CoinbaseSource, CsvCandleSource, PatternTradingSource, COINBASE_URL, PATTERN_TRADING_URL};
use crate::broker::report::DEFAULT_REPORT_PATH;
use crate::engine::paper_wallet::WalletConfig;
use crate::engine::trader::TraderConfig;
use crate::helper::format_duration;

/// Where the backtest gets its candles from.
#[derive(Debug, Clone, PartialEq)]
pub enum PriceSource {
    Csv { path: PathBuf },
    PatternTrading { base_url: String },
    Coinbase { base_url: String, from: DateTime<Utc>, to: DateTime<Utc> },
}

#[derive(Debug, Clone)]
pub struct Config {
    pub instrument:            String,
    /// Registry name of the strategy to run.
    pub strategy:              String,
    pub candle_duration:       TimeDelta,
    pub price_source:          PriceSource,
    pub wallet:                WalletConfig,
    pub currency_code:         String,
    pub display_tz:            Tz,
    pub result_csv:            PathBuf,
    pub max_tick_jump_percent: Option<Decimal>,
    /// Serve the monitor API after the run when set.
    pub monitor_bind_addr:     Option<SocketAddr>,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) with an injectable variable source.
    pub fn from_lookup(var: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let get = |key: &str, default: &str| var(key).unwrap_or_else(|| default.to_string());

        let candle_duration = parse_duration(&get("CANDLE_DURATION", "1h"))
            .context("CANDLE_DURATION must look like 30m, 1h, 1d or plain seconds")?;

        let period = |key: &str| -> anyhow::Result<Option<DateTime<Utc>>> {
            var(key)
                .map(|v| DateTime::parse_from_rfc3339(&v).map(|t| t.with_timezone(&Utc)))
                .transpose()
                .with_context(|| format!("{key} must be an RFC 3339 timestamp"))
        };
        let period_from = period("PERIOD_FROM")?;
        let period_to = period("PERIOD_TO")?;

        let price_source = match get("PRICE_SOURCE", "csv").to_lowercase().as_str() {
            "csv" => PriceSource::Csv {
                path: var("PRICE_CSV_FILE")
                    .context("PRICE_CSV_FILE is required when PRICE_SOURCE=csv")?
                    .into(),
            },
            "pattern_trading" => PriceSource::PatternTrading {
                base_url: get("PRICE_API_URL", PATTERN_TRADING_URL),
            },
            "coinbase" => {
                let (Some(from), Some(to)) = (period_from, period_to) else {
                    bail!("PERIOD_FROM and PERIOD_TO are required when PRICE_SOURCE=coinbase");
                };
                PriceSource::Coinbase { base_url: get("PRICE_API_URL", COINBASE_URL), from, to }
            }
            other => bail!("Unknown PRICE_SOURCE: '{other}'. Use 'csv', 'pattern_trading' or 'coinbase'"),
        };

        let decimal = |key: &str, default: Decimal| -> anyhow::Result<Decimal> {
            var(key)
                .map(|v| Decimal::from_str(v.trim()))
                .transpose()
                .with_context(|| format!("{key} must be a decimal number"))
                .map(|v| v.unwrap_or(default))
        };

        let wallet = WalletConfig {
            initial_balance:     decimal("INITIAL_BALANCE", dec!(1000))?,
            trading_fee_percent: decimal("TRADING_FEE_PERCENT", dec!(0.01))?,
            slippage:            decimal("SLIPPAGE", Decimal::ZERO)?,
            spread:              decimal("SPREAD", Decimal::ZERO)?,
        };

        let tz_name = get("DISPLAY_TZ", "Europe/Berlin");
        let display_tz: Tz = tz_name
            .parse()
            .map_err(|e| anyhow::anyhow!("DISPLAY_TZ '{tz_name}' is not a known timezone: {e}"))?;

        let max_tick_jump_percent = var("MAX_TICK_JUMP_PERCENT")
            .map(|v| Decimal::from_str(v.trim()))
            .transpose()
            .context("MAX_TICK_JUMP_PERCENT must be a decimal number")?;

        let monitor_bind_addr = var("MONITOR_BIND_ADDR")
            .map(|v| v.parse::<SocketAddr>())
            .transpose()
            .context("MONITOR_BIND_ADDR must be host:port")?;

        Ok(Self {
            instrument: get("INSTRUMENT", "EURUSD"),
            strategy: get("STRATEGY", "heikin_ashi"),
            candle_duration,
            price_source,
            wallet,
            currency_code: get("CURRENCY_CODE", "USD"),
            display_tz,
            result_csv: get("RESULT_CSV", DEFAULT_REPORT_PATH).into(),
            max_tick_jump_percent,
            monitor_bind_addr,
        })
    }

    pub fn trader_config(&self) -> TraderConfig {
        TraderConfig {
            currency_code:         self.currency_code.clone(),
            display_tz:            self.display_tz,
            max_tick_jump_percent: self.max_tick_jump_percent,
            ..TraderConfig::new(&self.instrument)
        }
    }

    pub fn candle_source(&self) -> Arc<dyn CandleSource> {
        match &self.price_source {
            PriceSource::Csv { path } => {
                Arc::new(CsvCandleSource::new(path, &self.instrument, self.candle_duration))
            }
            PriceSource::PatternTrading { base_url } => Arc::new(PatternTradingSource::new(
                base_url,
                &self.instrument,
                self.candle_duration,
                duration_label(self.candle_duration),
            )),
            PriceSource::Coinbase { base_url, from, to } => Arc::new(CoinbaseSource::new(
                base_url,
                &self.instrument,
                self.candle_duration,
                *from,
                *to,
            )),
        }
    }

    /// Run settings embedded into the performance record.
    pub fn to_json(&self) -> String {
        let source = match &self.price_source {
            PriceSource::Csv { path }                 => json!({ "type": "csv", "path": path }),
            PriceSource::PatternTrading { base_url }  => json!({ "type": "pattern_trading", "url": base_url }),
            PriceSource::Coinbase { base_url, from, to } => {
                json!({ "type": "coinbase", "url": base_url, "from": from, "to": to })
            }
        };
        json!({
            "instrument":            self.instrument,
            "strategy":              self.strategy,
            "candle_duration":       format_duration(self.candle_duration),
            "price_source":          source,
            "initial_balance":       self.wallet.initial_balance,
            "trading_fee_percent":   self.wallet.trading_fee_percent,
            "slippage":              self.wallet.slippage,
            "spread":                self.wallet.spread,
            "currency_code":         self.currency_code,
            "display_tz":            self.display_tz.name(),
            "max_tick_jump_percent": self.max_tick_jump_percent,
        })
        .to_string()
    }
}

/// `30m`, `1h`, `1d`, `45s` or plain seconds.
pub fn parse_duration(value: &str) -> anyhow::Result<TimeDelta> {
    let value = value.trim();
    let split = value.find(|c: char| !c.is_ascii_digit()).unwrap_or(value.len());
    let (amount, unit) = value.split_at(split);

    let amount: i64 = amount.parse().with_context(|| format!("invalid duration '{value}'"))?;
    let duration = match unit {
        "" | "s" => TimeDelta::seconds(amount),
        "m"      => TimeDelta::minutes(amount),
        "h"      => TimeDelta::hours(amount),
        "d"      => TimeDelta::days(amount),
        other    => bail!("unknown duration unit '{other}' in '{value}'"),
    };
    if duration <= TimeDelta::zero() {
        bail!("duration '{value}' must be positive");
    }
    Ok(duration)
}

/// Inverse of [`parse_duration`] using the largest whole unit.
pub fn duration_label(duration: TimeDelta) -> String {
    let secs = duration.num_seconds();
    match secs {
        s if s % 86_400 == 0 => format!("{}d", s / 86_400),
        s if s % 3_600 == 0  => format!("{}h", s / 3_600),
        s if s % 60 == 0     => format!("{}m", s / 60),
        s                    => format!("{s}s"),
    }
}
