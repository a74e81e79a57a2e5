//! # broker::feed
//!
//! Historical candle sources for the backtest replay.
//!
//! | Source                    | Origin                                             |
//! |---------------------------|----------------------------------------------------|
//! | [`CsvCandleSource`]       | `instrument,start,end,open,high,low,close` file    |
//! | [`StoredCandleSource`]    | [`CandleStore`] query `(instrument, duration, period)` |
//! | [`PatternTradingSource`]  | `GET {base}/api/v1/candlesticks/{exchange}/{isin}/{period}` |
//! | [`CoinbaseSource`]        | `GET {base}/products/{id}/candles`                 |
//!
//! Retrieval runs on its own task ([`spawn_feed`]) and streams candles, in
//! chronological order, through a Tokio channel. A backtest has one chance to
//! get its dataset, so every retrieval failure is a [`FatalError::Feed`].

use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::engine::candle_builder::{sort_by_end, Candle};
use crate::error::FatalError;
use crate::store::CandleStore;

pub const PATTERN_TRADING_URL: &str = "https://api.pattern-trading.com";
pub const COINBASE_URL: &str = "https://api.exchange.coinbase.com";

const FEED_CHANNEL_CAPACITY: usize = 256;

// ─── Contract ─────────────────────────────────────────────────────────────────

#[async_trait]
pub trait CandleSource: Send + Sync {
    /// Short description for logs.
    fn describe(&self) -> String;

    /// The complete dataset, ordered by end.
    async fn fetch(&self) -> Result<Vec<Candle>, FatalError>;
}

/// Runs `source` on a background task. The receiver yields the candles in
/// order and closes when the dataset is exhausted; the handle resolves to
/// the number of candles sent or the retrieval error.
pub fn spawn_feed(source: Arc<dyn CandleSource>) -> (mpsc::Receiver<Candle>, JoinHandle<Result<usize, FatalError>>) {
    let (tx, rx) = mpsc::channel(FEED_CHANNEL_CAPACITY);

    let handle = tokio::spawn(async move {
        info!(source = %source.describe(), "📡 [FEED] Retrieving candles");
        let candles = source.fetch().await?;
        let total = candles.len();

        for candle in candles {
            if tx.send(candle).await.is_err() {
                debug!("[FEED] Receiver dropped, stopping replay");
                break;
            }
        }

        info!(total, "📡 [FEED] All candles sent");
        Ok(total)
    });

    (rx, handle)
}

fn feed_error(context: &str, err: impl std::fmt::Display) -> FatalError {
    FatalError::Feed(format!("{context}: {err}"))
}

fn parse_decimal(field: &str, value: &str) -> Result<Decimal, FatalError> {
    Decimal::from_str(value.trim()).map_err(|e| feed_error(&format!("invalid {field} '{value}'"), e))
}

// ─── CSV file ─────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct CsvCandleRow {
    instrument: String,
    start:      DateTime<Utc>,
    end:        DateTime<Utc>,
    open:       String,
    high:       String,
    low:        String,
    close:      String,
}

/// Candle file with a header row `instrument,start,end,open,high,low,close`.
/// Times are RFC 3339. Rows for other instruments are skipped.
#[derive(Debug, Clone)]
pub struct CsvCandleSource {
    path:       PathBuf,
    instrument: String,
    duration:   TimeDelta,
}

impl CsvCandleSource {
    pub fn new(path: impl Into<PathBuf>, instrument: impl Into<String>, duration: TimeDelta) -> Self {
        Self {
            path:       path.into(),
            instrument: instrument.into(),
            duration,
        }
    }

    fn read(&self) -> Result<Vec<Candle>, FatalError> {
        let mut reader = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .from_path(&self.path)
            .map_err(|e| feed_error(&format!("cannot open {}", self.path.display()), e))?;

        let mut candles = Vec::new();
        for (line, row) in reader.deserialize::<CsvCandleRow>().enumerate() {
            let row = row.map_err(|e| feed_error(&format!("row {}", line + 1), e))?;
            if row.instrument != self.instrument {
                continue;
            }
            let candle = Candle::from_ohlc(
                row.instrument,
                row.start,
                row.end,
                self.duration,
                parse_decimal("open", &row.open)?,
                parse_decimal("high", &row.high)?,
                parse_decimal("low", &row.low)?,
                parse_decimal("close", &row.close)?,
            );
            candle.validate()?;
            candles.push(candle);
        }

        sort_by_end(&mut candles);
        Ok(candles)
    }
}

#[async_trait]
impl CandleSource for CsvCandleSource {
    fn describe(&self) -> String {
        format!("csv:{}", self.path.display())
    }

    async fn fetch(&self) -> Result<Vec<Candle>, FatalError> {
        let source = self.clone();
        tokio::task::spawn_blocking(move || source.read())
            .await
            .map_err(|e| feed_error("csv reader task failed", e))?
    }
}

// ─── Candle store ─────────────────────────────────────────────────────────────

pub struct StoredCandleSource {
    store:      Arc<dyn CandleStore>,
    instrument: String,
    duration:   TimeDelta,
    from:       DateTime<Utc>,
    to:         DateTime<Utc>,
}

impl StoredCandleSource {
    pub fn new(
        store:      Arc<dyn CandleStore>,
        instrument: impl Into<String>,
        duration:   TimeDelta,
        from:       DateTime<Utc>,
        to:         DateTime<Utc>,
    ) -> Self {
        Self {
            store,
            instrument: instrument.into(),
            duration,
            from,
            to,
        }
    }
}

#[async_trait]
impl CandleSource for StoredCandleSource {
    fn describe(&self) -> String {
        format!("store:{}/{}s", self.instrument, self.duration.num_seconds())
    }

    async fn fetch(&self) -> Result<Vec<Candle>, FatalError> {
        self.store
            .candles(&self.instrument, self.duration, self.from, self.to)
            .await
            .map_err(|e| feed_error("stored candles query failed", format!("{e:#}")))
    }
}

// ─── Pattern-Trading ──────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct Candlestick {
    #[allow(dead_code)]
    isin:       String,
    #[allow(dead_code)]
    period:     String,
    #[allow(dead_code)]
    exchange:   String,
    open_time:  DateTime<Utc>,
    open:       Decimal,
    high:       Decimal,
    low:        Decimal,
    close:      Decimal,
    close_time: DateTime<Utc>,
}

/// Candlestick API keyed by exchange and ISIN. The instrument is written as
/// `EXCHANGE.ISIN`, e.g. `XETR.DE0007164600`.
pub struct PatternTradingSource {
    client:       reqwest::Client,
    base_url:     String,
    instrument:   String,
    duration:     TimeDelta,
    period_label: String,
}

impl PatternTradingSource {
    pub fn new(
        base_url:     impl Into<String>,
        instrument:   impl Into<String>,
        duration:     TimeDelta,
        period_label: impl Into<String>,
    ) -> Self {
        Self {
            client:       reqwest::Client::new(),
            base_url:     base_url.into(),
            instrument:   instrument.into(),
            duration,
            period_label: period_label.into(),
        }
    }

    fn url(&self) -> Result<String, FatalError> {
        let (exchange, isin) = split_instrument(&self.instrument)?;
        Ok(format!(
            "{}/api/v1/candlesticks/{}/{}/{}",
            self.base_url.trim_end_matches('/'),
            exchange,
            isin,
            self.period_label
        ))
    }
}

/// `EXCHANGE.ISIN` → `(EXCHANGE, ISIN)`.
pub fn split_instrument(instrument: &str) -> Result<(&str, &str), FatalError> {
    instrument
        .split_once('.')
        .filter(|(exchange, isin)| !exchange.is_empty() && !isin.is_empty())
        .ok_or_else(|| FatalError::Feed(format!("instrument '{instrument}' is not EXCHANGE.ISIN")))
}

/// Rebuilds each candlestick by replaying open, low, high at the open time
/// and the close at the close time.
fn parse_pattern_trading(body: &str, instrument: &str, duration: TimeDelta) -> Result<Vec<Candle>, FatalError> {
    let candlesticks: Vec<Candlestick> =
        serde_json::from_str(body).map_err(|e| feed_error("invalid candlestick payload", e))?;

    let mut candles = Vec::with_capacity(candlesticks.len());
    for stick in candlesticks {
        let mut candle = Candle::new(instrument, stick.open_time, duration, false);
        candle.new_price(stick.open, stick.open_time);
        candle.new_price(stick.low, stick.open_time);
        candle.new_price(stick.high, stick.open_time);
        candle.new_price(stick.close, stick.close_time);
        candle.force_close();
        candles.push(candle);
    }

    sort_by_end(&mut candles);
    Ok(candles)
}

#[async_trait]
impl CandleSource for PatternTradingSource {
    fn describe(&self) -> String {
        format!("pattern-trading:{}/{}", self.instrument, self.period_label)
    }

    async fn fetch(&self) -> Result<Vec<Candle>, FatalError> {
        let url = self.url()?;
        let body = self
            .client
            .get(&url)
            .send()
            .await
            .and_then(|resp| resp.error_for_status())
            .map_err(|e| feed_error(&format!("GET {url}"), e))?
            .text()
            .await
            .map_err(|e| feed_error("reading candlestick body", e))?;

        let candles = parse_pattern_trading(&body, &self.instrument, self.duration)?;
        info!(count = candles.len(), "📡 [FEED] Candles from Pattern-Trading");
        Ok(candles)
    }
}

// ─── Coinbase ─────────────────────────────────────────────────────────────────

/// `[time, low, high, open, close, volume]`
type HistoricRate = (i64, f64, f64, f64, f64, f64);

pub struct CoinbaseSource {
    client:     reqwest::Client,
    base_url:   String,
    product_id: String,
    duration:   TimeDelta,
    from:       DateTime<Utc>,
    to:         DateTime<Utc>,
}

impl CoinbaseSource {
    pub fn new(
        base_url:   impl Into<String>,
        product_id: impl Into<String>,
        duration:   TimeDelta,
        from:       DateTime<Utc>,
        to:         DateTime<Utc>,
    ) -> Self {
        Self {
            client:     reqwest::Client::new(),
            base_url:   base_url.into(),
            product_id: product_id.into(),
            duration,
            from,
            to,
        }
    }
}

fn to_decimal(value: f64) -> Result<Decimal, FatalError> {
    Decimal::from_f64(value).ok_or_else(|| FatalError::Feed(format!("price {value} is not representable")))
}

/// All four prices share the bucket start time; rows arrive newest first.
fn parse_coinbase(body: &str, instrument: &str, duration: TimeDelta) -> Result<Vec<Candle>, FatalError> {
    let rates: Vec<HistoricRate> =
        serde_json::from_str(body).map_err(|e| feed_error("invalid historic rates payload", e))?;

    let mut candles = Vec::with_capacity(rates.len());
    for (time, low, high, open, close, _volume) in rates {
        let time = DateTime::<Utc>::from_timestamp(time, 0)
            .ok_or_else(|| FatalError::Feed(format!("invalid timestamp {time}")))?;

        let mut candle = Candle::new(instrument, time, duration, false);
        candle.new_price(to_decimal(open)?, time);
        candle.new_price(to_decimal(high)?, time);
        candle.new_price(to_decimal(low)?, time);
        candle.new_price(to_decimal(close)?, time);
        candle.force_close();
        candles.push(candle);
    }

    sort_by_end(&mut candles);
    Ok(candles)
}

#[async_trait]
impl CandleSource for CoinbaseSource {
    fn describe(&self) -> String {
        format!("coinbase:{}", self.product_id)
    }

    async fn fetch(&self) -> Result<Vec<Candle>, FatalError> {
        let url = format!("{}/products/{}/candles", self.base_url.trim_end_matches('/'), self.product_id);
        let query = [
            ("granularity", self.duration.num_seconds().to_string()),
            ("start", self.from.to_rfc3339()),
            ("end", self.to.to_rfc3339()),
        ];

        let body = self
            .client
            .get(&url)
            .query(&query)
            .header(reqwest::header::USER_AGENT, "autotrader")
            .send()
            .await
            .and_then(|resp| resp.error_for_status())
            .map_err(|e| feed_error(&format!("GET {url}"), e))?
            .text()
            .await
            .map_err(|e| feed_error("reading historic rates body", e))?;

        let candles = parse_coinbase(&body, &self.product_id, self.duration)?;
        info!(count = candles.len(), "📡 [FEED] Candles from Coinbase");
        Ok(candles)
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────
