//! # store: Persistence port
//!
//! The engine persists three record shapes: ticks, closed candles and
//! performance records. Candle duration is part of a candle's identity, so
//! queries are always `(instrument, duration, period)`.
//!
//! [`MemoryStore`] keeps everything in process memory. It backs the stored
//! candle feed, strategy warm-up and the monitor API.

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use tokio::sync::RwLock;
use tracing::debug;

use crate::engine::candle_builder::{sort_by_end, Candle};
use crate::engine::performance::PerformanceRecord;
use crate::models::Tick;

// ─── Port ─────────────────────────────────────────────────────────────────────

#[async_trait]
pub trait CandleStore: Send + Sync {
    async fn save_tick(&self, tick: &Tick) -> anyhow::Result<()>;

    async fn save_candle(&self, candle: &Candle) -> anyhow::Result<()>;

    /// Candles with `from <= start` and `end <= to`, ordered by end.
    async fn candles(
        &self,
        instrument: &str,
        duration:   TimeDelta,
        from:       DateTime<Utc>,
        to:         DateTime<Utc>,
    ) -> anyhow::Result<Vec<Candle>>;

    /// The `limit` most recent candles, oldest first.
    async fn recent_candles(&self, instrument: &str, duration: TimeDelta, limit: usize) -> anyhow::Result<Vec<Candle>>;

    async fn save_performance_record(&self, record: &PerformanceRecord) -> anyhow::Result<()>;

    async fn performance_records(&self) -> anyhow::Result<Vec<PerformanceRecord>>;
}

// ─── In-memory ────────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct Tables {
    ticks:   Vec<Tick>,
    candles: Vec<Candle>,
    records: Vec<PerformanceRecord>,
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn tick_count(&self) -> usize {
        self.tables.read().await.ticks.len()
    }
}

#[async_trait]
impl CandleStore for MemoryStore {
    async fn save_tick(&self, tick: &Tick) -> anyhow::Result<()> {
        self.tables.write().await.ticks.push(tick.clone());
        Ok(())
    }

    async fn save_candle(&self, candle: &Candle) -> anyhow::Result<()> {
        debug!(instrument = %candle.instrument, start = %candle.start, "💾 [STORE] Candle saved");
        self.tables.write().await.candles.push(candle.clone());
        Ok(())
    }

    async fn candles(
        &self,
        instrument: &str,
        duration:   TimeDelta,
        from:       DateTime<Utc>,
        to:         DateTime<Utc>,
    ) -> anyhow::Result<Vec<Candle>> {
        let tables = self.tables.read().await;
        let mut candles: Vec<Candle> = tables
            .candles
            .iter()
            .filter(|c| c.instrument == instrument && c.duration == duration)
            .filter(|c| c.start >= from && c.end <= to)
            .cloned()
            .collect();
        sort_by_end(&mut candles);
        Ok(candles)
    }

    async fn recent_candles(&self, instrument: &str, duration: TimeDelta, limit: usize) -> anyhow::Result<Vec<Candle>> {
        let tables = self.tables.read().await;
        let mut candles: Vec<Candle> = tables
            .candles
            .iter()
            .filter(|c| c.instrument == instrument && c.duration == duration)
            .cloned()
            .collect();
        sort_by_end(&mut candles);
        let skip = candles.len().saturating_sub(limit);
        Ok(candles.split_off(skip))
    }

    async fn save_performance_record(&self, record: &PerformanceRecord) -> anyhow::Result<()> {
        self.tables.write().await.records.push(record.clone());
        Ok(())
    }

    async fn performance_records(&self) -> anyhow::Result<Vec<PerformanceRecord>> {
        Ok(self.tables.read().await.records.clone())
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────
