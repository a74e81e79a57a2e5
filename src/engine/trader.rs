//! # engine::trader
//!
//! **Trader** drives the orchestration loop of one instrument.
//!
//! ```text
//!   Stopped ──start()──▶ Running ──stop()──▶ Stopped
//! ```
//!
//! `start()` spawns two tasks: the broker's price feed and the tick consumer.
//! The consumer serialises all candle and strategy work under a single
//! `tokio::sync::Mutex`, held for the whole processing of one tick.
//!
//! Per tick:
//! 1. persist the raw tick (optional)
//! 2. validate, drop invalid ticks
//! 3. flash-crash guard (optional)
//! 4. update today's candle
//! 5. roll the strategy candle (and the 24h companion when persisting)
//! 6. hand every closed strategy-duration candle to the strategy and
//!    execute its decision against the broker

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, TimeDelta, Timelike, Utc};
use chrono_tz::Tz;
use rust_decimal::Decimal;
use tokio::sync::{broadcast, mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::broker::{Broker, FeedTick, TickReceiver};
use crate::engine::candle_builder::Candle;
use crate::engine::performance::{log_performance_by_note, PerformanceRecord, RunInfo};
use crate::error::{BrokerError, FatalError, TraderError};
use crate::events::{self, EngineEvent};
use crate::models::{Position, PositionRef, Tick};
use crate::risk::FlashCrashGuard;
use crate::store::CandleStore;
use crate::strategy::{CandleContext, Decision, Strategy};

/// Closed candles kept for strategy lookback.
pub const CANDLE_HISTORY_LEN: usize = 100;

const ONE_DAY_SECS: i64 = 24 * 60 * 60;
const ONE_HOUR_SECS: i64 = 60 * 60;

// ─── Config ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct TraderConfig {
    pub instrument:            String,
    /// Tagged onto every order the strategy places.
    pub currency_code:         String,
    /// Day and hour boundaries are evaluated in this timezone.
    pub display_tz:            Tz,
    pub persist_ticks:         bool,
    pub persist_candles:       bool,
    pub max_tick_jump_percent: Option<Decimal>,
}

impl TraderConfig {
    pub fn new(instrument: impl Into<String>) -> Self {
        Self {
            instrument:            instrument.into(),
            currency_code:         "USD".to_string(),
            display_tz:            chrono_tz::Europe::Berlin,
            persist_ticks:         false,
            persist_candles:       false,
            max_tick_jump_percent: None,
        }
    }
}

// ─── State ────────────────────────────────────────────────────────────────────

struct TraderState {
    strategy:                 Box<dyn Strategy>,
    today:                    Option<Candle>,
    open_candles:             Vec<Candle>,
    closed_candles:           Vec<Candle>,
    last_tick:                Option<Tick>,
    position_buy_time:        HashMap<PositionRef, DateTime<Utc>>,
    position_today_perf:      HashMap<PositionRef, Decimal>,
    closed_references:        HashSet<PositionRef>,
    max_concurrent_positions: usize,
}

impl TraderState {
    fn new(strategy: Box<dyn Strategy>) -> Self {
        Self {
            strategy,
            today:                    None,
            open_candles:             Vec::new(),
            closed_candles:           Vec::with_capacity(CANDLE_HISTORY_LEN + 1),
            last_tick:                None,
            position_buy_time:        HashMap::new(),
            position_today_perf:      HashMap::new(),
            closed_references:        HashSet::new(),
            max_concurrent_positions: 0,
        }
    }

    fn remember_closed(&mut self, candle: Candle) {
        self.closed_candles.push(candle);
        if self.closed_candles.len() > CANDLE_HISTORY_LEN {
            let excess = self.closed_candles.len() - CANDLE_HISTORY_LEN;
            self.closed_candles.drain(..excess);
        }
    }

    fn annotate(&self, positions: &mut [Position]) {
        for position in positions {
            if let Some(time) = self.position_buy_time.get(&position.reference) {
                position.candle_buy_time = Some(*time);
            }
            if let Some(perf) = self.position_today_perf.get(&position.reference) {
                position.today_performance = *perf;
            }
        }
    }
}

// ─── Core ─────────────────────────────────────────────────────────────────────

struct TraderCore {
    config: TraderConfig,
    broker: Arc<dyn Broker>,
    store:  Option<Arc<dyn CandleStore>>,
    events: broadcast::Sender<EngineEvent>,
    guard:  Option<FlashCrashGuard>,
    state:  Mutex<TraderState>,
}

/// Recoverable broker errors skip the current decision cycle; fatal ones
/// abort the run.
fn checked<T>(what: &str, result: Result<T, BrokerError>) -> Result<Option<T>, FatalError> {
    match result {
        Ok(value)                    => Ok(Some(value)),
        Err(BrokerError::Fatal(err)) => Err(err),
        Err(err)                     => {
            error!(error = %err, "❌ [TRADER] Cannot get {what}");
            Ok(None)
        }
    }
}

impl TraderCore {
    fn publish(&self, event: EngineEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    async fn receive_ticks(self: Arc<Self>, mut ticks: TickReceiver, mut shutdown: watch::Receiver<bool>) -> Result<(), TraderError> {
        loop {
            let feed_tick: FeedTick = tokio::select! {
                biased;
                _ = shutdown.changed() => {
                    debug!("[TRADER] Shutdown requested");
                    break;
                }
                next = ticks.recv() => match next {
                    Some(feed_tick) => feed_tick,
                    None            => break,
                },
            };

            if let Err(fatal) = self.on_tick(&feed_tick.tick).await {
                error!(error = %fatal, "💥 [TRADER] Fatal error, tick processing stopped");
                ticks.close();
                return Err(fatal.into());
            }
            feed_tick.ack();
        }

        debug!("[TRADER] Tick stream closed");
        Ok(())
    }

    async fn on_tick(&self, tick: &Tick) -> Result<(), FatalError> {
        // ── 1. Persist raw tick ───────────────────────────────────────────────
        if self.config.persist_ticks {
            if let Some(store) = &self.store {
                if let Err(err) = store.save_tick(tick).await {
                    error!(error = %format!("{err:#}"), %tick, "❌ [TRADER] Cannot persist tick");
                }
            }
        }

        // ── 2. Validate ───────────────────────────────────────────────────────
        if let Err(err) = tick.validate() {
            debug!(error = %err, %tick, "Invalid tick dropped");
            return Ok(());
        }

        let mut guard = self.state.lock().await;
        let state = &mut *guard;

        // ── 3. Flash-crash guard ──────────────────────────────────────────────
        if let (Some(flash_guard), Some(previous)) = (&self.guard, &state.last_tick) {
            if let Err(crash) = flash_guard.check(previous, tick) {
                warn!(error = %crash, "⚡ [TRADER] Tick rejected by flash-crash guard");
                return Ok(());
            }
        }

        // ── 4. Today's candle ─────────────────────────────────────────────────
        self.update_today(state, tick);

        // ── 5. Candle rollover ────────────────────────────────────────────────
        let closed = self.roll_candles(state, tick);

        // ── 6. Closed candles → strategy ──────────────────────────────────────
        for candle in closed {
            if self.config.persist_candles && candle.has_price_data() {
                if let Some(store) = &self.store {
                    if let Err(err) = store.save_candle(&candle).await {
                        error!(error = %format!("{err:#}"), %candle, "❌ [TRADER] Cannot persist candle");
                    }
                }
            }
            self.process_closed_candle(state, candle, tick).await?;
        }
        Ok(())
    }

    fn update_today(&self, state: &mut TraderState, tick: &Tick) {
        let tz = self.config.display_tz;
        let day = tick.time.with_timezone(&tz).date_naive();

        let stale = state
            .today
            .as_ref()
            .map_or(true, |today| today.start.with_timezone(&tz).date_naive() != day);
        if stale {
            if let Some(today) = state.today.as_mut() {
                today.force_close();
            }
            state.today = Some(Candle::new(&self.config.instrument, tick.time, TimeDelta::seconds(ONE_DAY_SECS), false));
        }

        if let Some(today) = state.today.as_mut() {
            today.new_price(tick.bid, tick.time);
        }
    }

    /// Feeds the tick into every open candle and returns those that closed.
    /// A closed candle is replaced by a fresh one seeded with the same tick.
    fn roll_candles(&self, state: &mut TraderState, tick: &Tick) -> Vec<Candle> {
        let price = tick.price();
        let one_day = TimeDelta::seconds(ONE_DAY_SECS);
        let one_hour = TimeDelta::seconds(ONE_HOUR_SECS);
        let tz = self.config.display_tz;

        if state.open_candles.is_empty() {
            let duration = state.strategy.candle_duration();
            state.open_candles.push(Candle::new_in_tz(&self.config.instrument, tick.time, duration, tz));
            if self.config.persist_candles && duration != one_day {
                state.open_candles.push(Candle::new_in_tz(&self.config.instrument, tick.time, one_day, tz));
            }
        }

        let now = tick.time.with_timezone(&tz);
        let previous = state.last_tick.as_ref().map(|t| t.time.with_timezone(&tz));

        let mut closed = Vec::new();
        for candle in state.open_candles.iter_mut() {
            if let Some(previous) = previous {
                let new_day = previous.date_naive() != now.date_naive();
                let boundary = if candle.duration == one_day {
                    new_day
                } else if candle.duration == one_hour {
                    new_day || previous.hour() != now.hour()
                } else {
                    false
                };
                if boundary {
                    candle.force_close();
                }
            }

            if candle.new_price(price, tick.time) {
                continue;
            }

            let mut fresh = Candle::new_in_tz(&candle.instrument, tick.time, candle.duration, tz);
            fresh.new_price(price, tick.time);
            closed.push(std::mem::replace(candle, fresh));
        }

        state.last_tick = Some(tick.clone());
        closed
    }

    async fn process_closed_candle(&self, state: &mut TraderState, candle: Candle, tick: &Tick) -> Result<(), FatalError> {
        if !candle.has_price_data() {
            debug!(%candle, "Closed candle has no price data, skipped");
            return Ok(());
        }
        if candle.duration != state.strategy.candle_duration() {
            return Ok(());
        }
        candle.validate()?;
        debug!(%candle, "🕯️ [TRADER] Processing closed candle");
        state.remember_closed(candle.clone());

        let Some(open_orders) = checked("open orders", self.broker.open_orders().await)? else {
            return Ok(());
        };
        let Some(mut open_positions) = checked("open positions", self.broker.open_positions().await)? else {
            return Ok(());
        };
        let Some(mut closed_positions) = checked("closed positions", self.broker.closed_positions().await)? else {
            return Ok(());
        };

        // Positions seen for the first time get stamped with this candle
        let today_perf = state
            .today
            .as_ref()
            .map(Candle::performance_in_percentage)
            .unwrap_or_default();
        for position in &open_positions {
            state.position_buy_time.entry(position.reference).or_insert(candle.start);
            state.position_today_perf.entry(position.reference).or_insert(today_perf);
        }
        state.max_concurrent_positions = state.max_concurrent_positions.max(open_positions.len());
        state.annotate(&mut open_positions);
        state.annotate(&mut closed_positions);

        for position in &closed_positions {
            if state.closed_references.insert(position.reference) {
                info!(
                    reference   = %position.reference,
                    direction   = %position.direction,
                    performance = position.pretty_performance(),
                    "📕 [TRADER] Position closed"
                );
                let mut position = position.clone();
                position.candle_sell_time = Some(candle.start);
                self.publish(EngineEvent::PositionClosed { position: Box::new(position) });
            }
        }

        let decision = state.strategy.process_candle(CandleContext {
            closed_candle:    &candle,
            recent_candles:   &state.closed_candles,
            tick,
            open_orders:      &open_orders,
            open_positions:   &open_positions,
            closed_positions: &closed_positions,
        });
        self.execute(decision).await?;

        self.publish(EngineEvent::CandleClosed { candle: Box::new(candle) });
        Ok(())
    }

    /// Cancels, then sells, then buys. Recoverable rejections are logged.
    async fn execute(&self, decision: Decision) -> Result<(), FatalError> {
        for order_id in decision.order_ids_to_cancel {
            match self.broker.cancel_order(order_id).await {
                Ok(())                       => debug!(%order_id, "Order cancelled"),
                Err(BrokerError::Fatal(err)) => return Err(err),
                Err(err)                     => error!(error = %err, %order_id, "❌ [TRADER] Unable to cancel order"),
            }
        }

        for position in decision.positions_to_close {
            match self.broker.sell(&position).await {
                Ok(())                       => {}
                Err(BrokerError::Fatal(err)) => return Err(err),
                Err(err)                     => error!(error = %err, reference = %position.reference, "❌ [TRADER] Unable to sell position"),
            }
        }

        for mut order in decision.orders_to_open {
            order.currency_code = self.config.currency_code.clone();
            match self.broker.buy(order.clone()).await {
                Ok(order_id) => {
                    order.id = Some(order_id);
                    info!(
                        %order_id,
                        direction  = %order.direction,
                        size       = order.size,
                        instrument = %order.instrument,
                        note       = %order.note,
                        "🧾 [TRADER] New order placed"
                    );
                    self.publish(EngineEvent::OrderPlaced { order: Box::new(order) });
                }
                Err(BrokerError::Fatal(err)) => return Err(err),
                Err(err) => warn!(error = %err, direction = %order.direction, "⚠️ [TRADER] Unable to open position"),
            }
        }
        Ok(())
    }
}

// ─── Trader ───────────────────────────────────────────────────────────────────

struct Running {
    shutdown: watch::Sender<bool>,
    consumer: Option<JoinHandle<Result<(), TraderError>>>,
    feed:     Option<JoinHandle<Result<(), BrokerError>>>,
}

pub struct Trader {
    core:    Arc<TraderCore>,
    running: Mutex<Option<Running>>,
}

impl Trader {
    pub fn new(
        config:   TraderConfig,
        broker:   Arc<dyn Broker>,
        strategy: Box<dyn Strategy>,
        store:    Option<Arc<dyn CandleStore>>,
    ) -> Self {
        if store.is_none() && (config.persist_ticks || config.persist_candles) {
            warn!("⚠️ [TRADER] Persistence requested without a store, nothing will be saved");
        }
        let (events, _) = events::channel();

        Self {
            core: Arc::new(TraderCore {
                guard: config.max_tick_jump_percent.map(FlashCrashGuard::new),
                config,
                broker,
                store,
                events,
                state: Mutex::new(TraderState::new(strategy)),
            }),
            running: Mutex::new(None),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.core.events.subscribe()
    }

    pub fn events(&self) -> broadcast::Sender<EngineEvent> {
        self.core.events.clone()
    }

    pub async fn is_running(&self) -> bool {
        self.running.lock().await.is_some()
    }

    // ─── Lifecycle ────────────────────────────────────────────────────────────

    /// Primes the strategy with the most recent stored candles. No broker
    /// interaction; returns the number of candles delivered.
    pub async fn warm_up(&self) -> Result<usize, TraderError> {
        let Some(store) = &self.core.store else {
            debug!("[TRADER] No store configured, warm-up skipped");
            return Ok(0);
        };

        let mut state = self.core.state.lock().await;
        let amount = state.strategy.warm_up_candle_amount();
        if amount == 0 {
            return Ok(0);
        }
        let duration = state.strategy.candle_duration();
        info!(duration = %crate::helper::format_duration(duration), amount, "🔥 [TRADER] Searching for warm-up candles");

        let candles = store
            .recent_candles(&self.core.config.instrument, duration, amount)
            .await
            .map_err(|e| FatalError::Io(format!("fetching stored candles failed: {e:#}")))?;

        let delivered = candles.len();
        for mut candle in candles {
            candle.force_close();
            state.strategy.process_warm_up_candle(&candle);
        }
        info!(delivered, "🔥 [TRADER] Strategy warmed up");
        Ok(delivered)
    }

    pub async fn start(&self) -> Result<(), TraderError> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return Err(TraderError::AlreadyRunning);
        }

        {
            let state = self.core.state.lock().await;
            info!(instrument = %self.core.config.instrument, strategy = %state.strategy, "🚀 [TRADER] Starting trader");
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let (shutdown, shutdown_rx) = watch::channel(false);

        let consumer = tokio::spawn(self.core.clone().receive_ticks(rx, shutdown_rx));
        let broker = self.core.broker.clone();
        let feed = tokio::spawn(async move { broker.listen_to_price_feed(tx).await });

        *running = Some(Running {
            shutdown,
            consumer: Some(consumer),
            feed:     Some(feed),
        });
        Ok(())
    }

    /// Waits until the price feed is exhausted and every tick is processed.
    pub async fn wait_for_feed(&self) -> Result<(), TraderError> {
        let (feed, consumer) = {
            let mut running = self.running.lock().await;
            let Some(running) = running.as_mut() else {
                return Err(TraderError::AlreadyStopped);
            };
            (running.feed.take(), running.consumer.take())
        };

        let feed_result = join(feed).await;
        let consumer_result = join(consumer).await;
        feed_result.and(consumer_result)
    }

    pub async fn stop(&self) -> Result<(), TraderError> {
        let Some(running) = self.running.lock().await.take() else {
            return Err(TraderError::AlreadyStopped);
        };
        info!(instrument = %self.core.config.instrument, "⏹️ [TRADER] Stopping trader");

        let _ = running.shutdown.send(true);
        let consumer_result = join(running.consumer).await;
        let feed_result = join(running.feed).await;

        match self.closed_positions().await {
            Ok(closed)  => log_performance_by_note(&closed),
            Err(err)    => warn!(error = %err, "Cannot summarise positions by note"),
        }
        consumer_result.and(feed_result)
    }

    // ─── Queries ──────────────────────────────────────────────────────────────

    /// Closed positions from the broker, annotated with trader bookkeeping.
    pub async fn closed_positions(&self) -> Result<Vec<Position>, TraderError> {
        let mut closed = self.core.broker.closed_positions().await?;
        self.core.state.lock().await.annotate(&mut closed);
        Ok(closed)
    }

    pub async fn max_concurrent_positions(&self) -> usize {
        self.core.state.lock().await.max_concurrent_positions
    }

    /// Closed candles currently kept for strategy lookback, oldest first.
    pub async fn recent_candles(&self) -> Vec<Candle> {
        self.core.state.lock().await.closed_candles.clone()
    }

    pub async fn performance_record(&self) -> Result<Option<PerformanceRecord>, TraderError> {
        let closed = self.closed_positions().await?;
        let info = {
            let state = self.core.state.lock().await;
            RunInfo {
                strategy_name:            state.strategy.name().to_string(),
                strategy:                 state.strategy.to_string(),
                instrument:               self.core.config.instrument.clone(),
                candle_duration:          state.strategy.candle_duration(),
                max_concurrent_positions: state.max_concurrent_positions,
            }
        };
        Ok(PerformanceRecord::from_closed_positions(&info, closed)?)
    }

    pub async fn save_performance_record(&self, record: &PerformanceRecord) -> Result<(), TraderError> {
        let Some(store) = &self.core.store else {
            return Ok(());
        };
        store
            .save_performance_record(record)
            .await
            .map_err(|e| FatalError::Io(format!("saving performance record failed: {e:#}")))?;
        info!(id = %record.backtesting_id, "💾 [TRADER] Performance record saved");
        Ok(())
    }
}

async fn join<E>(handle: Option<JoinHandle<Result<(), E>>>) -> Result<(), TraderError>
where
    TraderError: From<E>,
{
    let Some(handle) = handle else {
        return Ok(());
    };
    match handle.await {
        Ok(result) => result.map_err(TraderError::from),
        Err(err)   => Err(FatalError::Bookkeeping(format!("trader task failed: {err}")).into()),
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────
