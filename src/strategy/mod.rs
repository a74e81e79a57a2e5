//! # strategy
//!
//! Defines the [`Strategy`] contract the trader drives, and the name →
//! constructor [`Registry`] used to pick one at startup.
//!
//! A strategy is a decision function over closed candles. It never talks to
//! the broker; it returns a [`Decision`] and the trader executes it.

pub mod heikin_ashi;

use std::collections::BTreeMap;
use std::fmt;

use chrono::TimeDelta;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use thiserror::Error;

use crate::engine::candle_builder::Candle;
use crate::models::{Order, OrderId, Position, Tick};

// ─── Contract ─────────────────────────────────────────────────────────────────

/// Everything the strategy may look at when a candle closes.
#[derive(Debug, Clone, Copy)]
pub struct CandleContext<'a> {
    pub closed_candle:    &'a Candle,
    /// Most recent closed candles, oldest first. Capped at 100.
    pub recent_candles:   &'a [Candle],
    pub tick:             &'a Tick,
    pub open_orders:      &'a [Order],
    pub open_positions:   &'a [Position],
    pub closed_positions: &'a [Position],
}

/// What the trader should do after a candle closed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Decision {
    pub orders_to_open:      Vec<Order>,
    pub order_ids_to_cancel: Vec<OrderId>,
    pub positions_to_close:  Vec<Position>,
}

impl Decision {
    pub fn is_empty(&self) -> bool {
        self.orders_to_open.is_empty()
            && self.order_ids_to_cancel.is_empty()
            && self.positions_to_close.is_empty()
    }
}

/// `Display` explains the settings (target, stop-loss, ...).
pub trait Strategy: fmt::Display + Send {
    fn name(&self) -> &str;

    /// Duration of the candles the strategy wants to see.
    fn candle_duration(&self) -> TimeDelta;

    /// How many stored candles to feed through
    /// [`process_warm_up_candle`](Strategy::process_warm_up_candle) before
    /// the first live candle. Not guaranteed to be delivered in full.
    fn warm_up_candle_amount(&self) -> usize;

    /// Primes indicators. Must not produce orders.
    fn process_warm_up_candle(&mut self, candle: &Candle);

    fn process_candle(&mut self, ctx: CandleContext<'_>) -> Decision;
}

// ─── Registry ─────────────────────────────────────────────────────────────────

/// Tunables handed to every strategy constructor.
#[derive(Debug, Clone, PartialEq)]
pub struct StrategyParams {
    pub instrument:        String,
    pub candle_duration:   TimeDelta,
    pub size:              f64,
    pub target_percent:    Decimal,
    pub stop_loss_percent: Decimal,
}

impl StrategyParams {
    pub fn new(instrument: impl Into<String>, candle_duration: TimeDelta) -> Self {
        Self {
            instrument: instrument.into(),
            candle_duration,
            size:              1.0,
            target_percent:    dec!(1),
            stop_loss_percent: dec!(0.5),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown strategy '{name}', available: {available}")]
pub struct UnknownStrategy {
    pub name:      String,
    pub available: String,
}

pub type StrategyFactory = Box<dyn Fn(&StrategyParams) -> Box<dyn Strategy> + Send + Sync>;

/// Maps a strategy name to its constructor. Resolved once at startup.
#[derive(Default)]
pub struct Registry {
    factories: BTreeMap<String, StrategyFactory>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every strategy shipped in this crate.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(heikin_ashi::NAME, |params| {
            Box::new(heikin_ashi::HeikinAshi::new(params.clone()))
        });
        registry
    }

    pub fn register<F>(&mut self, name: &str, factory: F)
    where
        F: Fn(&StrategyParams) -> Box<dyn Strategy> + Send + Sync + 'static,
    {
        self.factories.insert(name.to_string(), Box::new(factory));
    }

    pub fn build(&self, name: &str, params: &StrategyParams) -> Result<Box<dyn Strategy>, UnknownStrategy> {
        self.factories
            .get(name)
            .map(|factory| factory(params))
            .ok_or_else(|| UnknownStrategy {
                name:      name.to_string(),
                available: self.names().join(", "),
            })
    }

    pub fn names(&self) -> Vec<&str> {
        self.factories.keys().map(String::as_str).collect()
    }
}
