//! # models::order
//!
//! An [`Order`] is a request to open a position. Strategies produce them,
//! the trader tags them with its currency code and the broker either fills
//! them immediately (market) or queues them until the price reaches the
//! limit (limit).

use std::fmt;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::OrderError;

pub type OrderId = Uuid;

// ─── Direction ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Direction {
    Long,
    Short,
}

impl Direction {
    pub fn opposite(self) -> Self {
        match self {
            Direction::Long  => Direction::Short,
            Direction::Short => Direction::Long,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Long  => write!(f, "LONG"),
            Direction::Short => write!(f, "SHORT"),
        }
    }
}

// ─── OrderType ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderType {
    Market,
    Limit,
}

// ─── Order ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    /// Set by the broker once the order is accepted.
    #[serde(default)]
    pub id:                       Option<OrderId>,
    pub order_type:               OrderType,
    pub direction:                Direction,
    pub size:                     f64,
    pub instrument:               String,
    /// Tagged by the trader before the order is sent.
    #[serde(default)]
    pub currency_code:            String,
    pub target_price:             Option<Decimal>,
    pub stop_loss_price:          Option<Decimal>,
    /// Required for limit orders.
    pub limit_price:              Option<Decimal>,
    pub trailing_stop_distance:   Option<Decimal>,   // pips
    pub trailing_stop_increment:  Option<Decimal>,   // pips
    #[serde(default)]
    pub note:                     String,
    /// Start of the candle that produced this order.
    pub candle_start:             Option<DateTime<Utc>>,
}

impl Order {
    /// Market order with optional target and stop-loss.
    pub fn market(
        direction: Direction,
        size: f64,
        instrument: impl Into<String>,
        target_price: Option<Decimal>,
        stop_loss_price: Option<Decimal>,
    ) -> Self {
        Self {
            id:                      None,
            order_type:              OrderType::Market,
            direction,
            size,
            instrument:              instrument.into(),
            currency_code:           String::new(),
            target_price,
            stop_loss_price,
            limit_price:             None,
            trailing_stop_distance:  None,
            trailing_stop_increment: None,
            note:                    String::new(),
            candle_start:            None,
        }
    }

    pub fn limit(
        direction: Direction,
        size: f64,
        instrument: impl Into<String>,
        limit_price: Decimal,
        target_price: Option<Decimal>,
        stop_loss_price: Option<Decimal>,
    ) -> Self {
        Self {
            order_type:  OrderType::Limit,
            limit_price: Some(limit_price),
            ..Self::market(direction, size, instrument, target_price, stop_loss_price)
        }
    }

    /// Market order whose stop-loss follows the price at `distance` pips.
    pub fn with_trailing_stop(
        direction: Direction,
        size: f64,
        instrument: impl Into<String>,
        target_price: Option<Decimal>,
        distance_in_pips: Decimal,
        increment_in_pips: Decimal,
    ) -> Self {
        Self {
            trailing_stop_distance:  Some(distance_in_pips),
            trailing_stop_increment: Some(increment_in_pips),
            ..Self::market(direction, size, instrument, target_price, None)
        }
    }

    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.note = note.into();
        self
    }

    pub fn has_trailing_stop(&self) -> bool {
        self.trailing_stop_distance.is_some_and(|d| !d.is_zero())
    }

    /// Checks the order for malformed data.
    pub fn validate(&self) -> Result<(), OrderError> {
        let has_stop_loss = self.stop_loss_price.is_some_and(|p| !p.is_zero());
        let has_increment = self.trailing_stop_increment.is_some_and(|i| !i.is_zero());

        if has_stop_loss && (self.has_trailing_stop() || has_increment) {
            return Err(OrderError::StopLossWithTrailingStop);
        }
        if self.has_trailing_stop() && !has_increment {
            return Err(OrderError::MissingTrailingIncrement);
        }
        if !self.size.is_finite() {
            return Err(OrderError::NonFiniteSize);
        }
        if self.size <= 0.0 {
            return Err(OrderError::NonPositiveSize);
        }
        if self.order_type == OrderType::Limit && self.limit_price.is_none() {
            return Err(OrderError::MissingLimitPrice);
        }
        Ok(())
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn make_order() -> Order {
        Order::market(Direction::Long, 1.0, "EURUSD", Some(dec!(1.2)), Some(dec!(1.0)))
    }

    #[test]
    fn test_valid_market_order() {
        assert!(make_order().validate().is_ok());
    }

    #[test]
    fn test_stop_loss_and_trailing_stop_conflict() {
        let mut order = make_order();
        order.trailing_stop_distance = Some(dec!(10));
        order.trailing_stop_increment = Some(dec!(1));
        assert_eq!(order.validate(), Err(OrderError::StopLossWithTrailingStop));
    }

    #[test]
    fn test_trailing_stop_needs_increment() {
        let order = Order::with_trailing_stop(Direction::Long, 1.0, "EURUSD", None, dec!(10), Decimal::ZERO);
        assert_eq!(order.validate(), Err(OrderError::MissingTrailingIncrement));
    }

    #[test]
    fn test_size_must_be_positive() {
        let mut order = make_order();
        order.size = 0.0;
        assert_eq!(order.validate(), Err(OrderError::NonPositiveSize));
        order.size = -1.0;
        assert_eq!(order.validate(), Err(OrderError::NonPositiveSize));
    }

    #[test]
    fn test_size_must_be_finite() {
        let mut order = make_order();
        order.size = f64::NAN;
        assert_eq!(order.validate(), Err(OrderError::NonFiniteSize));
        order.size = f64::INFINITY;
        assert_eq!(order.validate(), Err(OrderError::NonFiniteSize));
    }

    #[test]
    fn test_limit_order_needs_limit_price() {
        let mut order = Order::limit(Direction::Short, 1.0, "EURUSD", dec!(2.05), None, None);
        assert!(order.validate().is_ok());
        order.limit_price = None;
        assert_eq!(order.validate(), Err(OrderError::MissingLimitPrice));
    }

    #[test]
    fn test_direction_display() {
        assert_eq!(Direction::Long.to_string(), "LONG");
        assert_eq!(Direction::Short.opposite(), Direction::Long);
    }
}
