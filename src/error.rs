//! # error
//!
//! Error taxonomy of the engine.
//!
//! | Type          | Kind                         | Handling                               |
//! |---------------|------------------------------|----------------------------------------|
//! | `TickError`   | malformed tick               | logged at debug, tick dropped          |
//! | `CandleError` | malformed candle             | candle skipped / run aborted           |
//! | `OrderError`  | malformed order              | wrapped in `FatalError::InvalidOrder`  |
//! | `BrokerError` | business rejection / I/O     | returned to caller, trader continues   |
//! | `FatalError`  | corrupted bookkeeping        | run stops                              |
//! | `AppError`    | monitor API                  | JSON error body                        |

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use rust_decimal::Decimal;
use serde_json::json;
use thiserror::Error;
use uuid::Uuid;

// ─── Validation ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TickError {
    #[error("empty datetime")]
    EmptyDatetime,
    #[error("empty bid")]
    EmptyBid,
    #[error("empty ask")]
    EmptyAsk,
    #[error("ask is less than bid")]
    AskBelowBid,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CandleError {
    #[error("candle has no price data")]
    NoPriceData,
    #[error("low is higher than high")]
    LowAboveHigh,
    #[error("open is higher than high")]
    OpenAboveHigh,
    #[error("open is lower than low")]
    OpenBelowLow,
    #[error("close is higher than high")]
    CloseAboveHigh,
    #[error("close is lower than low")]
    CloseBelowLow,
    #[error("end is before start")]
    EndBeforeStart,
    #[error("instrument is empty")]
    EmptyInstrument,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OrderError {
    #[error("cannot set both, stop level and trailing stop")]
    StopLossWithTrailingStop,
    #[error("need trailing stop increment size")]
    MissingTrailingIncrement,
    #[error("size cannot be <= 0")]
    NonPositiveSize,
    #[error("size must be a finite number")]
    NonFiniteSize,
    #[error("limit order needs a limit price")]
    MissingLimitPrice,
}

// ─── Fatal ────────────────────────────────────────────────────────────────────

/// Conditions after which continuing would produce silently wrong P&L.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum FatalError {
    #[error("order is not valid: {0}")]
    InvalidOrder(#[from] OrderError),

    #[error("candle is not valid: {0}")]
    InvalidCandle(#[from] CandleError),

    #[error("position {0} already exists in closed positions")]
    PositionAlreadyClosed(Uuid),

    #[error("position {0} already exists in open positions")]
    PositionAlreadyOpen(Uuid),

    #[error("{0}")]
    Bookkeeping(String),

    #[error("price feed failed: {0}")]
    Feed(String),

    #[error("i/o failed: {0}")]
    Io(String),
}

// ─── Broker ───────────────────────────────────────────────────────────────────

/// Result of any broker-facing operation.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum BrokerError {
    #[error("position not found")]
    PositionNotFound,

    #[error("order not found")]
    OrderNotFound,

    #[error("current price is below stop loss: {price} < {stop_loss}")]
    PriceBelowStopLoss { price: Decimal, stop_loss: Decimal },

    #[error("current price is above stop loss: {price} > {stop_loss}")]
    PriceAboveStopLoss { price: Decimal, stop_loss: Decimal },

    #[error("broker unavailable: {0}")]
    Unavailable(String),

    #[error(transparent)]
    Fatal(#[from] FatalError),
}

impl BrokerError {
    #[inline]
    pub fn is_fatal(&self) -> bool {
        matches!(self, BrokerError::Fatal(_))
    }
}

// ─── Trader ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Error)]
pub enum TraderError {
    #[error("already running")]
    AlreadyRunning,

    #[error("already stopped")]
    AlreadyStopped,

    #[error(transparent)]
    Fatal(#[from] FatalError),

    #[error(transparent)]
    Broker(BrokerError),
}

impl From<BrokerError> for TraderError {
    fn from(err: BrokerError) -> Self {
        match err {
            BrokerError::Fatal(fatal) => TraderError::Fatal(fatal),
            other                     => TraderError::Broker(other),
        }
    }
}

// ─── Monitor API ──────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum AppError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Broker error: {0}")]
    Broker(#[from] BrokerError),

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg.clone()),
            AppError::Broker(BrokerError::PositionNotFound | BrokerError::OrderNotFound) => {
                (StatusCode::NOT_FOUND, self.to_string())
            }
            AppError::Broker(err) if err.is_fatal() => {
                (StatusCode::INTERNAL_SERVER_ERROR, self.to_string())
            }
            AppError::Broker(_) => (StatusCode::BAD_GATEWAY, self.to_string()),
            AppError::Internal(err) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Internal error: {err}"),
            ),
        };

        let body = Json(json!({
            "ok":    false,
            "error": message,
        }));

        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_stop_loss_messages() {
        let err = BrokerError::PriceAboveStopLoss { price: dec!(1.00), stop_loss: dec!(0.80) };
        assert_eq!(err.to_string(), "current price is above stop loss: 1.00 > 0.80");
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_fatal_is_transparent() {
        let err: BrokerError = FatalError::from(OrderError::NonPositiveSize).into();
        assert!(err.is_fatal());
        assert_eq!(err.to_string(), "order is not valid: size cannot be <= 0");
    }

    #[test]
    fn test_trader_error_unwraps_fatal() {
        let err: TraderError = BrokerError::Fatal(FatalError::Feed("eof".into())).into();
        assert_eq!(err, TraderError::Fatal(FatalError::Feed("eof".into())));

        let err: TraderError = BrokerError::PositionNotFound.into();
        assert_eq!(err, TraderError::Broker(BrokerError::PositionNotFound));
    }

    #[test]
    fn test_not_found_maps_to_404() {
        let resp = AppError::Broker(BrokerError::PositionNotFound).into_response();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }
}
