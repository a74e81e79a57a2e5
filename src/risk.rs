//! # risk: Flash-crash guard
//!
//! Rejects a tick whose bid or ask moved further than the configured
//! percentage from the previous accepted tick. Disabled unless a threshold
//! is configured.

use rust_decimal::Decimal;
use thiserror::Error;

use crate::helper::distance_in_percentage;
use crate::models::Tick;

#[derive(Debug, Clone, PartialEq, Error)]
#[error("distance between {previous} and {current} is bigger than {max_percent}%")]
pub struct FlashCrash {
    pub previous:    Tick,
    pub current:     Tick,
    pub max_percent: Decimal,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FlashCrashGuard {
    max_distance_percent: Decimal,
}

impl FlashCrashGuard {
    pub fn new(max_distance_percent: Decimal) -> Self {
        Self { max_distance_percent }
    }

    pub fn check(&self, previous: &Tick, current: &Tick) -> Result<(), FlashCrash> {
        let distance_ask = distance_in_percentage(previous.ask, current.ask).abs();
        let distance_bid = distance_in_percentage(previous.bid, current.bid).abs();

        if distance_ask > self.max_distance_percent || distance_bid > self.max_distance_percent {
            return Err(FlashCrash {
                previous:    previous.clone(),
                current:     current.clone(),
                max_percent: self.max_distance_percent,
            });
        }
        Ok(())
    }
}
