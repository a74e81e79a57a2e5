//! # strategy::heikin_ashi
//!
//! Trend follower on Heikin-Ashi candles. Two consecutive HA candles of the
//! same colour with a rising (falling) close set the direction. Positions
//! against the direction are closed; a new market order is opened only when
//! the direction flips, never into a trend that was already running.

use std::collections::VecDeque;
use std::fmt;

use chrono::TimeDelta;
use tracing::debug;

use crate::engine::candle_builder::{to_heikin_ashi, Candle};
use crate::helper::{format_duration, stop_loss_price_by_percentage, target_price_by_percentage};
use crate::models::{Direction, Order};
use crate::strategy::{CandleContext, Decision, Strategy, StrategyParams};

pub const NAME: &str = "heikin_ashi";

const HISTORY_LEN: usize = 100;

pub struct HeikinAshi {
    params:            StrategyParams,
    history:           VecDeque<Candle>,
    current_direction: Option<Direction>,
}

impl HeikinAshi {
    pub fn new(params: StrategyParams) -> Self {
        Self {
            params,
            history:           VecDeque::with_capacity(HISTORY_LEN),
            current_direction: None,
        }
    }

    fn remember(&mut self, candle: &Candle) {
        if self.history.len() >= HISTORY_LEN {
            self.history.pop_front();
        }
        self.history.push_back(candle.clone());
    }

    /// Direction of the last two HA candles, if they agree.
    fn direction(&self) -> Option<Direction> {
        let n = self.history.len();
        if n < 3 {
            return None;
        }
        let previous = to_heikin_ashi(&self.history[n - 3], &self.history[n - 2]);
        let now      = to_heikin_ashi(&self.history[n - 2], &self.history[n - 1]);

        if is_long(&previous) && is_long(&now) && now.close > previous.close {
            Some(Direction::Long)
        } else if is_short(&previous) && is_short(&now) && now.close < previous.close {
            Some(Direction::Short)
        } else {
            None
        }
    }

    fn create_order(&self, ctx: &CandleContext<'_>, direction: Direction) -> Order {
        let tick = ctx.tick;
        let entry = match direction {
            Direction::Long  => tick.ask,
            Direction::Short => tick.bid,
        };
        let target    = target_price_by_percentage(entry, self.params.target_percent, direction);
        let stop_loss = stop_loss_price_by_percentage(tick.price(), self.params.stop_loss_percent, direction);

        debug!(
            %direction,
            bid        = %tick.bid,
            ask        = %tick.ask,
            target     = %target,
            stop_loss  = %stop_loss,
            candle_age = %format_duration(ctx.closed_candle.age(tick.time)),
            "🕯️ [HEIKIN_ASHI] Creating new order"
        );

        let mut order = Order::market(direction, self.params.size, &self.params.instrument, Some(target), Some(stop_loss))
            .with_note("ha-flip");
        order.candle_start = Some(ctx.closed_candle.start);
        order
    }
}

impl Strategy for HeikinAshi {
    fn name(&self) -> &str {
        NAME
    }

    fn candle_duration(&self) -> TimeDelta {
        self.params.candle_duration
    }

    fn warm_up_candle_amount(&self) -> usize {
        2
    }

    fn process_warm_up_candle(&mut self, candle: &Candle) {
        self.remember(candle);
    }

    fn process_candle(&mut self, ctx: CandleContext<'_>) -> Decision {
        self.remember(ctx.closed_candle);

        let Some(direction) = self.direction() else {
            return Decision::default();
        };
        let previous = self.current_direction.replace(direction);

        let mut decision = Decision::default();
        let mut in_direction = false;
        for position in ctx.open_positions {
            if position.direction == direction {
                in_direction = true;
            } else {
                decision.positions_to_close.push(position.clone());
            }
        }

        let flipped = previous.is_some_and(|p| p != direction);
        if flipped && !in_direction {
            decision.orders_to_open.push(self.create_order(&ctx, direction));
        }
        decision
    }
}

impl fmt::Display for HeikinAshi {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}(candle={} target={}% stop_loss={}% size={})",
            NAME,
            format_duration(self.params.candle_duration),
            self.params.target_percent,
            self.params.stop_loss_percent,
            self.params.size
        )
    }
}

fn is_long(candle: &Candle) -> bool {
    candle.close > candle.open
}

fn is_short(candle: &Candle) -> bool {
    candle.close < candle.open
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::position::tests::make_position;
    use crate::models::{Position, Tick};
    use chrono::{TimeZone, Utc};
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;

    fn make_candle(i: i64, open: Decimal, close: Decimal) -> Candle {
        let start = Utc.with_ymd_and_hms(2021, 3, 1, 0, 0, 0).unwrap() + TimeDelta::hours(i);
        Candle::from_ohlc(
            "EURUSD",
            start,
            start + TimeDelta::hours(1),
            TimeDelta::hours(1),
            open,
            open.max(close),
            open.min(close),
            close,
        )
    }

    fn make_candles() -> Vec<Candle> {
        vec![
            make_candle(0, dec!(10), dec!(9)),
            make_candle(1, dec!(9), dec!(8)),
            make_candle(2, dec!(8), dec!(7)),
            make_candle(3, dec!(7), dec!(8)),
            make_candle(4, dec!(8), dec!(9)),
            make_candle(5, dec!(9), dec!(10)),
        ]
    }

    fn run(strategy: &mut HeikinAshi, candle: &Candle, open_positions: &[Position]) -> Decision {
        let tick = Tick::new("EURUSD", candle.end, candle.close, candle.close);
        strategy.process_candle(CandleContext {
            closed_candle:    candle,
            recent_candles:   &[],
            tick:             &tick,
            open_orders:      &[],
            open_positions,
            closed_positions: &[],
        })
    }

    #[test]
    fn test_opens_on_flip_only() {
        let mut strategy = HeikinAshi::new(StrategyParams::new("EURUSD", TimeDelta::hours(1)));
        let short = make_position(Direction::Short, dec!(8), None);

        let decisions: Vec<Decision> = make_candles()
            .iter()
            .map(|candle| run(&mut strategy, candle, std::slice::from_ref(&short)))
            .collect();

        // Initial short trend is not traded
        assert!(decisions[..5].iter().all(|d| d.orders_to_open.is_empty()));

        let last = &decisions[5];
        assert_eq!(last.orders_to_open.len(), 1);
        let order = &last.orders_to_open[0];
        assert_eq!(order.direction, Direction::Long);
        assert_eq!(order.target_price, Some(dec!(10.1)));
        assert_eq!(order.stop_loss_price, Some(dec!(9.95)));
        assert_eq!(order.note, "ha-flip");
        assert_eq!(last.positions_to_close, vec![short]);
    }

    #[test]
    fn test_no_order_when_already_positioned() {
        let mut strategy = HeikinAshi::new(StrategyParams::new("EURUSD", TimeDelta::hours(1)));
        let long = make_position(Direction::Long, dec!(8), None);

        let candles = make_candles();
        for candle in &candles[..5] {
            run(&mut strategy, candle, &[]);
        }
        let decision = run(&mut strategy, &candles[5], std::slice::from_ref(&long));
        assert!(decision.is_empty());
    }

    #[test]
    fn test_warm_up_primes_history() {
        let mut strategy = HeikinAshi::new(StrategyParams::new("EURUSD", TimeDelta::hours(1)));
        let candles = make_candles();
        for candle in &candles[..2] {
            strategy.process_warm_up_candle(candle);
        }
        // Third candle completes the first HA pair
        run(&mut strategy, &candles[2], &[]);
        assert_eq!(strategy.current_direction, Some(Direction::Short));
    }

    #[test]
    fn test_display() {
        let strategy = HeikinAshi::new(StrategyParams::new("EURUSD", TimeDelta::hours(1)));
        assert_eq!(strategy.to_string(), "heikin_ashi(candle=1h 0m 0s target=1% stop_loss=0.5% size=1)");
    }
}
