//! # engine::paper_wallet
//!
//! **Paper Wallet** is the simulated exchange. Matches orders, keeps position
//! books, maintains trailing stops and charges fees/slippage against a
//! single incoming tick stream.
//!
//! ## Fill-price model
//!
//! | Action        | Long                     | Short                    |
//! |---------------|--------------------------|--------------------------|
//! | open          | ask + slippage + fee     | bid − slippage − fee     |
//! | close (trader)| bid − slippage − fee     | ask + slippage + fee     |
//! | target / stop | target / stop price      | target / stop price      |
//!
//! `fee = price / 100 × trading_fee_percent`, accumulated for the summary.
//!
//! ## Locking
//!
//! All books live in one [`WalletState`] behind a single `tokio::sync::RwLock`.
//! Every mutating call takes the write guard once and runs to completion on
//! plain `&mut WalletState` methods; readers take the read guard.

use std::collections::HashMap;

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::{BrokerError, FatalError};
use crate::helper::{cent_to_pips, pips_to_cent};
use crate::models::{CloseReason, Direction, Order, OrderId, OrderType, Position, PositionRef, Tick};

const HUNDRED: Decimal = dec!(100);

// ─── Config ───────────────────────────────────────────────────────────────────

/// Fee schedule and starting capital of one wallet instance.
#[derive(Debug, Clone, PartialEq)]
pub struct WalletConfig {
    pub initial_balance:     Decimal,
    pub trading_fee_percent: Decimal,
    /// Absolute price slippage applied to market fills.
    pub slippage:            Decimal,
    /// Absolute spread added on top of every quoted ask.
    pub spread:              Decimal,
}

impl Default for WalletConfig {
    fn default() -> Self {
        Self {
            initial_balance:     dec!(1000),
            trading_fee_percent: Decimal::ZERO,
            slippage:            Decimal::ZERO,
            spread:              Decimal::ZERO,
        }
    }
}

// ─── State ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq)]
struct TrailingStop {
    distance:  Decimal,   // price units
    increment: Decimal,   // price units
}

#[derive(Debug)]
struct WalletState {
    config:            WalletConfig,
    balance:           Decimal,
    total_trading_fee: Decimal,
    current_tick:      Option<Tick>,
    open_positions:    HashMap<PositionRef, Position>,
    closed_positions:  HashMap<PositionRef, Position>,
    open_orders:       HashMap<OrderId, Order>,
    trailing_stops:    HashMap<PositionRef, TrailingStop>,
}

impl WalletState {
    fn new(config: WalletConfig) -> Self {
        Self {
            balance:           config.initial_balance,
            total_trading_fee: Decimal::ZERO,
            current_tick:      None,
            open_positions:    HashMap::new(),
            closed_positions:  HashMap::new(),
            open_orders:       HashMap::new(),
            trailing_stops:    HashMap::new(),
            config,
        }
    }

    fn tick(&self) -> Result<&Tick, BrokerError> {
        self.current_tick
            .as_ref()
            .ok_or_else(|| BrokerError::Unavailable("no price received yet".into()))
    }

    fn trading_fee(&self, price: Decimal) -> Decimal {
        price / HUNDRED * self.config.trading_fee_percent
    }

    // ── Pricing ──────────────────────────────────────────────────────────────

    fn buy_price(&mut self, direction: Direction, tick: &Tick) -> Decimal {
        let slippage = self.config.slippage;
        match direction {
            Direction::Long => {
                let fee = self.trading_fee(tick.ask);
                self.total_trading_fee += fee;
                tick.ask + slippage + fee
            }
            Direction::Short => {
                let fee = self.trading_fee(tick.bid);
                self.total_trading_fee += fee;
                tick.bid - slippage - fee
            }
        }
    }

    fn sell_price(&mut self, direction: Direction, tick: &Tick) -> Decimal {
        let slippage = self.config.slippage;
        match direction {
            Direction::Long => {
                let fee = self.trading_fee(tick.bid);
                self.total_trading_fee += fee;
                tick.bid - slippage - fee
            }
            Direction::Short => {
                let fee = self.trading_fee(tick.ask);
                self.total_trading_fee += fee;
                tick.ask + slippage + fee
            }
        }
    }

    // ── Orders ───────────────────────────────────────────────────────────────

    fn buy(&mut self, mut order: Order) -> Result<OrderId, BrokerError> {
        if let Err(err) = order.validate() {
            error!(error = %err, ?order, "💥 [WALLET] Malformed order");
            return Err(FatalError::InvalidOrder(err).into());
        }
        let tick = self.tick()?.clone();
        check_stop_loss_not_breached(&order, &tick)?;

        let order_id = Uuid::new_v4();
        order.id = Some(order_id);

        match order.order_type {
            OrderType::Market => {
                self.open_position(order_id, order, &tick)?;
            }
            OrderType::Limit => {
                debug!(%order_id, limit = ?order.limit_price, direction = %order.direction, "📝 [WALLET] Limit order queued");
                self.open_orders.insert(order_id, order);
            }
        }

        Ok(order_id)
    }

    fn cancel_order(&mut self, order_id: OrderId) -> Result<(), BrokerError> {
        self.open_orders
            .remove(&order_id)
            .map(|_| ())
            .ok_or(BrokerError::OrderNotFound)
    }

    fn check_open_orders(&mut self, tick: &Tick) -> Result<(), FatalError> {
        let mut triggered: Vec<OrderId> = self
            .open_orders
            .iter()
            .filter(|(_, order)| match (order.direction, order.limit_price) {
                (Direction::Long, Some(limit))  => tick.ask <= limit,
                (Direction::Short, Some(limit)) => tick.bid >= limit,
                (_, None)                       => false,
            })
            .map(|(id, _)| *id)
            .collect();
        triggered.sort();

        for order_id in triggered {
            if let Some(order) = self.open_orders.get(&order_id).cloned() {
                info!(%order_id, direction = %order.direction, "🎯 [WALLET] Limit order triggered");
                self.open_position(order_id, order, tick)?;
            }
        }
        Ok(())
    }

    // ── Positions ────────────────────────────────────────────────────────────

    fn open_position(&mut self, order_id: OrderId, order: Order, tick: &Tick) -> Result<Position, FatalError> {
        let reference = Uuid::new_v4();
        if self.open_positions.contains_key(&reference) {
            return Err(FatalError::PositionAlreadyOpen(reference));
        }

        let buy_price = self.buy_price(order.direction, tick);
        let mut position = Position {
            reference,
            instrument:        order.instrument.clone(),
            direction:         order.direction,
            size:              order.size,
            buy_price,
            buy_time:          tick.time,
            sell_price:        None,
            sell_time:         None,
            target_price:      order.target_price.filter(|p| !p.is_zero()),
            stop_loss_price:   order.stop_loss_price.filter(|p| !p.is_zero()),
            note:              order.note.clone(),
            candle_buy_time:   None,
            candle_sell_time:  None,
            max_surge:         0.0,
            max_drawdown:      0.0,
            today_performance: Decimal::ZERO,
            gap_to_sma:        Decimal::ZERO,
        };

        if let (Some(distance), Some(increment)) = (order.trailing_stop_distance, order.trailing_stop_increment) {
            if order.has_trailing_stop() {
                let trailing = TrailingStop {
                    distance:  pips_to_cent(distance),
                    increment: pips_to_cent(increment),
                };
                position.stop_loss_price = Some(trailing_candidate(position.direction, trailing.distance, tick));
                self.trailing_stops.insert(reference, trailing);
            }
        }

        self.open_orders.remove(&order_id);
        self.open_positions.insert(reference, position.clone());

        debug!(
            %reference,
            buy_time  = %position.buy_time,
            buy_price = %position.buy_price,
            size      = position.size,
            "📈 [WALLET] New position"
        );

        Ok(position)
    }

    fn sell(
        &mut self,
        reference: PositionRef,
        fixed_price: Option<Decimal>,
        reason: CloseReason,
    ) -> Result<Position, BrokerError> {
        let tick = self.tick()?.clone();
        if !self.open_positions.contains_key(&reference) {
            return Err(BrokerError::PositionNotFound);
        }
        if self.closed_positions.contains_key(&reference) {
            error!(%reference, "💥 [WALLET] Position is open and closed at the same time");
            return Err(FatalError::PositionAlreadyClosed(reference).into());
        }

        let Some(mut position) = self.open_positions.remove(&reference) else {
            return Err(BrokerError::PositionNotFound);
        };
        let sell_price = match fixed_price {
            Some(price) => price,
            None        => self.sell_price(position.direction, &tick),
        };
        position.sell_price = Some(sell_price);
        position.sell_time  = Some(tick.time);

        self.trailing_stops.remove(&reference);
        self.balance += position.pnl(Decimal::ZERO, Decimal::ZERO);
        self.closed_positions.insert(reference, position.clone());

        info!(
            reason               = %reason,
            %reference,
            buy_time             = %position.buy_time,
            sell_time            = %tick.time,
            sell_price           = %sell_price,
            target               = ?position.target_price,
            stop_loss            = ?position.stop_loss_price,
            total_loss_positions = self.total_loss_positions(),
            total_performance    = %format!("{:.1}", self.total_performance()),
            open_positions       = self.open_positions.len(),
            "💰 [WALLET] Position closed"
        );

        Ok(position)
    }

    fn set_current_price(&mut self, mut tick: Tick) -> Result<(), BrokerError> {
        tick.ask += self.config.spread;
        self.current_tick = Some(tick.clone());
        self.check_open_orders(&tick)?;
        self.check_open_positions(&tick)
    }

    /// Per position: surge/drawdown, trailing stop, then target, then stop.
    /// The first exit that matches closes the position.
    fn check_open_positions(&mut self, tick: &Tick) -> Result<(), BrokerError> {
        let mut references: Vec<(chrono::DateTime<chrono::Utc>, PositionRef)> = self
            .open_positions
            .values()
            .map(|p| (p.buy_time, p.reference))
            .collect();
        references.sort();

        for (_, reference) in references {
            let trailing = self.trailing_stops.get(&reference).copied();
            let Some(position) = self.open_positions.get_mut(&reference) else {
                continue;
            };

            let perf_pips = position.performance_absolute(tick.bid, tick.ask) * 10_000.0;
            if perf_pips > position.max_surge {
                position.max_surge = perf_pips;
            }
            if perf_pips < position.max_drawdown {
                position.max_drawdown = perf_pips;
            }

            if let Some(trailing) = trailing {
                update_trailing_stop(position, trailing, tick);
            }

            let direction = position.direction;
            let target    = position.target_price;
            let stop_loss = position.stop_loss_price;

            if let Some(target) = target {
                let hit = match direction {
                    Direction::Long  => tick.bid >= target,
                    Direction::Short => tick.ask <= target,
                };
                if hit {
                    self.sell(reference, Some(target), CloseReason::TargetHit)?;
                    continue;
                }
            }

            if let Some(stop_loss) = stop_loss {
                let hit = match direction {
                    Direction::Long  => tick.bid <= stop_loss,
                    Direction::Short => tick.ask >= stop_loss,
                };
                if hit {
                    self.sell(reference, Some(stop_loss), CloseReason::StopLossHit)?;
                }
            }
        }
        Ok(())
    }

    fn close_all_open_positions(&mut self) -> Result<usize, BrokerError> {
        let mut references: Vec<(chrono::DateTime<chrono::Utc>, PositionRef)> = self
            .open_positions
            .values()
            .map(|p| (p.buy_time, p.reference))
            .collect();
        references.sort();

        for (_, reference) in &references {
            self.sell(*reference, None, CloseReason::Liquidation)?;
        }
        Ok(references.len())
    }

    // ── Totals ───────────────────────────────────────────────────────────────

    fn total_performance(&self) -> f64 {
        self.closed_positions
            .values()
            .map(|p| p.performance_absolute(Decimal::ZERO, Decimal::ZERO))
            .sum()
    }

    fn total_loss_positions(&self) -> usize {
        self.closed_positions
            .values()
            .filter(|p| p.performance_absolute(Decimal::ZERO, Decimal::ZERO) < 0.0)
            .count()
    }
}

/// Rejects orders whose stop-loss is already breached by the current price.
fn check_stop_loss_not_breached(order: &Order, tick: &Tick) -> Result<(), BrokerError> {
    let Some(stop_loss) = order.stop_loss_price.filter(|p| !p.is_zero()) else {
        return Ok(());
    };
    match order.direction {
        Direction::Long if tick.ask < stop_loss => Err(BrokerError::PriceBelowStopLoss {
            price: tick.ask,
            stop_loss,
        }),
        Direction::Short if tick.bid > stop_loss => Err(BrokerError::PriceAboveStopLoss {
            price: tick.bid,
            stop_loss,
        }),
        _ => Ok(()),
    }
}

fn trailing_candidate(direction: Direction, distance: Decimal, tick: &Tick) -> Decimal {
    match direction {
        Direction::Long  => tick.bid - distance,
        Direction::Short => tick.ask + distance,
    }
}

/// Ratchets the stop towards the price. Never moves it against the position.
fn update_trailing_stop(position: &mut Position, trailing: TrailingStop, tick: &Tick) {
    let candidate = trailing_candidate(position.direction, trailing.distance, tick);
    let improved = match (position.direction, position.stop_loss_price) {
        (_, None)                      => true,
        (Direction::Long, Some(stop))  => candidate >= stop + trailing.increment,
        (Direction::Short, Some(stop)) => candidate <= stop - trailing.increment,
    };
    if improved {
        debug!(
            reference = %position.reference,
            from      = ?position.stop_loss_price,
            to        = %candidate,
            "🪜 [WALLET] Trailing stop moved"
        );
        position.stop_loss_price = Some(candidate);
    }
}

// ─── PaperWallet ──────────────────────────────────────────────────────────────

/// Simulated exchange shared between the feed task and the trader.
#[derive(Debug)]
pub struct PaperWallet {
    state: RwLock<WalletState>,
}

impl PaperWallet {
    pub fn new(config: WalletConfig) -> Self {
        Self {
            state: RwLock::new(WalletState::new(config)),
        }
    }

    /// Opens (market) or queues (limit) the order. Returns the order id.
    pub async fn buy(&self, order: Order) -> Result<OrderId, BrokerError> {
        self.state.write().await.buy(order)
    }

    /// Closes an open position at the current market price.
    pub async fn sell(&self, position: &Position) -> Result<(), BrokerError> {
        self.state
            .write()
            .await
            .sell(position.reference, None, CloseReason::Trader)
            .map(|_| ())
    }

    pub async fn cancel_order(&self, order_id: OrderId) -> Result<(), BrokerError> {
        self.state.write().await.cancel_order(order_id)
    }

    /// Heartbeat: stores the tick, fills triggered limit orders and closes
    /// positions that hit target or stop-loss.
    pub async fn set_current_price(&self, tick: Tick) -> Result<(), BrokerError> {
        self.state.write().await.set_current_price(tick)
    }

    /// Force-liquidates every open position at the current price.
    pub async fn close_all_open_positions(&self) -> Result<usize, BrokerError> {
        let closed = self.state.write().await.close_all_open_positions()?;
        if closed > 0 {
            warn!(closed, "🧹 [WALLET] Liquidated remaining open positions");
        }
        Ok(closed)
    }

    // ─── Reads ────────────────────────────────────────────────────────────────

    pub async fn open_orders(&self) -> Vec<Order> {
        let state = self.state.read().await;
        let mut orders: Vec<Order> = state.open_orders.values().cloned().collect();
        orders.sort_by_key(|o| o.id);
        orders
    }

    /// Open positions ordered by buy time.
    pub async fn open_positions(&self) -> Vec<Position> {
        let state = self.state.read().await;
        sorted_by_buy_time(state.open_positions.values())
    }

    pub async fn open_positions_by_instrument(&self, instrument: &str) -> Vec<Position> {
        let state = self.state.read().await;
        sorted_by_buy_time(state.open_positions.values().filter(|p| p.instrument == instrument))
    }

    /// Closed positions ordered by buy time.
    pub async fn closed_positions(&self) -> Vec<Position> {
        let state = self.state.read().await;
        sorted_by_buy_time(state.closed_positions.values())
    }

    pub async fn open_position(&self, reference: PositionRef) -> Result<Position, BrokerError> {
        self.state
            .read()
            .await
            .open_positions
            .get(&reference)
            .cloned()
            .ok_or(BrokerError::PositionNotFound)
    }

    pub async fn current_tick(&self) -> Option<Tick> {
        self.state.read().await.current_tick.clone()
    }

    pub async fn balance(&self) -> Decimal {
        self.state.read().await.balance
    }

    pub async fn initial_balance(&self) -> Decimal {
        self.state.read().await.config.initial_balance
    }

    pub async fn total_trading_fee(&self) -> Decimal {
        self.state.read().await.total_trading_fee
    }

    /// Sum of absolute performance over closed positions.
    pub async fn total_performance(&self) -> f64 {
        self.state.read().await.total_performance()
    }

    pub async fn total_loss_positions(&self) -> usize {
        self.state.read().await.total_loss_positions()
    }

    pub async fn print_summary(&self) {
        let state = self.state.read().await;
        let closed = state.closed_positions.len();
        if closed == 0 {
            return;
        }

        let avg_fee = state.total_trading_fee / Decimal::from(closed);
        info!("{:>25}: {} ({} avg)", "Total trading fee", state.total_trading_fee.round_dp(2), avg_fee.round_dp(4));
        info!("{:>25}: {}", "Initial balance", state.config.initial_balance);
        info!("{:>25}: {}", "End balance", state.balance.round_dp(4));
        info!("{:>25}: {} ({} pips)", "Total performance", format!("{:.4}", state.total_performance()),
            cent_to_pips(state.balance - state.config.initial_balance).round_dp(2));
        if !state.open_positions.is_empty() {
            info!("{:>25}: {}", "Open positions", state.open_positions.len());
        }
    }
}

impl Default for PaperWallet {
    fn default() -> Self {
        Self::new(WalletConfig::default())
    }
}

fn sorted_by_buy_time<'a>(positions: impl Iterator<Item = &'a Position>) -> Vec<Position> {
    let mut positions: Vec<Position> = positions.cloned().collect();
    positions.sort_by(|a, b| a.buy_time.cmp(&b.buy_time).then(a.reference.cmp(&b.reference)));
    positions
}

// ─── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, TimeDelta, TimeZone, Utc};
    use proptest::prelude::*;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2021, 3, 1, 9, 0, 0).unwrap()
    }

    fn make_tick(time: DateTime<Utc>, bid: Decimal, ask: Decimal) -> Tick {
        Tick::new("EURUSD", time, bid, ask)
    }

    async fn set_tick(wallet: &PaperWallet, tick: Tick) {
        wallet.state.write().await.current_tick = Some(tick);
    }

    #[tokio::test]
    async fn test_buy_and_sell_long() {
        let wallet = PaperWallet::default();
        set_tick(&wallet, make_tick(t0(), dec!(0.9), dec!(1.0))).await;

        let order = Order::market(Direction::Long, 1.0, "EURUSD", Some(dec!(2.0)), Some(dec!(0.5)));
        wallet.buy(order).await.unwrap();

        let positions = wallet.open_positions().await;
        assert_eq!(positions.len(), 1);
        let position = positions[0].clone();
        assert_eq!(position.direction, Direction::Long);
        assert_eq!(position.buy_time, t0());
        assert!(position.is_open());

        let later = t0() + TimeDelta::minutes(1);
        set_tick(&wallet, make_tick(later, dec!(2.0), dec!(3.0))).await;
        wallet.sell(&position).await.unwrap();

        let closed = wallet.closed_positions().await;
        assert_eq!(closed.len(), 1);
        let position = &closed[0];
        assert_eq!(position.sell_price, Some(dec!(2.0)));
        assert_eq!(position.sell_time, Some(later));
        assert_eq!(position.performance_absolute(Decimal::ZERO, Decimal::ZERO), 1.0);
        assert_eq!(position.performance_in_percentage(Decimal::ZERO, Decimal::ZERO), 100.0);
        assert_eq!(wallet.balance().await, dec!(1001));
    }

    #[tokio::test]
    async fn test_buy_and_sell_short() {
        let wallet = PaperWallet::default();
        set_tick(&wallet, make_tick(t0(), dec!(2.0), dec!(0.9))).await;

        let order = Order::market(Direction::Short, 1.0, "EURUSD", Some(dec!(0.5)), Some(dec!(2.0)));
        wallet.buy(order).await.unwrap();
        let position = wallet.open_positions().await.remove(0);
        assert_eq!(position.buy_price, dec!(2.0));

        set_tick(&wallet, make_tick(t0() + TimeDelta::minutes(1), dec!(1.77), dec!(1.0))).await;
        wallet.sell(&position).await.unwrap();

        let position = wallet.closed_positions().await.remove(0);
        assert_eq!(position.sell_price, Some(dec!(1.0)));
        assert_eq!(position.performance_absolute(Decimal::ZERO, Decimal::ZERO), 1.0);
        assert_eq!(position.performance_in_percentage(Decimal::ZERO, Decimal::ZERO), 100.0);
    }

    #[tokio::test]
    async fn test_limit_order_long() {
        let wallet = PaperWallet::default();
        set_tick(&wallet, make_tick(t0(), dec!(2.0), dec!(2.0))).await;

        let order = Order::limit(Direction::Long, 1.0, "EURUSD", dec!(1.95), Some(dec!(2.5)), Some(dec!(0.5)));
        let order_id = wallet.buy(order).await.unwrap();
        assert!(wallet.open_positions().await.is_empty());
        assert_eq!(wallet.open_orders().await[0].id, Some(order_id));

        wallet.set_current_price(make_tick(t0(), dec!(1.90), dec!(1.95))).await.unwrap();

        let positions = wallet.open_positions().await;
        assert_eq!(positions.len(), 1);
        assert_eq!(positions[0].buy_price, dec!(1.95));
        assert_eq!(positions[0].size, 1.0);
        assert!(wallet.open_orders().await.is_empty());
    }

    #[tokio::test]
    async fn test_limit_order_short() {
        let wallet = PaperWallet::default();
        set_tick(&wallet, make_tick(t0(), dec!(2.0), dec!(2.0))).await;

        let order = Order::limit(Direction::Short, 1.0, "EURUSD", dec!(2.05), Some(dec!(1.5)), Some(dec!(2.5)));
        wallet.buy(order).await.unwrap();
        assert!(wallet.open_positions().await.is_empty());

        wallet.set_current_price(make_tick(t0(), dec!(2.05), dec!(2.10))).await.unwrap();

        let positions = wallet.open_positions().await;
        assert_eq!(positions.len(), 1);
        assert_eq!(positions[0].buy_price, dec!(2.05));
        assert_eq!(positions[0].direction, Direction::Short);
    }

    #[tokio::test]
    async fn test_three_buys_one_sell() {
        let wallet = PaperWallet::default();
        set_tick(&wallet, make_tick(t0(), dec!(1.0), dec!(1.0))).await;

        for _ in 0..3 {
            wallet.buy(Order::market(Direction::Long, 1.0, "EURUSD", None, None)).await.unwrap();
        }
        let positions = wallet.open_positions().await;
        assert_eq!(positions.len(), 3);

        wallet.sell(&positions[0]).await.unwrap();
        assert_eq!(wallet.open_positions().await.len(), 2);
        assert_eq!(wallet.closed_positions().await.len(), 1);
    }

    #[tokio::test]
    async fn test_cancel_order() {
        let wallet = PaperWallet::default();
        set_tick(&wallet, make_tick(t0(), dec!(2.0), dec!(2.0))).await;

        let order_id = wallet
            .buy(Order::limit(Direction::Long, 1.0, "EURUSD", dec!(1.5), None, None))
            .await
            .unwrap();
        wallet.cancel_order(order_id).await.unwrap();
        assert_eq!(wallet.cancel_order(order_id).await, Err(BrokerError::OrderNotFound));

        wallet.set_current_price(make_tick(t0(), dec!(1.4), dec!(1.4))).await.unwrap();
        assert!(wallet.open_positions().await.is_empty());
    }

    #[tokio::test]
    async fn test_sell_unknown_position() {
        let wallet = PaperWallet::default();
        set_tick(&wallet, make_tick(t0(), dec!(1.0), dec!(1.0))).await;
        wallet.buy(Order::market(Direction::Long, 1.0, "EURUSD", None, None)).await.unwrap();

        let mut position = wallet.open_positions().await.remove(0);
        wallet.sell(&position).await.unwrap();
        assert_eq!(wallet.sell(&position).await, Err(BrokerError::PositionNotFound));

        position.reference = Uuid::new_v4();
        assert_eq!(wallet.sell(&position).await, Err(BrokerError::PositionNotFound));
        assert_eq!(wallet.open_position(position.reference).await, Err(BrokerError::PositionNotFound));
    }

    #[tokio::test]
    async fn test_buy_rejects_breached_stop_loss() {
        let wallet = PaperWallet::default();
        set_tick(&wallet, make_tick(t0(), dec!(1.00), dec!(1.50))).await;

        let short = Order::market(Direction::Short, 1.0, "EURUSD", None, Some(dec!(0.80)));
        let err = wallet.buy(short).await.unwrap_err();
        assert!(err.to_string().starts_with("current price is above stop loss"));
        assert!(!err.is_fatal());

        let long = Order::market(Direction::Long, 1.0, "EURUSD", None, Some(dec!(1.60)));
        let err = wallet.buy(long).await.unwrap_err();
        assert_eq!(err.to_string(), "current price is below stop loss: 1.50 < 1.60");
        assert!(wallet.open_positions().await.is_empty());
    }

    #[tokio::test]
    async fn test_malformed_order_is_fatal() {
        let wallet = PaperWallet::default();
        set_tick(&wallet, make_tick(t0(), dec!(1.0), dec!(1.0))).await;

        let err = wallet
            .buy(Order::market(Direction::Long, 0.0, "EURUSD", None, None))
            .await
            .unwrap_err();
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn test_buy_without_price_is_unavailable() {
        let wallet = PaperWallet::default();
        let err = wallet
            .buy(Order::market(Direction::Long, 1.0, "EURUSD", None, None))
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::Unavailable(_)));
    }

    #[tokio::test]
    async fn test_fill_prices_include_fee() {
        let config = WalletConfig { trading_fee_percent: dec!(0.26), ..WalletConfig::default() };
        let wallet = PaperWallet::new(config);
        set_tick(&wallet, make_tick(t0(), dec!(1.00), dec!(1.50))).await;

        wallet.buy(Order::market(Direction::Long, 1.0, "EURUSD", None, None)).await.unwrap();
        wallet.buy(Order::market(Direction::Short, 1.0, "EURUSD", None, None)).await.unwrap();

        let positions = wallet.open_positions().await;
        let long = positions.iter().find(|p| p.direction == Direction::Long).unwrap();
        let short = positions.iter().find(|p| p.direction == Direction::Short).unwrap();
        assert_eq!(long.buy_price, dec!(1.50) + dec!(0.0039));
        assert_eq!(short.buy_price, dec!(1.00) - dec!(0.0026));
        assert_eq!(wallet.total_trading_fee().await, dec!(0.0065));
    }

    #[test]
    fn test_trading_fee() {
        let state = WalletState::new(WalletConfig { trading_fee_percent: dec!(0.26), ..WalletConfig::default() });
        assert_eq!(state.trading_fee(dec!(43.50)), dec!(0.1131));
    }

    #[tokio::test]
    async fn test_sell_applies_slippage_and_fee() {
        let config = WalletConfig { trading_fee_percent: dec!(1), slippage: dec!(0.01), ..WalletConfig::default() };
        let wallet = PaperWallet::new(config);
        set_tick(&wallet, make_tick(t0(), dec!(10), dec!(10))).await;
        wallet.buy(Order::market(Direction::Long, 1.0, "EURUSD", None, None)).await.unwrap();
        let position = wallet.open_positions().await.remove(0);
        assert_eq!(position.buy_price, dec!(10.11));

        wallet.sell(&position).await.unwrap();
        let position = wallet.closed_positions().await.remove(0);
        assert_eq!(position.sell_price, Some(dec!(9.89)));
        assert_eq!(wallet.total_trading_fee().await, dec!(0.2));
    }

    #[tokio::test]
    async fn test_target_hit_long() {
        let wallet = PaperWallet::default();
        set_tick(&wallet, make_tick(t0(), dec!(1.0), dec!(1.0))).await;
        wallet.buy(Order::market(Direction::Long, 1.0, "EURUSD", Some(dec!(1.2)), Some(dec!(0.8)))).await.unwrap();

        wallet.set_current_price(make_tick(t0() + TimeDelta::minutes(1), dec!(1.1), dec!(1.1))).await.unwrap();
        assert_eq!(wallet.open_positions().await.len(), 1);

        wallet.set_current_price(make_tick(t0() + TimeDelta::minutes(2), dec!(1.25), dec!(1.26))).await.unwrap();
        let closed = wallet.closed_positions().await;
        assert_eq!(closed.len(), 1);
        assert_eq!(closed[0].sell_price, Some(dec!(1.2)));
        assert!(closed[0].max_surge > 0.0);
    }

    #[tokio::test]
    async fn test_stop_loss_hit_short() {
        let wallet = PaperWallet::default();
        set_tick(&wallet, make_tick(t0(), dec!(1.0), dec!(1.0))).await;
        wallet.buy(Order::market(Direction::Short, 1.0, "EURUSD", Some(dec!(0.8)), Some(dec!(1.1)))).await.unwrap();

        wallet.set_current_price(make_tick(t0() + TimeDelta::minutes(1), dec!(1.1), dec!(1.12))).await.unwrap();
        let closed = wallet.closed_positions().await;
        assert_eq!(closed.len(), 1);
        assert_eq!(closed[0].sell_price, Some(dec!(1.1)));
        assert!(closed[0].max_drawdown < 0.0);
    }

    #[tokio::test]
    async fn test_stop_loss_without_target() {
        let wallet = PaperWallet::default();
        set_tick(&wallet, make_tick(t0(), dec!(1.0), dec!(1.0))).await;
        wallet.buy(Order::market(Direction::Long, 1.0, "EURUSD", None, Some(dec!(0.9)))).await.unwrap();

        wallet.set_current_price(make_tick(t0() + TimeDelta::minutes(1), dec!(0.85), dec!(0.86))).await.unwrap();
        let closed = wallet.closed_positions().await;
        assert_eq!(closed.len(), 1);
        assert_eq!(closed[0].sell_price, Some(dec!(0.9)));
    }

    #[tokio::test]
    async fn test_target_and_stop_on_same_tick_close_once() {
        let config = WalletConfig { trading_fee_percent: dec!(0.1), ..WalletConfig::default() };
        let wallet = PaperWallet::new(config);
        set_tick(&wallet, make_tick(t0(), dec!(1.0), dec!(1.0))).await;
        // Stop above target: any bid satisfies one of the two
        wallet.buy(Order::market(Direction::Long, 1.0, "EURUSD", Some(dec!(0.9)), None)).await.unwrap();
        {
            let mut state = wallet.state.write().await;
            let position = state.open_positions.values_mut().next().unwrap();
            position.stop_loss_price = Some(dec!(1.1));
        }
        let fee_after_buy = wallet.total_trading_fee().await;

        wallet.set_current_price(make_tick(t0() + TimeDelta::minutes(1), dec!(1.0), dec!(1.0))).await.unwrap();

        let closed = wallet.closed_positions().await;
        assert_eq!(closed.len(), 1);
        assert_eq!(closed[0].sell_price, Some(dec!(0.9)));
        assert!(wallet.open_positions().await.is_empty());
        assert_eq!(wallet.total_trading_fee().await, fee_after_buy);
    }

    #[tokio::test]
    async fn test_trailing_stop_ratchets_one_way() {
        let wallet = PaperWallet::default();
        set_tick(&wallet, make_tick(t0(), dec!(1.0), dec!(1.0))).await;
        wallet
            .buy(Order::with_trailing_stop(Direction::Long, 1.0, "EURUSD", None, dec!(100), dec!(1)))
            .await
            .unwrap();
        let reference = wallet.open_positions().await[0].reference;

        let stop = |p: Position| p.stop_loss_price.unwrap();
        assert_eq!(stop(wallet.open_position(reference).await.unwrap()), dec!(0.99));

        wallet.set_current_price(make_tick(t0() + TimeDelta::minutes(1), dec!(0.999), dec!(0.999))).await.unwrap();
        assert_eq!(stop(wallet.open_position(reference).await.unwrap()), dec!(0.99));

        wallet.set_current_price(make_tick(t0() + TimeDelta::minutes(2), dec!(1.01), dec!(1.01))).await.unwrap();
        assert_eq!(stop(wallet.open_position(reference).await.unwrap()), dec!(1.00));

        wallet.set_current_price(make_tick(t0() + TimeDelta::minutes(3), dec!(0.999), dec!(0.999))).await.unwrap();
        let closed = wallet.closed_positions().await.remove(0);
        assert_eq!(stop(closed.clone()), dec!(1.00));
        assert_eq!(closed.sell_price, Some(dec!(1.00)));
    }

    #[tokio::test]
    async fn test_trailing_stop_short() {
        let wallet = PaperWallet::default();
        set_tick(&wallet, make_tick(t0(), dec!(1.0), dec!(1.0))).await;
        wallet
            .buy(Order::with_trailing_stop(Direction::Short, 1.0, "EURUSD", None, dec!(100), dec!(1)))
            .await
            .unwrap();
        let reference = wallet.open_positions().await[0].reference;
        assert_eq!(wallet.open_position(reference).await.unwrap().stop_loss_price, Some(dec!(1.01)));

        wallet.set_current_price(make_tick(t0() + TimeDelta::minutes(1), dec!(0.98), dec!(0.98))).await.unwrap();
        assert_eq!(wallet.open_position(reference).await.unwrap().stop_loss_price, Some(dec!(0.99)));

        wallet.set_current_price(make_tick(t0() + TimeDelta::minutes(2), dec!(0.985), dec!(0.985))).await.unwrap();
        assert_eq!(wallet.open_position(reference).await.unwrap().stop_loss_price, Some(dec!(0.99)));
    }

    #[tokio::test]
    async fn test_close_all_open_positions() {
        let wallet = PaperWallet::default();
        set_tick(&wallet, make_tick(t0(), dec!(1.0), dec!(1.0))).await;
        wallet.buy(Order::market(Direction::Long, 1.0, "EURUSD", None, None)).await.unwrap();
        wallet.buy(Order::market(Direction::Short, 1.0, "EURUSD", None, None)).await.unwrap();

        set_tick(&wallet, make_tick(t0() + TimeDelta::hours(1), dec!(1.2), dec!(1.2))).await;
        assert_eq!(wallet.close_all_open_positions().await.unwrap(), 2);
        assert!(wallet.open_positions().await.is_empty());
        assert_eq!(wallet.closed_positions().await.len(), 2);
        assert_eq!(wallet.balance().await, dec!(1000));
    }

    #[tokio::test]
    async fn test_total_performance_and_losses() {
        let wallet = PaperWallet::default();
        set_tick(&wallet, make_tick(t0(), dec!(10), dec!(10))).await;
        for _ in 0..3 {
            wallet.buy(Order::market(Direction::Long, 1.0, "EURUSD", None, None)).await.unwrap();
        }
        let positions = wallet.open_positions().await;

        set_tick(&wallet, make_tick(t0() + TimeDelta::hours(1), dec!(35), dec!(35))).await;
        wallet.sell(&positions[0]).await.unwrap();
        wallet.sell(&positions[1]).await.unwrap();
        set_tick(&wallet, make_tick(t0() + TimeDelta::hours(2), dec!(8), dec!(8))).await;
        wallet.sell(&positions[2]).await.unwrap();

        assert_eq!(wallet.total_performance().await, 48.0);
        assert_eq!(wallet.total_loss_positions().await, 1);
        wallet.print_summary().await;
    }

    #[tokio::test]
    async fn test_open_positions_by_instrument() {
        let wallet = PaperWallet::default();
        set_tick(&wallet, make_tick(t0(), dec!(1.0), dec!(1.0))).await;
        wallet.buy(Order::market(Direction::Long, 1.0, "EURUSD", None, None)).await.unwrap();
        wallet.buy(Order::market(Direction::Long, 1.0, "GBPUSD", None, None)).await.unwrap();

        let eur = wallet.open_positions_by_instrument("EURUSD").await;
        assert_eq!(eur.len(), 1);
        assert_eq!(eur[0].instrument, "EURUSD");
    }

    // ── Disjoint books ──────────────────────────────────────────────────────

    #[derive(Debug, Clone)]
    enum Op {
        Buy(bool),
        Sell(usize),
        Price(i64),
        CloseAll,
    }

    fn op_strategy() -> impl Strategy<Value = Op> {
        prop_oneof![
            any::<bool>().prop_map(Op::Buy),
            (0usize..8).prop_map(Op::Sell),
            (9_000i64..11_000).prop_map(Op::Price),
            Just(Op::CloseAll),
        ]
    }

    proptest! {
        #![proptest_config(ProptestConfig { cases: 128, ..ProptestConfig::default() })]

        #[test]
        fn prop_open_and_closed_books_are_disjoint(ops in prop::collection::vec(op_strategy(), 1..60)) {
            let mut state = WalletState::new(WalletConfig::default());
            state.set_current_price(make_tick(t0(), dec!(1.0), dec!(1.0))).unwrap();

            for (i, op) in ops.into_iter().enumerate() {
                match op {
                    Op::Buy(long) => {
                        let direction = if long { Direction::Long } else { Direction::Short };
                        let target = Some(dec!(1.05));
                        let stop = if long { dec!(0.95) } else { dec!(1.05) };
                        let target = if long { target } else { Some(dec!(0.95)) };
                        let _ = state.buy(Order::market(direction, 1.0, "EURUSD", target, Some(stop)));
                    }
                    Op::Sell(n) => {
                        let reference = state.open_positions.keys().nth(n).copied();
                        if let Some(reference) = reference {
                            prop_assert!(state.sell(reference, None, CloseReason::Trader).is_ok());
                        }
                    }
                    Op::Price(m) => {
                        let price = Decimal::new(m, 4);
                        let time = t0() + TimeDelta::seconds(i as i64);
                        prop_assert!(state.set_current_price(make_tick(time, price, price)).is_ok());
                    }
                    Op::CloseAll => {
                        prop_assert!(state.close_all_open_positions().is_ok());
                    }
                }

                for reference in state.open_positions.keys() {
                    prop_assert!(!state.closed_positions.contains_key(reference));
                }
                for reference in state.trailing_stops.keys() {
                    prop_assert!(state.open_positions.contains_key(reference));
                }
            }
        }
    }
}
