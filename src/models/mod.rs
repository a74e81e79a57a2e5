//! Domain models shared across the engine, brokers and strategies.

pub mod order;
pub mod position;
pub mod tick;

pub use order::{Direction, Order, OrderId, OrderType};
pub use position::{CloseReason, Position, PositionRef};
pub use tick::Tick;
