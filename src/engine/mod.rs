pub mod candle_builder;
pub mod paper_wallet;
pub mod performance;
pub mod trader;
