//! # autotrader: Tick-driven trading engine
//!
//! ## Architecture Overview
//!
//! ```text
//!  ┌──────────────┐  candles   ┌──────────────┐  FeedTick (acked)  ┌──────────────────┐
//!  │ CandleSource │ ──────────▶│   Backtest   │ ──────────────────▶│      Trader      │
//!  │ csv / http   │            │ PaperWallet  │◀── buy/sell/cancel │ candles+strategy │
//!  └──────────────┘            └──────────────┘                    └──────────────────┘
//!                                     │                                     │
//!                                     ▼                                     ▼ EngineEvent
//!                          backtesting_result.csv                 ┌──────────────────┐
//!                                                                 │  Monitor (axum)  │
//!                                                                 │  REST + WS       │
//!                                                                 └──────────────────┘
//! ```
//!
//! The trader only talks to the [`broker::Broker`] trait; the backtest broker
//! replays history through a paper wallet, a live broker would stream quotes.

pub mod broker;
pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod helper;
pub mod models;
pub mod risk;
pub mod routes;
pub mod state;
pub mod store;
pub mod strategy;
