//! Shared value types and numeric helpers

pub mod helpers;
pub mod types;

pub use types::{
    AgentId, Bar, Direction, Forecast, MarketWindow, OrderRequest, Position, Quote, Signal,
    StatusSnapshot, TradingMode,
};
