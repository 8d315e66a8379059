//! Common types used throughout the application

use serde::{Deserialize, Serialize};
use std::fmt;

/// Immutable (instrument, timeframe) key for all per-agent state
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AgentId {
    pub instrument: String,
    pub timeframe: String,
}

impl AgentId {
    pub fn new(instrument: impl Into<String>, timeframe: impl Into<String>) -> Self {
        Self {
            instrument: instrument.into(),
            timeframe: timeframe.into(),
        }
    }
}

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.instrument, self.timeframe)
    }
}

/// Operating mode. Carries the policy that differs between live trading
/// and rapid functional verification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TradingMode {
    Trade,
    Simulation,
}

impl TradingMode {
    pub fn is_simulated(&self) -> bool {
        matches!(self, TradingMode::Simulation)
    }

    /// Scale applied to the per-agent error multiplier
    pub fn error_multiplier_scale(&self) -> f64 {
        match self {
            TradingMode::Trade => 1.0,
            TradingMode::Simulation => 3.0,
        }
    }

    /// Epochs for a light fine-tune
    pub fn fine_tune_epochs(&self) -> u32 {
        match self {
            TradingMode::Trade => 5,
            TradingMode::Simulation => 1,
        }
    }

    /// Bars of history a full retrain may consume
    pub fn training_data_limit(&self) -> usize {
        match self {
            TradingMode::Trade => 100_000,
            TradingMode::Simulation => 2_000,
        }
    }
}

impl fmt::Display for TradingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TradingMode::Trade => write!(f, "trade"),
            TradingMode::Simulation => write!(f, "simulation"),
        }
    }
}

/// One closed market bar
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    /// Bar open time (unix seconds), strictly increasing per agent
    pub time: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

/// Latest closed bars for an agent plus the volatility measure of the last one
#[derive(Debug, Clone)]
pub struct MarketWindow {
    pub bars: Vec<Bar>,
    /// Average-true-range-like statistic of the most recent bar
    pub volatility: f64,
}

impl MarketWindow {
    pub fn last_bar(&self) -> Option<&Bar> {
        self.bars.last()
    }

    pub fn bar_time(&self) -> Option<i64> {
        self.last_bar().map(|b| b.time)
    }
}

/// Live bid/ask
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Quote {
    pub bid: f64,
    pub ask: f64,
}

impl Quote {
    pub fn spread(&self) -> f64 {
        self.ask - self.bid
    }

    pub fn mid(&self) -> f64 {
        (self.bid + self.ask) / 2.0
    }
}

/// Model forecast for the next bar
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Forecast {
    pub close: f64,
    pub high: f64,
    pub low: f64,
}

impl Forecast {
    pub fn new(close: f64, high: f64, low: f64) -> Self {
        Self { close, high, low }
    }

    /// Mean squared error of this forecast against the realised bar
    pub fn squared_error(&self, actual: &Bar) -> f64 {
        let dc = self.close - actual.close;
        let dh = self.high - actual.high;
        let dl = self.low - actual.low;
        (dc * dc + dh * dh + dl * dl) / 3.0
    }

    pub fn range(&self) -> f64 {
        self.high - self.low
    }
}

/// Entry decision produced by the risk gate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Signal {
    Buy,
    Sell,
    None,
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Signal::Buy => write!(f, "BUY"),
            Signal::Sell => write!(f, "SELL"),
            Signal::None => write!(f, "NONE"),
        }
    }
}

/// Position direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Long,
    Short,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Long => write!(f, "long"),
            Direction::Short => write!(f, "short"),
        }
    }
}

/// Order handed to the execution gateway
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct OrderRequest {
    pub direction: Direction,
    pub target: f64,
    pub stop: f64,
}

/// An open position owned by one agent
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub id: String,
    pub agent: AgentId,
    pub direction: Direction,
    pub entry_price: f64,
    pub target: f64,
    pub stop: f64,
    pub opened_at: i64,
}

impl Position {
    pub fn new(agent: AgentId, direction: Direction, entry_price: f64, target: f64, stop: f64) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            agent,
            direction,
            entry_price,
            target,
            stop,
            opened_at: chrono::Utc::now().timestamp_millis(),
        }
    }

    /// Signed price move in the position's favour
    pub fn favourable_move(&self, price: f64) -> f64 {
        match self.direction {
            Direction::Long => price - self.entry_price,
            Direction::Short => self.entry_price - price,
        }
    }
}

/// Status snapshot exported once per processed bar
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusSnapshot {
    pub id: String,
    pub status: String,
    pub error_metric: f64,
    pub confidence: f64,
    pub warning_count: u32,
    pub is_active: bool,
    pub mode: TradingMode,
}
