//! Collaborator contracts
//!
//! The supervisory core never trains models, reads a venue or persists
//! anything itself. It talks to the outside world through these traits:
//! - Forecast model (predict, full retrain, fine-tune, evaluate)
//! - Market data and quotes
//! - Execution gateway
//! - Settings store and state export

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::config::AgentSettings;
use crate::utils::types::{
    AgentId, Bar, Forecast, MarketWindow, OrderRequest, Position, Quote, StatusSnapshot,
    TradingMode,
};

/// Parameters for a full retrain, derived from the settings snapshot and mode
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingPlan {
    pub simulated: bool,
    pub window_size: usize,
    pub epochs: u32,
    pub batch_size: u32,
    pub data_limit: usize,
}

impl TrainingPlan {
    pub fn new(settings: &AgentSettings, mode: TradingMode) -> Self {
        let (epochs, batch_size) = if mode.is_simulated() {
            (1, 16)
        } else {
            (settings.epochs, settings.batch_size)
        };
        Self {
            simulated: mode.is_simulated(),
            window_size: settings.window_size,
            epochs,
            batch_size,
            data_limit: mode.training_data_limit(),
        }
    }
}

/// Parameters for a light fine-tune on the most recent bars
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FineTuneRequest {
    pub epochs: u32,
    pub learning_rate: f64,
}

impl FineTuneRequest {
    /// Fine-tuning runs at a tenth of the configured learning rate
    pub fn new(settings: &AgentSettings, mode: TradingMode) -> Self {
        Self {
            epochs: mode.fine_tune_epochs(),
            learning_rate: settings.learning_rate * 0.1,
        }
    }
}

/// Outcome of a model performance test
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PerformanceReport {
    pub passed: bool,
    pub error_metric: f64,
}

impl PerformanceReport {
    /// Report used when the test itself could not run. The infinite error
    /// keeps it out of every acceptance band.
    pub fn failed() -> Self {
        Self {
            passed: false,
            error_metric: f64::INFINITY,
        }
    }
}

/// Prediction model for one or more agents
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ForecastModel: Send + Sync {
    /// Load persisted weights; `false` when none exist
    async fn load_weights(&self, agent: &AgentId) -> Result<bool>;

    /// Forecast close/high/low of the next bar
    async fn predict(&self, agent: &AgentId, window: &[Bar]) -> Result<Forecast>;

    /// Long-running full retrain; `false` when training could not complete
    async fn full_retrain(&self, agent: &AgentId, plan: &TrainingPlan) -> Result<bool>;

    async fn fine_tune(&self, agent: &AgentId, recent: &[Bar], request: &FineTuneRequest) -> Result<()>;

    async fn evaluate_performance(&self, agent: &AgentId) -> Result<PerformanceReport>;
}

/// Closed bars and volatility
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MarketDataProvider: Send + Sync {
    /// Most recent `window_size` closed bars, `None` while data is unavailable
    async fn latest_window(&self, agent: &AgentId, window_size: usize) -> Result<Option<MarketWindow>>;

    async fn recent_bars(&self, agent: &AgentId, limit: usize) -> Result<Vec<Bar>>;

    async fn latest_volatility(&self, agent: &AgentId) -> Result<Option<f64>>;
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait QuoteSource: Send + Sync {
    async fn quote(&self, instrument: &str) -> Result<Option<Quote>>;
}

/// Order execution. Implementations apply their own trading-enabled veto.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ExecutionGateway: Send + Sync {
    /// Returns the position id, or `None` when the order was vetoed or skipped
    async fn open_position(&self, agent: &AgentId, order: OrderRequest) -> Result<Option<String>>;

    async fn close_position(&self, position_id: &str, reason: &str) -> Result<bool>;

    async fn close_all_for_agent(&self, agent: &AgentId) -> Result<usize>;

    async fn open_positions(&self, agent: &AgentId) -> Result<Vec<Position>>;
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SettingsStore: Send + Sync {
    async fn load(&self, agent: &AgentId) -> Result<AgentSettings>;
}

/// Write-only sink for per-agent status snapshots
#[cfg_attr(test, mockall::automock)]
pub trait StateSink: Send + Sync {
    fn publish(&self, snapshot: StatusSnapshot);
}

/// Collaborators one agent talks to
#[derive(Clone)]
pub struct Collaborators {
    pub model: Arc<dyn ForecastModel>,
    pub market: Arc<dyn MarketDataProvider>,
    pub quotes: Arc<dyn QuoteSource>,
    pub gateway: Arc<dyn ExecutionGateway>,
    pub settings: Arc<dyn SettingsStore>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_training_plan_coarsened_in_simulation() {
        let settings = AgentSettings::default();
        let sim = TrainingPlan::new(&settings, TradingMode::Simulation);
        assert!(sim.simulated);
        assert_eq!((sim.epochs, sim.batch_size, sim.data_limit), (1, 16, 2_000));

        let live = TrainingPlan::new(&settings, TradingMode::Trade);
        assert_eq!((live.epochs, live.batch_size, live.data_limit), (20, 32, 100_000));
    }

    #[test]
    fn test_fine_tune_request() {
        let settings = AgentSettings::default();
        let req = FineTuneRequest::new(&settings, TradingMode::Trade);
        assert_eq!(req.epochs, 5);
        assert!((req.learning_rate - 0.0001).abs() < 1e-12);
        assert_eq!(FineTuneRequest::new(&settings, TradingMode::Simulation).epochs, 1);
    }
}
