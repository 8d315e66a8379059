//! Forecast Supervisor Library
//!
//! Supervisory control core for forecast-driven trading agents: drift
//! control, risk-gated entries, bounded retraining and paired timeframes.

pub mod agent;
pub mod collaborators;
pub mod config;
pub mod control;
pub mod events;
pub mod execution;
pub mod position;
pub mod sim;
pub mod state;
pub mod supervisor;
pub mod telemetry;
pub mod utils;

// Re-export main types
pub use agent::{AgentStatus, Orchestrator, PairCoordinator, RiskGate, TradingAgent};
pub use config::AppConfig;
pub use control::{AdmissionController, DriftController, DriftStatus};
pub use events::{Event, EventBus};
pub use supervisor::{OperatorCommand, Supervisor, SupervisorHandle};
pub use utils::types::{AgentId, TradingMode};
