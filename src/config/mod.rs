//! Configuration module
//!
//! Handles loading and validation of the application configuration and
//! serves immutable per-agent settings snapshots.

use anyhow::{Context, Result};
use arc_swap::ArcSwap;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use tracing::info;

use crate::collaborators::SettingsStore;
use crate::sim::SimConfig;
use crate::utils::types::{AgentId, TradingMode};

/// Main application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_mode")]
    pub mode: TradingMode,
    /// Global trading-allowed flag, passed explicitly into every decision
    #[serde(default)]
    pub trading_allowed: bool,
    /// Close every agent's positions on shutdown
    #[serde(default = "default_true")]
    pub close_on_exit: bool,
    #[serde(default)]
    pub supervisor: SupervisorConfig,
    #[serde(default)]
    pub risk: RiskConfig,
    pub agents: Vec<AgentConfig>,
    #[serde(default)]
    pub pairs: Vec<PairConfig>,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
    /// Synthetic market used in simulation mode
    #[serde(default)]
    pub simulation: SimConfig,
}

impl AppConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;

        let config = Self::from_yaml(&content)?;
        info!("Configuration loaded from {:?}", path);
        Ok(config)
    }

    pub fn from_yaml(content: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(content)
            .with_context(|| "Failed to parse config file")?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        anyhow::ensure!(!self.agents.is_empty(), "at least one agent must be configured");
        anyhow::ensure!(
            self.supervisor.retrain_concurrency >= 1,
            "retrain_concurrency must be at least 1"
        );
        anyhow::ensure!(
            self.risk.commission >= 0.0,
            "commission must not be negative"
        );
        anyhow::ensure!(
            self.risk.reward_risk_ratio > 0.0,
            "reward_risk_ratio must be positive"
        );

        let mut seen = HashSet::new();
        for agent in &self.agents {
            let id = agent.id();
            anyhow::ensure!(seen.insert(id.clone()), "duplicate agent {}", id);
            anyhow::ensure!(
                agent.settings.error_multiplier > 0.0,
                "error_multiplier for {} must be positive",
                id
            );
            anyhow::ensure!(
                agent.settings.window_size >= 2,
                "window_size for {} must be at least 2",
                id
            );
            anyhow::ensure!(
                agent.settings.learning_rate > 0.0,
                "learning_rate for {} must be positive",
                id
            );
        }

        for pair in &self.pairs {
            anyhow::ensure!(
                pair.fast != pair.slow,
                "pair {} needs two different timeframes",
                pair.instrument
            );
            for id in [pair.fast_id(), pair.slow_id()] {
                anyhow::ensure!(seen.contains(&id), "pair member {} is not a configured agent", id);
            }
        }
        Ok(())
    }

    /// Agents that do not belong to any pair
    pub fn standalone_agents(&self) -> Vec<&AgentConfig> {
        let paired: HashSet<AgentId> = self
            .pairs
            .iter()
            .flat_map(|p| [p.fast_id(), p.slow_id()])
            .collect();
        self.agents.iter().filter(|a| !paired.contains(&a.id())).collect()
    }

    /// Create a default config for testing
    #[cfg(test)]
    pub fn default_for_test() -> Self {
        Self {
            mode: TradingMode::Simulation,
            trading_allowed: true,
            close_on_exit: true,
            supervisor: SupervisorConfig::default(),
            risk: RiskConfig::default(),
            agents: vec![
                AgentConfig {
                    instrument: "EURUSD".to_string(),
                    timeframe: "H1".to_string(),
                    settings: AgentSettings::default(),
                },
                AgentConfig {
                    instrument: "EURUSD".to_string(),
                    timeframe: "D1".to_string(),
                    settings: AgentSettings::default(),
                },
            ],
            pairs: vec![PairConfig {
                instrument: "EURUSD".to_string(),
                fast: "H1".to_string(),
                slow: "D1".to_string(),
            }],
            telemetry: TelemetryConfig::default(),
            simulation: SimConfig::default(),
        }
    }
}

fn default_mode() -> TradingMode { TradingMode::Simulation }
fn default_true() -> bool { true }

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupervisorConfig {
    /// Maximum number of agents retraining at the same time
    #[serde(default = "default_retrain_concurrency")]
    pub retrain_concurrency: usize,
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
    /// Run the auto-cycle for every agent on startup
    #[serde(default)]
    pub auto_start: bool,
}

fn default_retrain_concurrency() -> usize { 2 }
fn default_poll_interval() -> u64 { 1000 }

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            retrain_concurrency: default_retrain_concurrency(),
            poll_interval_ms: default_poll_interval(),
            auto_start: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskConfig {
    /// Round-trip commission in price units
    #[serde(default = "default_commission")]
    pub commission: f64,
    /// Minimum distance between entry and target for an order to be sent
    #[serde(default = "default_min_profit")]
    pub min_profit: f64,
    /// Minimum distance between entry and stop
    #[serde(default = "default_min_stop_distance")]
    pub min_stop_distance: f64,
    /// Forecast range must be at least this fraction of current volatility
    #[serde(default = "default_volatility_filter_ratio")]
    pub volatility_filter_ratio: f64,
    #[serde(default = "default_reward_risk_ratio")]
    pub reward_risk_ratio: f64,
}

fn default_commission() -> f64 { 0.0005 }
fn default_min_profit() -> f64 { 0.0020 }
fn default_min_stop_distance() -> f64 { 0.0005 }
fn default_volatility_filter_ratio() -> f64 { 0.5 }
fn default_reward_risk_ratio() -> f64 { 3.0 }

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            commission: default_commission(),
            min_profit: default_min_profit(),
            min_stop_distance: default_min_stop_distance(),
            volatility_filter_ratio: default_volatility_filter_ratio(),
            reward_risk_ratio: default_reward_risk_ratio(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    pub instrument: String,
    pub timeframe: String,
    #[serde(default)]
    pub settings: AgentSettings,
}

impl AgentConfig {
    pub fn id(&self) -> AgentId {
        AgentId::new(&self.instrument, &self.timeframe)
    }
}

/// Immutable per-agent settings snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentSettings {
    #[serde(default = "default_window_size")]
    pub window_size: usize,
    #[serde(default = "default_epochs")]
    pub epochs: u32,
    #[serde(default = "default_batch_size")]
    pub batch_size: u32,
    #[serde(default = "default_error_multiplier")]
    pub error_multiplier: f64,
    #[serde(default = "default_learning_rate")]
    pub learning_rate: f64,
}

fn default_window_size() -> usize { 60 }
fn default_epochs() -> u32 { 20 }
fn default_batch_size() -> u32 { 32 }
fn default_error_multiplier() -> f64 { 1.5 }
fn default_learning_rate() -> f64 { 0.001 }

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            window_size: default_window_size(),
            epochs: default_epochs(),
            batch_size: default_batch_size(),
            error_multiplier: default_error_multiplier(),
            learning_rate: default_learning_rate(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PairConfig {
    pub instrument: String,
    pub fast: String,
    pub slow: String,
}

impl PairConfig {
    pub fn fast_id(&self) -> AgentId {
        AgentId::new(&self.instrument, &self.fast)
    }

    pub fn slow_id(&self) -> AgentId {
        AgentId::new(&self.instrument, &self.slow)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub json_logs: bool,
    pub log_file: Option<String>,
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,
    #[serde(default)]
    pub enable_metrics: bool,
    #[serde(default)]
    pub enable_alerts: bool,
    pub alert_webhook: Option<String>,
    /// Where agent status snapshots are written for external dashboards
    pub state_export_path: Option<String>,
}

fn default_log_level() -> String { "info".to_string() }
fn default_metrics_port() -> u16 { 9090 }

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            json_logs: false,
            log_file: None,
            metrics_port: default_metrics_port(),
            enable_metrics: false,
            enable_alerts: false,
            alert_webhook: None,
            state_export_path: None,
        }
    }
}

/// Flags the operator may change while the supervisor runs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RuntimeFlags {
    pub trading_allowed: bool,
}

/// Lock-free holder of the current [`RuntimeFlags`]
pub struct SharedFlags {
    inner: ArcSwap<RuntimeFlags>,
}

impl SharedFlags {
    pub fn new(flags: RuntimeFlags) -> Self {
        Self {
            inner: ArcSwap::from_pointee(flags),
        }
    }

    pub fn from_config(config: &AppConfig) -> Self {
        Self::new(RuntimeFlags {
            trading_allowed: config.trading_allowed,
        })
    }

    pub fn load(&self) -> RuntimeFlags {
        **self.inner.load()
    }

    pub fn trading_allowed(&self) -> bool {
        self.load().trading_allowed
    }

    pub fn set_trading_allowed(&self, allowed: bool) {
        self.inner.store(std::sync::Arc::new(RuntimeFlags {
            trading_allowed: allowed,
        }));
        info!("Global trading allowed: {}", allowed);
    }
}

/// Settings store backed by the loaded configuration
pub struct ConfigSettingsStore {
    agents: Vec<AgentConfig>,
}

impl ConfigSettingsStore {
    pub fn new(config: &AppConfig) -> Self {
        Self {
            agents: config.agents.clone(),
        }
    }
}

#[async_trait]
impl SettingsStore for ConfigSettingsStore {
    async fn load(&self, agent: &AgentId) -> Result<AgentSettings> {
        self.agents
            .iter()
            .find(|a| &a.id() == agent)
            .map(|a| a.settings.clone())
            .ok_or_else(|| anyhow::anyhow!("no settings for agent {}", agent))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const YAML: &str = r#"
mode: trade
trading_allowed: true
supervisor:
  retrain_concurrency: 1
agents:
  - instrument: EURUSD
    timeframe: H1
    settings:
      error_multiplier: 2.0
  - instrument: EURUSD
    timeframe: D1
  - instrument: GBPUSD
    timeframe: H1
pairs:
  - instrument: EURUSD
    fast: H1
    slow: D1
"#;

    #[test]
    fn test_parse_and_defaults() {
        let config = AppConfig::from_yaml(YAML).unwrap();
        assert_eq!(config.mode, TradingMode::Trade);
        assert!(config.close_on_exit);
        assert_eq!(config.supervisor.retrain_concurrency, 1);
        assert_eq!(config.agents[0].settings.error_multiplier, 2.0);
        assert_eq!(config.agents[1].settings.window_size, 60);
        assert_eq!(config.risk.reward_risk_ratio, 3.0);
    }

    #[test]
    fn test_standalone_agents_exclude_pair_members() {
        let config = AppConfig::from_yaml(YAML).unwrap();
        let standalone: Vec<AgentId> = config.standalone_agents().iter().map(|a| a.id()).collect();
        assert_eq!(standalone, vec![AgentId::new("GBPUSD", "H1")]);
    }

    #[test]
    fn test_rejects_unknown_pair_member() {
        let yaml = r#"
agents:
  - instrument: EURUSD
    timeframe: H1
pairs:
  - instrument: EURUSD
    fast: H1
    slow: H4
"#;
        assert!(AppConfig::from_yaml(yaml).is_err());
    }

    #[test]
    fn test_rejects_non_positive_multiplier() {
        let yaml = r#"
agents:
  - instrument: EURUSD
    timeframe: H1
    settings:
      error_multiplier: 0.0
"#;
        assert!(AppConfig::from_yaml(yaml).is_err());
    }

    #[test]
    fn test_default_config_is_valid() {
        assert!(AppConfig::default_for_test().validate().is_ok());
    }

    #[test]
    fn test_shared_flags_toggle() {
        let flags = SharedFlags::from_config(&AppConfig::default_for_test());
        assert!(flags.trading_allowed());
        flags.set_trading_allowed(false);
        assert_eq!(flags.load(), RuntimeFlags { trading_allowed: false });
    }

    #[tokio::test]
    async fn test_settings_store_snapshot() {
        let config = AppConfig::from_yaml(YAML).unwrap();
        let store = ConfigSettingsStore::new(&config);
        let settings = store.load(&AgentId::new("EURUSD", "H1")).await.unwrap();
        assert_eq!(settings.error_multiplier, 2.0);
        assert!(store.load(&AgentId::new("USDJPY", "H1")).await.is_err());
    }
}
