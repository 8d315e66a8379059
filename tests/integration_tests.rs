//! Integration Tests for the Forecast Supervisor
//!
//! Drives agents, pairs and the supervisor through the simulation
//! collaborators and a few scripted models.

use anyhow::Result;
use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use forecast_supervisor::agent::{AgentRuntime, BarOutcome, PairCoordinator, TradingAgent};
use forecast_supervisor::collaborators::{
    Collaborators, FineTuneRequest, ForecastModel, PerformanceReport, SettingsStore, TrainingPlan,
};
use forecast_supervisor::config::{AgentSettings, AppConfig, RiskConfig, RuntimeFlags, SharedFlags};
use forecast_supervisor::control::AdmissionController;
use forecast_supervisor::events::{Event, EventBus};
use forecast_supervisor::execution::PaperExecution;
use forecast_supervisor::position::PositionBook;
use forecast_supervisor::sim::{SimConfig, SimMarket, SimModel};
use forecast_supervisor::state::StateExporter;
use forecast_supervisor::supervisor::Supervisor;
use forecast_supervisor::utils::types::{AgentId, Bar, Forecast, TradingMode};
use forecast_supervisor::AgentStatus;

struct FixedSettings(AgentSettings);

#[async_trait]
impl SettingsStore for FixedSettings {
    async fn load(&self, _agent: &AgentId) -> Result<AgentSettings> {
        Ok(self.0.clone())
    }
}

/// Always forecasts a strong rise with a tight stop, so every bar is a BUY
struct BullishModel;

#[async_trait]
impl ForecastModel for BullishModel {
    async fn load_weights(&self, _agent: &AgentId) -> Result<bool> {
        Ok(true)
    }

    async fn predict(&self, _agent: &AgentId, window: &[Bar]) -> Result<Forecast> {
        let last = window.last().ok_or_else(|| anyhow::anyhow!("empty window"))?;
        let close = last.close + 3.0;
        Ok(Forecast::new(close, close + 0.1, last.close - 0.5))
    }

    async fn full_retrain(&self, _agent: &AgentId, _plan: &TrainingPlan) -> Result<bool> {
        Ok(true)
    }

    async fn fine_tune(&self, _agent: &AgentId, _recent: &[Bar], _request: &FineTuneRequest) -> Result<()> {
        Ok(())
    }

    async fn evaluate_performance(&self, _agent: &AgentId) -> Result<PerformanceReport> {
        Ok(PerformanceReport { passed: true, error_metric: 0.0 })
    }
}

/// Records how many full retrains run at the same time
#[derive(Default)]
struct RetrainRecorder {
    active: AtomicUsize,
    peak: AtomicUsize,
}

#[async_trait]
impl ForecastModel for RetrainRecorder {
    async fn load_weights(&self, _agent: &AgentId) -> Result<bool> {
        Ok(false)
    }

    async fn predict(&self, _agent: &AgentId, _window: &[Bar]) -> Result<Forecast> {
        Ok(Forecast::new(1.0, 1.0, 1.0))
    }

    async fn full_retrain(&self, _agent: &AgentId, _plan: &TrainingPlan) -> Result<bool> {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(20)).await;
        self.active.fetch_sub(1, Ordering::SeqCst);
        Ok(true)
    }

    async fn fine_tune(&self, _agent: &AgentId, _recent: &[Bar], _request: &FineTuneRequest) -> Result<()> {
        Ok(())
    }

    async fn evaluate_performance(&self, _agent: &AgentId) -> Result<PerformanceReport> {
        Ok(PerformanceReport { passed: true, error_metric: 0.0 })
    }
}

struct Harness {
    market: Arc<SimMarket>,
    execution: Arc<PaperExecution>,
    flags: Arc<SharedFlags>,
    runtime: AgentRuntime,
    exporter: Arc<StateExporter>,
}

impl Harness {
    fn new(mode: TradingMode, retrain_limit: usize) -> Self {
        let market = Arc::new(SimMarket::new(SimConfig::default()));
        let flags = Arc::new(SharedFlags::new(RuntimeFlags { trading_allowed: true }));
        let execution = Arc::new(PaperExecution::new(
            Arc::new(PositionBook::new()),
            market.clone(),
            flags.clone(),
            RiskConfig::default(),
        ));
        let exporter = Arc::new(StateExporter::default());
        let runtime = AgentRuntime {
            mode,
            admission: Arc::new(AdmissionController::new(retrain_limit)),
            risk: RiskConfig::default(),
            sink: exporter.clone(),
            events: EventBus::default(),
        };
        Self {
            market,
            execution,
            flags,
            runtime,
            exporter,
        }
    }

    fn agent(&self, id: AgentId, model: Arc<dyn ForecastModel>, settings: AgentSettings) -> TradingAgent {
        let collaborators = Collaborators {
            model,
            market: self.market.clone(),
            quotes: self.market.clone(),
            gateway: self.execution.clone(),
            settings: Arc::new(FixedSettings(settings.clone())),
        };
        TradingAgent::new(id, settings, collaborators, &self.runtime)
    }
}

/// Tolerant multiplier so the scripted forecasts never trip the drift controller
fn lenient() -> AgentSettings {
    AgentSettings {
        error_multiplier: 50.0,
        ..AgentSettings::default()
    }
}

#[test]
fn test_config_validation() {
    let yaml = r#"
mode: simulation
trading_allowed: false
supervisor:
  retrain_concurrency: 2
  poll_interval_ms: 500
agents:
  - instrument: EURUSD
    timeframe: H1
  - instrument: EURUSD
    timeframe: D1
pairs:
  - instrument: EURUSD
    fast: H1
    slow: D1
simulation:
  seed: 7
  step: 0.5
"#;
    let config = AppConfig::from_yaml(yaml).unwrap();
    assert_eq!(config.mode, TradingMode::Simulation);
    assert!(config.standalone_agents().is_empty());
    assert_eq!(config.simulation.seed, 7);
    assert_eq!(config.simulation.start_price, 100.0);

    let duplicate = r#"
agents:
  - instrument: EURUSD
    timeframe: H1
  - instrument: EURUSD
    timeframe: H1
"#;
    assert!(AppConfig::from_yaml(duplicate).is_err());
}

#[tokio::test]
async fn test_sim_agent_lifecycle() {
    let harness = Harness::new(TradingMode::Simulation, 1);
    let model = Arc::new(SimModel::new(harness.market.clone()));
    let id = AgentId::new("SIM", "H1");
    let mut agent = harness.agent(id.clone(), model.clone(), AgentSettings::default());

    agent.initialize(false).await;
    assert_eq!(agent.status(), AgentStatus::WaitTest);
    assert_eq!(model.retrain_count(&id), 1);

    assert!(agent.start_auto_cycle().await);
    assert_eq!(agent.status(), AgentStatus::Ok);

    let mut processed = 0;
    for _ in 0..50 {
        if let Some(BarOutcome::Processed { .. }) = agent.tick(harness.flags.load()).await.unwrap() {
            processed += 1;
        }
        let snapshot = harness.exporter.get("SIM_H1").unwrap();
        assert!((0.0..=100.0).contains(&snapshot.confidence));
        assert!(snapshot.warning_count < 3);
    }
    assert!(processed > 0);
    // simulation never trades
    assert_eq!(harness.execution.book().open_count(), 0);
    assert!(harness.execution.book().history().is_empty());
}

#[tokio::test]
async fn test_trade_mode_opens_and_manages_positions() {
    let harness = Harness::new(TradingMode::Trade, 1);
    let mut events = harness.runtime.events.subscribe();
    let id = AgentId::new("SIM", "H1");
    let mut agent = harness.agent(id.clone(), Arc::new(BullishModel), lenient());

    agent.initialize(false).await;
    assert!(agent.start_auto_cycle().await);

    for _ in 0..20 {
        agent.tick(harness.flags.load()).await.unwrap();
        harness.execution.manage(&id).await.unwrap();
    }

    let book = harness.execution.book();
    assert!(book.open_count() + book.history().len() > 0);

    let mut entries = 0;
    while let Ok(event) = events.try_recv() {
        if matches!(event, Event::EntryOpened { .. }) {
            entries += 1;
        }
    }
    assert!(entries > 0);
}

#[tokio::test]
async fn test_trading_disallowed_blocks_entries() {
    let harness = Harness::new(TradingMode::Trade, 1);
    let id = AgentId::new("SIM", "H1");
    let mut agent = harness.agent(id.clone(), Arc::new(BullishModel), lenient());
    agent.initialize(false).await;
    agent.start_auto_cycle().await;

    // the gateway veto alone is enough
    harness.flags.set_trading_allowed(false);
    let permissive = RuntimeFlags { trading_allowed: true };
    for _ in 0..10 {
        agent.tick(permissive).await.unwrap();
    }
    assert_eq!(harness.execution.book().open_count(), 0);

    // and so is the flag passed into the decision
    harness.flags.set_trading_allowed(true);
    for _ in 0..10 {
        let outcome = agent.tick(RuntimeFlags { trading_allowed: false }).await.unwrap();
        assert!(!matches!(outcome, Some(BarOutcome::Processed { opened: true, .. })));
    }
    assert_eq!(harness.execution.book().open_count(), 0);
}

#[tokio::test]
async fn test_pair_fast_trades_only_when_green() {
    let harness = Harness::new(TradingMode::Trade, 1);
    let fast = harness.agent(AgentId::new("SIM", "H1"), Arc::new(BullishModel), lenient());
    let slow = harness.agent(AgentId::new("SIM", "D1"), Arc::new(BullishModel), lenient());
    let mut pair = PairCoordinator::new(
        fast,
        slow,
        harness.runtime.admission.clone(),
        harness.runtime.events.clone(),
    );
    for agent in pair.agents_mut() {
        agent.initialize(false).await;
        assert!(agent.start_auto_cycle().await);
    }

    let mut ticks = 0;
    for _ in 0..20 {
        let Some(tick) = pair.tick(harness.flags.load()).await.unwrap() else {
            continue;
        };
        ticks += 1;
        if let BarOutcome::Processed { opened: true, .. } = tick.fast {
            assert!(tick.green);
        }
        // the slow agent never trades
        assert!(!matches!(tick.slow, Some(BarOutcome::Processed { opened: true, .. })));
    }
    assert!(ticks > 0);

    let book = harness.execution.book();
    assert!(book.for_agent(&AgentId::new("SIM", "D1")).is_empty());
    assert!(book.history().iter().all(|trade| trade.agent == AgentId::new("SIM", "H1")));
}

#[tokio::test]
async fn test_admission_bounds_concurrent_retrains() {
    let harness = Harness::new(TradingMode::Simulation, 2);
    let recorder = Arc::new(RetrainRecorder::default());
    let mut agents: Vec<TradingAgent> = (0..4)
        .map(|i| harness.agent(AgentId::new(format!("SIM{}", i), "H1"), recorder.clone(), AgentSettings::default()))
        .collect();

    let results = futures::future::join_all(agents.iter_mut().map(|agent| agent.start_auto_cycle())).await;
    assert!(results.into_iter().all(|accepted| accepted));
    assert!(recorder.peak.load(Ordering::SeqCst) <= 2);
    assert!(recorder.peak.load(Ordering::SeqCst) >= 1);
    assert_eq!(harness.runtime.admission.in_use(), 0);
}

#[tokio::test]
async fn test_supervisor_exports_state() {
    let path = std::env::temp_dir().join(format!("agent_states_{}.json", uuid::Uuid::new_v4()));
    let mut config = AppConfig::from_yaml(
        r#"
mode: simulation
supervisor:
  poll_interval_ms: 5
  auto_start: true
agents:
  - instrument: GBPUSD
    timeframe: M15
"#,
    )
    .unwrap();
    config.telemetry.state_export_path = Some(path.to_string_lossy().into_owned());

    let market = Arc::new(SimMarket::new(config.simulation.clone()));
    let model = Arc::new(SimModel::new(market.clone()));
    let mut supervisor = Supervisor::new(config, model, market.clone(), market);
    supervisor.spawn();

    let mut exported = None;
    for _ in 0..400 {
        if let Ok(body) = std::fs::read(&path) {
            if let Ok(value) = serde_json::from_slice::<serde_json::Value>(&body) {
                if value["GBPUSD_M15"]["isActive"] == true {
                    exported = Some(value);
                    break;
                }
            }
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    supervisor.shutdown().await.unwrap();
    let exported = exported.expect("state file never showed an active agent");
    assert_eq!(exported["GBPUSD_M15"]["mode"], "simulation");
    std::fs::remove_file(&path).ok();
}
