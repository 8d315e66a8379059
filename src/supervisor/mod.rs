//! Supervisor Runtime
//!
//! Runs every configured agent:
//! - One tokio task per standalone agent or pair, polling for new bars
//! - Operator commands routed to the owning task over mpsc
//! - Alerts on fatal agents and RED pairs
//! - Graceful shutdown, optionally closing every position

use anyhow::Result;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::agent::{AgentRuntime, PairCoordinator, TradingAgent};
use crate::collaborators::{Collaborators, ForecastModel, MarketDataProvider, QuoteSource};
use crate::config::{AgentConfig, AppConfig, ConfigSettingsStore, RuntimeFlags, SharedFlags};
use crate::control::AdmissionController;
use crate::events::{spawn_event_handler, Event, EventBus};
use crate::execution::PaperExecution;
use crate::position::PositionBook;
use crate::state::StateExporter;
use crate::telemetry::{Alert, AlertManager};
use crate::utils::types::AgentId;

const COMMAND_BUFFER: usize = 32;

/// Operator action on one agent
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperatorCommand {
    Start,
    Stop,
    AutoCycle,
    Test,
    Fit,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CommandError {
    #[error("unknown agent {0}")]
    UnknownAgent(AgentId),
    #[error("agent task for {0} has stopped")]
    Closed(AgentId),
}

#[derive(Debug)]
struct Envelope {
    agent: AgentId,
    command: OperatorCommand,
}

/// Clonable operator handle
#[derive(Clone)]
pub struct SupervisorHandle {
    routes: Arc<HashMap<AgentId, mpsc::Sender<Envelope>>>,
    flags: Arc<SharedFlags>,
    events: EventBus,
}

impl SupervisorHandle {
    pub async fn send(&self, agent: &AgentId, command: OperatorCommand) -> Result<(), CommandError> {
        let route = self
            .routes
            .get(agent)
            .ok_or_else(|| CommandError::UnknownAgent(agent.clone()))?;
        route
            .send(Envelope {
                agent: agent.clone(),
                command,
            })
            .await
            .map_err(|_| CommandError::Closed(agent.clone()))
    }

    pub fn set_trading_allowed(&self, allowed: bool) {
        self.flags.set_trading_allowed(allowed);
        self.events.publish(Event::TradingAllowedChanged { allowed });
    }

    pub fn agents(&self) -> Vec<AgentId> {
        let mut agents: Vec<AgentId> = self.routes.keys().cloned().collect();
        agents.sort();
        agents
    }
}

/// Work owned by one task
enum Unit {
    Agent(Box<TradingAgent>),
    Pair(Box<PairCoordinator>),
}

impl Unit {
    fn agents_mut(&mut self) -> Vec<&mut TradingAgent> {
        match self {
            Unit::Agent(agent) => vec![agent.as_mut()],
            Unit::Pair(pair) => pair.agents_mut().into(),
        }
    }

    fn ids(&self) -> Vec<AgentId> {
        match self {
            Unit::Agent(agent) => vec![agent.id().clone()],
            Unit::Pair(pair) => vec![pair.fast().id().clone(), pair.slow().id().clone()],
        }
    }

    async fn initialize(&mut self, auto_start: bool) {
        for agent in self.agents_mut() {
            agent.initialize(false).await;
            if auto_start {
                agent.start_auto_cycle().await;
            }
        }
    }

    async fn tick(&mut self, flags: RuntimeFlags) -> Result<()> {
        match self {
            Unit::Agent(agent) => {
                agent.tick(flags).await?;
            }
            Unit::Pair(pair) => {
                pair.tick(flags).await?;
            }
        }
        Ok(())
    }

    async fn handle(&mut self, envelope: Envelope) {
        let Some(agent) = self.agents_mut().into_iter().find(|a| a.id() == &envelope.agent) else {
            warn!(agent = %envelope.agent, "Command routed to the wrong task");
            return;
        };
        info!(agent = %envelope.agent, command = ?envelope.command, "Operator command");
        match envelope.command {
            OperatorCommand::Start => agent.start(),
            OperatorCommand::Stop => agent.stop(),
            OperatorCommand::AutoCycle => {
                agent.start_auto_cycle().await;
            }
            OperatorCommand::Test => {
                agent.run_diagnostic_test().await;
            }
            OperatorCommand::Fit => {
                agent.manual_fit().await;
            }
        }
    }
}

struct UnitContext {
    flags: Arc<SharedFlags>,
    execution: Arc<PaperExecution>,
    poll_interval: Duration,
    auto_start: bool,
}

async fn run_unit(
    mut unit: Unit,
    mut commands: mpsc::Receiver<Envelope>,
    mut shutdown: broadcast::Receiver<()>,
    ctx: UnitContext,
) {
    unit.initialize(ctx.auto_start).await;
    let ids = unit.ids();

    let mut ticker = tokio::time::interval(ctx.poll_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            Some(envelope) = commands.recv() => {
                unit.handle(envelope).await;
            }

            _ = ticker.tick() => {
                if let Err(e) = unit.tick(ctx.flags.load()).await {
                    warn!(agents = ?ids, error = %e, "Market data unavailable, bar skipped");
                }
                for id in &ids {
                    if let Err(e) = ctx.execution.manage(id).await {
                        warn!(agent = %id, error = %e, "Position management failed");
                    }
                }
            }

            _ = shutdown.recv() => {
                debug!(agents = ?ids, "Agent task stopping");
                break;
            }
        }
    }
}

/// Owns the shared services and the agent tasks
pub struct Supervisor {
    config: AppConfig,
    model: Arc<dyn ForecastModel>,
    market: Arc<dyn MarketDataProvider>,
    quotes: Arc<dyn QuoteSource>,
    execution: Arc<PaperExecution>,
    exporter: Arc<StateExporter>,
    flags: Arc<SharedFlags>,
    admission: Arc<AdmissionController>,
    events: EventBus,
    shutdown: broadcast::Sender<()>,
    tasks: Vec<JoinHandle<()>>,
    alert_task: Option<JoinHandle<()>>,
}

impl Supervisor {
    pub fn new(
        config: AppConfig,
        model: Arc<dyn ForecastModel>,
        market: Arc<dyn MarketDataProvider>,
        quotes: Arc<dyn QuoteSource>,
    ) -> Self {
        let flags = Arc::new(SharedFlags::from_config(&config));
        let execution = Arc::new(PaperExecution::new(
            Arc::new(PositionBook::new()),
            Arc::clone(&quotes),
            Arc::clone(&flags),
            config.risk.clone(),
        ));
        let exporter = Arc::new(StateExporter::new(
            config.telemetry.state_export_path.as_ref().map(PathBuf::from),
        ));
        let admission = Arc::new(AdmissionController::new(config.supervisor.retrain_concurrency));
        let (shutdown, _) = broadcast::channel(1);

        Self {
            config,
            model,
            market,
            quotes,
            execution,
            exporter,
            flags,
            admission,
            events: EventBus::default(),
            shutdown,
            tasks: Vec::new(),
            alert_task: None,
        }
    }

    pub fn exporter(&self) -> &Arc<StateExporter> {
        &self.exporter
    }

    pub fn execution(&self) -> &Arc<PaperExecution> {
        &self.execution
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn admission(&self) -> &Arc<AdmissionController> {
        &self.admission
    }

    fn runtime(&self) -> AgentRuntime {
        AgentRuntime {
            mode: self.config.mode,
            admission: Arc::clone(&self.admission),
            risk: self.config.risk.clone(),
            sink: self.exporter.clone(),
            events: self.events.clone(),
        }
    }

    fn build_agent(&self, config: &AgentConfig, runtime: &AgentRuntime) -> TradingAgent {
        let collaborators = Collaborators {
            model: Arc::clone(&self.model),
            market: Arc::clone(&self.market),
            quotes: Arc::clone(&self.quotes),
            gateway: self.execution.clone(),
            settings: Arc::new(ConfigSettingsStore::new(&self.config)),
        };
        TradingAgent::new(config.id(), config.settings.clone(), collaborators, runtime)
    }

    fn build_units(&self) -> Vec<Unit> {
        let runtime = self.runtime();
        let mut units: Vec<Unit> = self
            .config
            .standalone_agents()
            .into_iter()
            .map(|agent| Unit::Agent(Box::new(self.build_agent(agent, &runtime))))
            .collect();

        for pair in &self.config.pairs {
            let member = |id: AgentId| self.config.agents.iter().find(|a| a.id() == id);
            // validated on load
            let (Some(fast), Some(slow)) = (member(pair.fast_id()), member(pair.slow_id())) else {
                continue;
            };
            units.push(Unit::Pair(Box::new(PairCoordinator::new(
                self.build_agent(fast, &runtime),
                self.build_agent(slow, &runtime),
                Arc::clone(&self.admission),
                self.events.clone(),
            ))));
        }
        units
    }

    fn spawn_alerts(&self) -> JoinHandle<()> {
        let alerts = Arc::new(AlertManager::new(&self.config.telemetry));
        spawn_event_handler(&self.events, "alerts", move |event| {
            let alerts = Arc::clone(&alerts);
            async move {
                match event {
                    Event::AgentFatal { agent } => {
                        alerts
                            .send(
                                Alert::critical(
                                    format!("{} halted", agent),
                                    "Model keeps failing validation, operator intervention required",
                                )
                                .with_details(serde_json::json!({ "agent": agent.to_string() })),
                            )
                            .await;
                    }
                    Event::PairPermission { instrument, green: false } => {
                        alerts
                            .send(Alert::warning(
                                format!("{} pair RED", instrument),
                                "Trading suspended and pair positions closed",
                            ))
                            .await;
                    }
                    _ => {}
                }
            }
        })
    }

    /// Spawn one task per agent or pair and return the operator handle
    pub fn spawn(&mut self) -> SupervisorHandle {
        self.alert_task = Some(self.spawn_alerts());

        let mut routes = HashMap::new();
        for unit in self.build_units() {
            let (tx, rx) = mpsc::channel(COMMAND_BUFFER);
            for id in unit.ids() {
                routes.insert(id, tx.clone());
            }
            let ctx = UnitContext {
                flags: Arc::clone(&self.flags),
                execution: Arc::clone(&self.execution),
                poll_interval: Duration::from_millis(self.config.supervisor.poll_interval_ms.max(1)),
                auto_start: self.config.supervisor.auto_start,
            };
            self.tasks
                .push(tokio::spawn(run_unit(unit, rx, self.shutdown.subscribe(), ctx)));
        }

        info!(
            tasks = self.tasks.len(),
            agents = routes.len(),
            mode = %self.config.mode,
            "Supervisor started"
        );
        SupervisorHandle {
            routes: Arc::new(routes),
            flags: Arc::clone(&self.flags),
            events: self.events.clone(),
        }
    }

    /// Stop every task; returns the number of positions closed on exit
    pub async fn shutdown(mut self) -> Result<usize> {
        info!("Supervisor shutting down");
        // receivers may already be gone
        let _ = self.shutdown.send(());
        for task in self.tasks.drain(..) {
            if let Err(e) = task.await {
                warn!(error = %e, "Agent task ended abnormally");
            }
        }

        let closed = if self.config.close_on_exit {
            self.execution.close_everything("shutdown").await?
        } else {
            0
        };

        self.events.publish(Event::Shutdown);
        if let Some(task) = self.alert_task.take() {
            let _ = task.await;
        }
        info!(closed, realized_pnl = self.execution.book().realized_pnl(), "Supervisor stopped");
        Ok(closed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{SimConfig, SimMarket, SimModel};
    use crate::utils::types::{Direction, Position};

    fn sim_supervisor(mut config: AppConfig) -> Supervisor {
        config.supervisor.poll_interval_ms = 5;
        let market = Arc::new(SimMarket::new(SimConfig::default()));
        let model = Arc::new(SimModel::new(market.clone()));
        Supervisor::new(config, model, market.clone(), market)
    }

    async fn wait_for(exporter: &StateExporter, id: &str, status: &str) -> bool {
        for _ in 0..400 {
            if exporter.get(id).is_some_and(|s| s.status == status) {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        false
    }

    #[tokio::test]
    async fn test_unknown_agent_command() {
        let mut supervisor = sim_supervisor(AppConfig::default_for_test());
        let handle = supervisor.spawn();
        let missing = AgentId::new("USDJPY", "H1");
        assert_eq!(
            handle.send(&missing, OperatorCommand::Start).await,
            Err(CommandError::UnknownAgent(missing))
        );
        assert_eq!(handle.agents().len(), 2);
        supervisor.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_auto_start_brings_pair_online() {
        let mut config = AppConfig::default_for_test();
        config.supervisor.auto_start = true;
        let mut supervisor = sim_supervisor(config);
        supervisor.spawn();

        let exporter = Arc::clone(supervisor.exporter());
        assert!(wait_for(&exporter, "EURUSD_H1", "OK").await);
        assert!(wait_for(&exporter, "EURUSD_D1", "OK").await);
        assert!(exporter.get("EURUSD_H1").unwrap().is_active);
        supervisor.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_operator_commands_reach_agent() {
        let mut supervisor = sim_supervisor(AppConfig::default_for_test());
        let handle = supervisor.spawn();
        let exporter = Arc::clone(supervisor.exporter());
        let id = AgentId::new("EURUSD", "H1");

        assert!(wait_for(&exporter, "EURUSD_H1", "WAIT_TEST").await);
        handle.send(&id, OperatorCommand::Start).await.unwrap();
        handle.send(&id, OperatorCommand::Test).await.unwrap();
        assert!(wait_for(&exporter, "EURUSD_H1", "OK").await);

        handle.send(&id, OperatorCommand::Stop).await.unwrap();
        assert!(wait_for(&exporter, "EURUSD_H1", "PAUSED").await);
        supervisor.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_trading_allowed_toggle_is_published() {
        let mut supervisor = sim_supervisor(AppConfig::default_for_test());
        let mut rx = supervisor.events().subscribe();
        let handle = supervisor.spawn();

        handle.set_trading_allowed(false);
        assert!(!supervisor.flags.trading_allowed());
        loop {
            if let Event::TradingAllowedChanged { allowed } = rx.recv().await.unwrap() {
                assert!(!allowed);
                break;
            }
        }
        supervisor.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_closes_positions() {
        let mut supervisor = sim_supervisor(AppConfig::default_for_test());
        let position = Position::new(AgentId::new("GBPUSD", "H1"), Direction::Long, 1.25, 1.30, 1.20);
        supervisor.execution().book().open(position);

        assert_eq!(supervisor.shutdown().await.unwrap(), 1);
    }
}
