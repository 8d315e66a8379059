//! Agent Module
//!
//! Supervised trading agents:
//! - Lifecycle state machine and reported status
//! - Risk gate for entries and trailing exits
//! - Orchestrator driving retrain, validation and the per-bar loop
//! - Pair coordinator for hierarchical fast/slow agents

pub mod orchestrator;
pub mod pair;
pub mod risk_gate;
pub mod state_machine;

pub use orchestrator::{
    confidence_score, BarContext, BarOutcome, FitOutcome, Orchestrator, RebuildPolicy, RetrainOutcome,
};
pub use pair::{PairCoordinator, PairTick};
pub use risk_gate::{EntryEvaluation, ExitReason, RiskGate, TrailingExit};
pub use state_machine::{AgentStatus, LifecycleStateMachine, StatusTransition};

use anyhow::Result;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::collaborators::{Collaborators, ForecastModel, MarketDataProvider, StateSink};
use crate::config::{AgentSettings, RiskConfig, RuntimeFlags};
use crate::control::AdmissionController;
use crate::events::{Event, EventBus};
use crate::telemetry;
use crate::utils::types::{AgentId, MarketWindow, StatusSnapshot, TradingMode};

/// Shared services every agent is built with
#[derive(Clone)]
pub struct AgentRuntime {
    pub mode: TradingMode,
    pub admission: Arc<AdmissionController>,
    pub risk: RiskConfig,
    pub sink: Arc<dyn StateSink>,
    pub events: EventBus,
}

/// One supervised (instrument, timeframe) agent: orchestrator plus reported status
pub struct TradingAgent {
    orchestrator: Orchestrator,
    lifecycle: LifecycleStateMachine,
    model: Arc<dyn ForecastModel>,
    market: Arc<dyn MarketDataProvider>,
    sink: Arc<dyn StateSink>,
    events: EventBus,
    mode: TradingMode,
    /// Operator stop; entries stay suppressed while set
    manual_stop: bool,
    last_bar_time: Option<i64>,
}

impl TradingAgent {
    pub fn new(id: AgentId, settings: AgentSettings, collaborators: Collaborators, runtime: &AgentRuntime) -> Self {
        let model = Arc::clone(&collaborators.model);
        let market = Arc::clone(&collaborators.market);
        let lifecycle = LifecycleStateMachine::new(id.to_string());
        let orchestrator = Orchestrator::new(
            id,
            settings,
            collaborators,
            Arc::clone(&runtime.admission),
            &runtime.risk,
        );

        Self {
            orchestrator,
            lifecycle,
            model,
            market,
            sink: Arc::clone(&runtime.sink),
            events: runtime.events.clone(),
            mode: runtime.mode,
            manual_stop: true,
            last_bar_time: None,
        }
    }

    pub fn with_rebuild_policy(mut self, policy: RebuildPolicy) -> Self {
        self.orchestrator = self.orchestrator.with_rebuild_policy(policy);
        self
    }

    pub fn id(&self) -> &AgentId {
        self.orchestrator.id()
    }

    pub fn status(&self) -> AgentStatus {
        self.lifecycle.current_status()
    }

    pub fn mode(&self) -> TradingMode {
        self.mode
    }

    pub fn is_manually_stopped(&self) -> bool {
        self.manual_stop
    }

    pub fn orchestrator(&self) -> &Orchestrator {
        &self.orchestrator
    }

    pub fn lifecycle(&self) -> &LifecycleStateMachine {
        &self.lifecycle
    }

    /// Load persisted weights, or train from scratch when none exist or
    /// `force_train` is set. The model always awaits a test afterwards.
    pub async fn initialize(&mut self, force_train: bool) -> bool {
        let loaded = if force_train {
            false
        } else {
            match self.model.load_weights(self.id()).await {
                Ok(loaded) => loaded,
                Err(e) => {
                    warn!(agent = %self.id(), error = %e, "Failed to load weights");
                    false
                }
            }
        };

        let ready = if loaded {
            info!(agent = %self.id(), "Weights loaded");
            true
        } else {
            self.set_status(AgentStatus::Training, "initial training");
            self.orchestrator.rebuild(self.mode).await
        };

        self.set_status(AgentStatus::WaitTest, "awaiting test");
        self.publish_snapshot();
        ready
    }

    /// Operator-triggered auto-cycle with a fresh retrain budget
    pub async fn start_auto_cycle(&mut self) -> bool {
        self.orchestrator.clear_cycle_bound();
        self.set_status(AgentStatus::Training, "auto-cycle");

        let accepted = self.orchestrator.run_auto_cycle(self.mode).await;
        if accepted {
            self.manual_stop = false;
            self.set_status(AgentStatus::Ok, "auto-cycle accepted");
        } else {
            self.enter_fatal();
        }
        self.publish_snapshot();
        accepted
    }

    /// Operator-triggered performance test
    pub async fn run_diagnostic_test(&mut self) -> bool {
        self.set_status(AgentStatus::Testing, "diagnostic test");
        let passed = self.orchestrator.run_test_diagnostics().await;
        let next = if passed { AgentStatus::Ok } else { AgentStatus::WaitTest };
        self.set_status(next, "diagnostic test finished");
        self.refresh_status();
        self.publish_snapshot();
        passed
    }

    /// Operator-triggered light adaptation
    pub async fn manual_fit(&mut self) -> bool {
        let adapted = self.orchestrator.manual_fit(self.mode).await;
        info!(agent = %self.id(), adapted, "Manual fit finished");
        self.publish_snapshot();
        adapted
    }

    pub fn start(&mut self) {
        self.manual_stop = false;
        info!(agent = %self.id(), "Agent started");
        self.refresh_status();
        self.publish_snapshot();
    }

    pub fn stop(&mut self) {
        self.manual_stop = true;
        info!(agent = %self.id(), "Agent stopped");
        self.refresh_status();
        self.publish_snapshot();
    }

    /// Latest full window if a new bar closed since the last call
    pub async fn poll_window(&mut self) -> Result<Option<MarketWindow>> {
        let window_size = self.orchestrator.settings().window_size;
        let Some(window) = self.market.latest_window(self.id(), window_size).await? else {
            return Ok(None);
        };
        if window.bars.len() < window_size {
            debug!(agent = %self.id(), bars = window.bars.len(), "Not enough history yet");
            return Ok(None);
        }

        let Some(bar_time) = window.bar_time() else {
            return Ok(None);
        };
        if self.last_bar_time.is_some_and(|last| bar_time <= last) {
            return Ok(None);
        }
        self.last_bar_time = Some(bar_time);
        Ok(Some(window))
    }

    /// Run the decision loop for one closed bar and publish the resulting status
    pub async fn on_bar(&mut self, window: &MarketWindow, ctx: &BarContext) -> BarOutcome {
        let mut ctx = *ctx;
        ctx.global_trading_allowed &= !self.manual_stop;

        let outcome = self.orchestrator.process_bar(window, &ctx).await;
        match outcome {
            BarOutcome::Processed { signal, opened: true, .. } => {
                self.events.publish(Event::EntryOpened {
                    agent: self.id().clone(),
                    signal,
                });
            }
            BarOutcome::Rebuilt => {
                self.events.publish(Event::RebuildTriggered { agent: self.id().clone() });
                self.set_status(AgentStatus::Training, "drift rebuild");
                self.set_status(AgentStatus::Testing, "validating rebuilt model");
                if !self.orchestrator.recover(self.mode).await {
                    self.enter_fatal();
                }
            }
            BarOutcome::RebuildDeferred => {
                self.events.publish(Event::RebuildTriggered { agent: self.id().clone() });
            }
            BarOutcome::Fatal => self.enter_fatal(),
            BarOutcome::Processed { .. } | BarOutcome::Skipped => {}
        }

        self.refresh_status();
        self.publish_snapshot();
        outcome
    }

    /// Poll and process one bar as a standalone agent
    pub async fn tick(&mut self, flags: RuntimeFlags) -> Result<Option<BarOutcome>> {
        let Some(window) = self.poll_window().await? else {
            return Ok(None);
        };
        let ctx = BarContext::new(self.mode, flags.trading_allowed, window.volatility);
        Ok(Some(self.on_bar(&window, &ctx).await))
    }

    /// Counted retrain for a pair; the caller holds the admission slot
    pub(crate) async fn retrain_for_pair(&mut self) -> RetrainOutcome {
        self.set_status(AgentStatus::Training, "joint retrain");
        let outcome = self.orchestrator.retrain_counted(self.mode).await;
        match outcome {
            RetrainOutcome::BoundExceeded => self.enter_fatal(),
            RetrainOutcome::Retrained | RetrainOutcome::Failed => {
                self.set_status(AgentStatus::WaitTest, "awaiting test");
            }
        }
        outcome
    }

    /// Test/fit loop after a pair retrain; a rejected model is marked for rebuild
    pub(crate) async fn validate_for_pair(&mut self) -> FitOutcome {
        self.set_status(AgentStatus::Testing, "validating joint retrain");
        let outcome = self.orchestrator.test_fit_loop(self.mode).await;
        if outcome == FitOutcome::Retrain {
            self.orchestrator.defer_rebuild();
            self.set_status(AgentStatus::WaitTest, "validation failed");
        }
        self.refresh_status();
        self.publish_snapshot();
        outcome
    }

    pub(crate) async fn adapt(&mut self) -> bool {
        self.orchestrator.adapt(self.mode).await
    }

    pub(crate) async fn close_positions(&self, reason: &str) {
        self.orchestrator.close_positions(reason).await;
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        let drift = self.orchestrator.drift();
        StatusSnapshot {
            id: self.id().to_string(),
            status: self.status().to_string(),
            error_metric: drift.last_error().unwrap_or(0.0),
            confidence: self.orchestrator.confidence(),
            warning_count: drift.warning_count(),
            is_active: !self.manual_stop,
            mode: self.mode,
        }
    }

    fn publish_snapshot(&self) {
        let snapshot = self.snapshot();
        telemetry::record_snapshot(&snapshot, self.status().code(), self.orchestrator.drift().is_model_valid());
        self.sink.publish(snapshot);
    }

    fn enter_fatal(&mut self) {
        error!(agent = %self.id(), "Agent halted, operator intervention required");
        self.manual_stop = true;
        self.set_status(AgentStatus::FatalError, "retrain budget exhausted");
        self.events.publish(Event::AgentFatal { agent: self.id().clone() });
    }

    /// Derive the reported status from the orchestrator and drift state.
    /// FATAL_ERROR is only left through an auto-cycle or a passed test.
    fn refresh_status(&mut self) {
        let current = self.status();
        if current == AgentStatus::FatalError {
            return;
        }

        let drift = self.orchestrator.drift();
        let target = if self.manual_stop && !current.survives_manual_stop() {
            AgentStatus::Paused
        } else if self.orchestrator.needs_testing() {
            AgentStatus::WaitTest
        } else if !drift.is_model_valid() {
            AgentStatus::Error
        } else if drift.warning_count() > 0 {
            AgentStatus::Warn
        } else {
            AgentStatus::Ok
        };

        if target != current && self.lifecycle.can_transition_to(target) {
            self.set_status(target, "bar classification");
        }
    }

    fn set_status(&mut self, target: AgentStatus, reason: &str) -> bool {
        let from = self.status();
        if !self.lifecycle.transition_to_with_reason(target, Some(reason.to_string())) {
            return false;
        }
        self.events.publish(Event::StatusChanged {
            agent: self.id().clone(),
            from,
            to: target,
        });
        true
    }
}
