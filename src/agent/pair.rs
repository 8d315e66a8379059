//! Pair Coordinator
//!
//! Hierarchical pair of agents on one instrument. The slow agent runs
//! monitor-only and supplies the trend reference; the fast agent trades
//! only while both agents are healthy (GREEN). Drift rebuilds of either
//! agent are retrained jointly under a single admission slot.

use anyhow::Result;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::{AgentStatus, BarContext, BarOutcome, FitOutcome, RebuildPolicy, RetrainOutcome, TradingAgent};
use crate::config::RuntimeFlags;
use crate::control::AdmissionController;
use crate::events::{Event, EventBus};
use crate::telemetry;

/// Confidence each agent needs for a GREEN pair
pub const MIN_PAIR_CONFIDENCE: f64 = 80.0;

/// Result of one pair tick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PairTick {
    pub green: bool,
    pub fast: BarOutcome,
    pub slow: Option<BarOutcome>,
}

pub struct PairCoordinator {
    instrument: String,
    fast: TradingAgent,
    slow: TradingAgent,
    admission: Arc<AdmissionController>,
    events: EventBus,
    /// Last published permission, `None` before the first check
    green: Option<bool>,
}

impl PairCoordinator {
    pub fn new(
        fast: TradingAgent,
        slow: TradingAgent,
        admission: Arc<AdmissionController>,
        events: EventBus,
    ) -> Self {
        Self {
            instrument: fast.id().instrument.clone(),
            fast: fast.with_rebuild_policy(RebuildPolicy::Deferred),
            slow: slow.with_rebuild_policy(RebuildPolicy::Deferred),
            admission,
            events,
            green: None,
        }
    }

    pub fn instrument(&self) -> &str {
        &self.instrument
    }

    pub fn fast(&self) -> &TradingAgent {
        &self.fast
    }

    pub fn slow(&self) -> &TradingAgent {
        &self.slow
    }

    pub fn fast_mut(&mut self) -> &mut TradingAgent {
        &mut self.fast
    }

    pub fn slow_mut(&mut self) -> &mut TradingAgent {
        &mut self.slow
    }

    pub fn agents_mut(&mut self) -> [&mut TradingAgent; 2] {
        [&mut self.fast, &mut self.slow]
    }

    pub fn is_green(&self) -> bool {
        self.green.unwrap_or(false)
    }

    /// Both agents valid, free of warnings and confident
    pub fn permission(&self) -> bool {
        [&self.fast, &self.slow].iter().all(|agent| {
            let orchestrator = agent.orchestrator();
            orchestrator.drift().is_model_valid()
                && orchestrator.drift().warning_count() == 0
                && orchestrator.confidence() > MIN_PAIR_CONFIDENCE
        })
    }

    /// Recompute permission; a RED pair has every position closed
    pub async fn check_permission(&mut self) -> bool {
        let green = self.permission();
        telemetry::record_pair_permission(&self.instrument, green);

        if self.green != Some(green) {
            info!(
                instrument = %self.instrument,
                "Pair permission {}",
                if green { "GREEN" } else { "RED" }
            );
            self.events.publish(Event::PairPermission {
                instrument: self.instrument.clone(),
                green,
            });
            self.green = Some(green);
        }

        if !green {
            self.fast.close_positions("pair RED").await;
            self.slow.close_positions("pair RED").await;
        }
        green
    }

    /// Retrain whichever agent is marked for rebuild under one admission
    /// slot, adapting a valid partner that carries warnings. Returns `false`
    /// when nothing ran.
    pub async fn joint_retrain(&mut self) -> bool {
        // halted agents wait for the operator
        let needs = [&self.fast, &self.slow]
            .map(|agent| agent.orchestrator().needs_rebuild() && agent.status() != AgentStatus::FatalError);
        if !needs.iter().any(|n| *n) {
            return false;
        }

        let permit = match self.admission.try_acquire() {
            Ok(permit) => permit,
            Err(e) => {
                debug!(instrument = %self.instrument, error = %e, "Joint retrain postponed");
                return false;
            }
        };
        info!(instrument = %self.instrument, fast = needs[0], slow = needs[1], "Joint retrain");

        let mut retrained = [false; 2];
        for (i, agent) in [&mut self.fast, &mut self.slow].into_iter().enumerate() {
            if needs[i] {
                retrained[i] = agent.retrain_for_pair().await == RetrainOutcome::Retrained;
            } else {
                let drift = agent.orchestrator().drift();
                if drift.is_model_valid() && drift.warning_count() > 0 {
                    info!(agent = %agent.id(), "Adapting partner with warnings");
                    agent.adapt().await;
                }
            }
        }
        drop(permit);

        for (i, agent) in [&mut self.fast, &mut self.slow].into_iter().enumerate() {
            if retrained[i] && agent.validate_for_pair().await == FitOutcome::Retrain {
                warn!(agent = %agent.id(), "Joint retrain rejected, rebuilding again next bar");
            }
        }
        true
    }

    /// Process one fast bar: slow bar (if any), pending retrains, permission, fast bar
    pub async fn tick(&mut self, flags: RuntimeFlags) -> Result<Option<PairTick>> {
        let Some(fast_window) = self.fast.poll_window().await? else {
            return Ok(None);
        };

        let slow = match self.slow.poll_window().await? {
            Some(window) => {
                let ctx = BarContext::new(self.slow.mode(), false, window.volatility);
                Some(self.slow.on_bar(&window, &ctx).await)
            }
            None => None,
        };

        self.joint_retrain().await;
        let green = self.check_permission().await;

        let reference = self.slow.orchestrator().last_forecast().map(|f| f.close);
        let ctx = BarContext::new(self.fast.mode(), flags.trading_allowed && green, fast_window.volatility)
            .with_trend_reference(reference);
        let fast = self.fast.on_bar(&fast_window, &ctx).await;

        Ok(Some(PairTick { green, fast, slow }))
    }
}
