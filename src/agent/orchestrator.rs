//! Lifecycle Orchestrator
//!
//! Per-agent decision core:
//! - Bounded auto-cycle (retrain, validate, adapt) with a self-preservation limit
//! - Test/fit loop separating borderline, moderate and catastrophic failures
//! - Per-bar loop: drift check, forecast, trailing exits, risk-gated entries
//! - Confidence score for reporting
//!
//! All state here is owned by one agent and mutated only through `&mut self`.

use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

use super::risk_gate::{hierarchy_confirms, order_for, RiskGate};
use crate::collaborators::{Collaborators, FineTuneRequest, PerformanceReport, TrainingPlan};
use crate::config::{AgentSettings, RiskConfig};
use crate::control::{AdmissionController, DriftController, DriftStatus};
use crate::telemetry;
use crate::utils::helpers::{clamp, elapsed_us, round_to};
use crate::utils::types::{AgentId, Forecast, MarketWindow, Quote, Signal, TradingMode};

/// Top-level retrain attempts before the market is declared unlearnable
pub const MAX_AUTO_CYCLES: u32 = 3;
/// Light adaptations before escalating to a full retrain
pub const MAX_FIT_ATTEMPTS: u32 = 3;
/// Volatility used for the validation gate when the provider has none
pub const DEFAULT_VOLATILITY: f64 = 0.001;
/// Bars handed to a fine-tune
const ADAPTATION_BARS: usize = 100;

/// How a drift failure turns into a retrain
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RebuildPolicy {
    /// Retrain right away under an admission slot
    Immediate,
    /// Mark for rebuild and leave the retrain to the pair coordinator
    Deferred,
}

/// Inputs of one bar decision, passed explicitly
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BarContext {
    pub mode: TradingMode,
    pub global_trading_allowed: bool,
    pub volatility: f64,
    /// Slow-timeframe forecast close that entries must agree with
    pub trend_reference: Option<f64>,
}

impl BarContext {
    pub fn new(mode: TradingMode, global_trading_allowed: bool, volatility: f64) -> Self {
        Self {
            mode,
            global_trading_allowed,
            volatility,
            trend_reference: None,
        }
    }

    pub fn with_trend_reference(mut self, reference: Option<f64>) -> Self {
        self.trend_reference = reference;
        self
    }
}

/// Result of processing one bar
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BarOutcome {
    /// Awaiting validation or no usable data
    Skipped,
    Processed { signal: Signal, opened: bool, adapted: bool },
    /// Drift failure, model retrained and awaiting validation
    Rebuilt,
    /// Drift failure, retrain left to the pair coordinator
    RebuildDeferred,
    /// Retrain budget exhausted
    Fatal,
}

/// Verdict of the test/fit loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FitOutcome {
    Accepted,
    Retrain,
}

/// Result of a retrain counted against the cycle bound
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetrainOutcome {
    Retrained,
    Failed,
    BoundExceeded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CycleEntry {
    Retrain,
    Validate,
}

/// Confidence in the latest forecast, 0..=100.
///
/// `baseline` is the mean historical error before this observation.
pub fn confidence_score(error: f64, baseline: Option<f64>, multiplier: f64) -> f64 {
    let Some(mean_error) = baseline else {
        return 100.0;
    };
    if error <= 0.0 {
        return 100.0;
    }
    let limit = mean_error * multiplier;
    if limit <= 0.0 {
        return 0.0;
    }
    clamp(round_to((1.0 - error / limit) * 100.0, 2), 0.0, 100.0)
}

pub struct Orchestrator {
    id: AgentId,
    settings: AgentSettings,
    collaborators: Collaborators,
    admission: Arc<AdmissionController>,
    drift: DriftController,
    risk: RiskGate,
    rebuild_policy: RebuildPolicy,
    needs_testing: bool,
    needs_rebuild: bool,
    fit_attempts: u32,
    auto_cycle_counter: u32,
    last_forecast: Option<Forecast>,
    confidence: f64,
}

impl Orchestrator {
    pub fn new(
        id: AgentId,
        settings: AgentSettings,
        collaborators: Collaborators,
        admission: Arc<AdmissionController>,
        risk_config: &RiskConfig,
    ) -> Self {
        let risk = RiskGate::new(id.clone(), risk_config);
        Self {
            id,
            settings,
            collaborators,
            admission,
            drift: DriftController::new(),
            risk,
            rebuild_policy: RebuildPolicy::Immediate,
            needs_testing: true,
            needs_rebuild: false,
            fit_attempts: 0,
            auto_cycle_counter: 0,
            last_forecast: None,
            confidence: 0.0,
        }
    }

    pub fn with_rebuild_policy(mut self, policy: RebuildPolicy) -> Self {
        self.rebuild_policy = policy;
        self
    }

    pub fn id(&self) -> &AgentId {
        &self.id
    }

    pub fn settings(&self) -> &AgentSettings {
        &self.settings
    }

    pub fn drift(&self) -> &DriftController {
        &self.drift
    }

    pub fn needs_testing(&self) -> bool {
        self.needs_testing
    }

    pub fn needs_rebuild(&self) -> bool {
        self.needs_rebuild
    }

    pub fn fit_attempts(&self) -> u32 {
        self.fit_attempts
    }

    pub fn auto_cycle_counter(&self) -> u32 {
        self.auto_cycle_counter
    }

    pub fn confidence(&self) -> f64 {
        self.confidence
    }

    pub fn last_forecast(&self) -> Option<Forecast> {
        self.last_forecast
    }

    /// Operator intervention: give the agent a fresh retrain budget
    pub fn clear_cycle_bound(&mut self) {
        if self.auto_cycle_counter > 0 {
            info!(agent = %self.id, "Auto-cycle budget cleared by operator");
        }
        self.auto_cycle_counter = 0;
    }

    /// Bounded self-preservation loop: retrain, validate, adapt.
    /// Returns `false` once `MAX_AUTO_CYCLES` retrains have failed validation.
    pub async fn run_auto_cycle(&mut self, mode: TradingMode) -> bool {
        self.cycle(mode, CycleEntry::Retrain).await
    }

    /// Bring the model back after a drift rebuild. Validates first when the
    /// rebuild already retrained, otherwise goes through the full cycle.
    pub async fn recover(&mut self, mode: TradingMode) -> bool {
        let entry = if self.needs_rebuild {
            CycleEntry::Retrain
        } else {
            CycleEntry::Validate
        };
        self.cycle(mode, entry).await
    }

    async fn cycle(&mut self, mode: TradingMode, mut entry: CycleEntry) -> bool {
        loop {
            if entry == CycleEntry::Retrain {
                if !self.begin_retrain_attempt() {
                    return false;
                }
                self.close_positions("auto-cycle").await;
                if !self.request_full_retrain(mode).await {
                    continue;
                }
            }

            match self.test_fit_loop(mode).await {
                FitOutcome::Accepted => return true,
                FitOutcome::Retrain => entry = CycleEntry::Retrain,
            }
        }
    }

    /// Test, then adapt up to `MAX_FIT_ATTEMPTS` times, until the model is
    /// accepted or needs a full retrain.
    pub async fn test_fit_loop(&mut self, mode: TradingMode) -> FitOutcome {
        loop {
            let report = self.evaluate().await;
            let gate = self.validation_gate(mode).await;

            if report.passed || (mode.is_simulated() && report.error_metric < gate) {
                info!(
                    agent = %self.id,
                    error_metric = report.error_metric,
                    gate,
                    "Model validated, ready to trade"
                );
                self.drift.reset();
                self.needs_testing = false;
                self.needs_rebuild = false;
                self.fit_attempts = 0;
                self.auto_cycle_counter = 0;
                return FitOutcome::Accepted;
            }

            if report.error_metric > 2.0 * gate {
                warn!(
                    agent = %self.id,
                    error_metric = report.error_metric,
                    gate,
                    "Catastrophic validation error, full retrain"
                );
                self.fit_attempts = 0;
                return FitOutcome::Retrain;
            }

            if self.fit_attempts < MAX_FIT_ATTEMPTS {
                self.fit_attempts += 1;
                info!(
                    agent = %self.id,
                    error_metric = report.error_metric,
                    "Adaptation attempt {}/{}",
                    self.fit_attempts,
                    MAX_FIT_ATTEMPTS
                );
                self.fine_tune(mode).await;
                continue;
            }

            error!(agent = %self.id, "Adaptations exhausted, full retrain");
            self.fit_attempts = 0;
            return FitOutcome::Retrain;
        }
    }

    /// Per-bar decision loop. A no-op while the model awaits validation.
    pub async fn process_bar(&mut self, window: &MarketWindow, ctx: &BarContext) -> BarOutcome {
        if self.needs_testing {
            return BarOutcome::Skipped;
        }
        let Some(actual) = window.last_bar().copied() else {
            return BarOutcome::Skipped;
        };
        if !(ctx.volatility.is_finite() && ctx.volatility > 0.0) {
            warn!(agent = %self.id, volatility = ctx.volatility, "Unusable volatility, bar skipped");
            return BarOutcome::Skipped;
        }
        let started = Instant::now();

        let mut adapted = false;
        if let Some(previous) = self.last_forecast {
            let error = previous.squared_error(&actual);
            self.confidence = confidence_score(error, self.drift.mean_error(), self.settings.error_multiplier);

            let threshold = ctx.volatility * self.effective_multiplier(ctx.mode);
            let status = self.drift.check(error, threshold);
            telemetry::record_drift(&self.id, status);

            match status {
                DriftStatus::Error => return self.handle_rebuild(ctx.mode, "critical drift").await,
                DriftStatus::Warning if self.fit_attempts < MAX_FIT_ATTEMPTS => {
                    self.fit_attempts += 1;
                    info!(
                        agent = %self.id,
                        "Sustained degradation, adaptation {}/{}",
                        self.fit_attempts,
                        MAX_FIT_ATTEMPTS
                    );
                    adapted = self.fine_tune(ctx.mode).await;
                }
                DriftStatus::Warning => {
                    return self.handle_rebuild(ctx.mode, "adaptation budget exhausted").await
                }
                DriftStatus::Ok => {}
            }
        }

        let forecast = match self.collaborators.model.predict(&self.id, &window.bars).await {
            Ok(forecast) => forecast,
            Err(e) => {
                error!(agent = %self.id, error = %e, "Prediction failed");
                return self.handle_rebuild(ctx.mode, "prediction failed").await;
            }
        };

        let quote = match self.collaborators.quotes.quote(&self.id.instrument).await {
            Ok(Some(quote)) => quote,
            Ok(None) => {
                debug!(agent = %self.id, "No quote, bar skipped");
                return BarOutcome::Skipped;
            }
            Err(e) => {
                warn!(agent = %self.id, error = %e, "Quote lookup failed, bar skipped");
                return BarOutcome::Skipped;
            }
        };

        let previous_close = self.last_forecast.map(|f| f.close);
        if let Err(e) = self
            .risk
            .check_trailing_forecast(self.collaborators.gateway.as_ref(), forecast.close, previous_close)
            .await
        {
            warn!(agent = %self.id, error = %e, "Trailing forecast check failed");
        }

        let mut signal = Signal::None;
        let mut opened = false;
        if ctx.mode == TradingMode::Trade && ctx.global_trading_allowed && self.drift.is_model_valid() {
            signal = self.evaluate_entry(&quote, &forecast, actual.close, ctx);
            if let Some(order) = order_for(signal, &forecast) {
                telemetry::record_entry(&self.id, signal);
                match self.collaborators.gateway.open_position(&self.id, order).await {
                    Ok(Some(position_id)) => {
                        info!(agent = %self.id, position = %position_id, %signal, "Entry sent");
                        opened = true;
                    }
                    Ok(None) => debug!(agent = %self.id, %signal, "Entry vetoed by gateway"),
                    Err(e) => warn!(agent = %self.id, error = %e, "Failed to open position"),
                }
            }
        }

        self.last_forecast = Some(forecast);
        telemetry::record_bar_latency(&self.id, elapsed_us(started) as f64);

        BarOutcome::Processed { signal, opened, adapted }
    }

    fn evaluate_entry(&self, quote: &Quote, forecast: &Forecast, last_close: f64, ctx: &BarContext) -> Signal {
        let signal = self.risk.evaluate_entry(quote, forecast, ctx.volatility);
        if signal == Signal::None {
            return signal;
        }
        match ctx.trend_reference {
            Some(slow_close) if !hierarchy_confirms(last_close, forecast.close, slow_close) => {
                debug!(agent = %self.id, %signal, slow_close, "Entry not confirmed by slow timeframe");
                Signal::None
            }
            _ => signal,
        }
    }

    async fn handle_rebuild(&mut self, mode: TradingMode, reason: &str) -> BarOutcome {
        warn!(agent = %self.id, reason, "Rebuild triggered");
        self.close_positions(reason).await;
        self.needs_testing = true;
        self.last_forecast = None;

        match self.rebuild_policy {
            RebuildPolicy::Deferred => {
                self.needs_rebuild = true;
                BarOutcome::RebuildDeferred
            }
            RebuildPolicy::Immediate => {
                if !self.begin_retrain_attempt() {
                    return BarOutcome::Fatal;
                }
                self.needs_rebuild = !self.request_full_retrain(mode).await;
                BarOutcome::Rebuilt
            }
        }
    }

    /// Close positions and retrain from scratch; the model awaits validation afterwards
    pub async fn rebuild(&mut self, mode: TradingMode) -> bool {
        self.close_positions("rebuild").await;
        self.needs_testing = true;
        self.last_forecast = None;
        let retrained = self.request_full_retrain(mode).await;
        self.needs_rebuild = !retrained;
        retrained
    }

    /// Retrain under an admission slot the caller already holds, counting
    /// toward the cycle bound
    pub async fn retrain_counted(&mut self, mode: TradingMode) -> RetrainOutcome {
        if !self.begin_retrain_attempt() {
            return RetrainOutcome::BoundExceeded;
        }
        self.close_positions("joint retrain").await;
        self.needs_testing = true;
        self.last_forecast = None;
        if self.retrain_model(mode).await {
            self.needs_rebuild = false;
            RetrainOutcome::Retrained
        } else {
            self.needs_rebuild = true;
            RetrainOutcome::Failed
        }
    }

    /// Light adaptation on the most recent bars
    pub async fn adapt(&mut self, mode: TradingMode) -> bool {
        self.fine_tune(mode).await
    }

    /// Operator-triggered adaptation
    pub async fn manual_fit(&mut self, mode: TradingMode) -> bool {
        self.close_positions("manual fit").await;
        self.fine_tune(mode).await
    }

    /// Operator-triggered test; a pass releases the model for trading
    pub async fn run_test_diagnostics(&mut self) -> bool {
        let report = self.evaluate().await;
        if report.passed {
            self.needs_testing = false;
        }
        info!(
            agent = %self.id,
            passed = report.passed,
            error_metric = report.error_metric,
            "Diagnostic test finished"
        );
        report.passed
    }

    /// Mark the model for a rebuild without retraining now
    pub fn defer_rebuild(&mut self) {
        self.needs_testing = true;
        self.needs_rebuild = true;
    }

    fn begin_retrain_attempt(&mut self) -> bool {
        if self.auto_cycle_counter >= MAX_AUTO_CYCLES {
            error!(
                agent = %self.id,
                attempts = self.auto_cycle_counter,
                "Market unpredictable, model keeps failing validation; retraining stopped"
            );
            telemetry::record_fatal(&self.id);
            self.needs_testing = true;
            return false;
        }
        self.auto_cycle_counter += 1;
        info!(
            agent = %self.id,
            "Auto-cycle attempt {}/{}",
            self.auto_cycle_counter,
            MAX_AUTO_CYCLES
        );
        true
    }

    async fn request_full_retrain(&mut self, mode: TradingMode) -> bool {
        let admission = Arc::clone(&self.admission);
        let _permit = admission.acquire().await;
        self.needs_testing = true;
        self.retrain_model(mode).await
    }

    async fn retrain_model(&mut self, mode: TradingMode) -> bool {
        self.refresh_settings().await;
        let plan = TrainingPlan::new(&self.settings, mode);
        let started = Instant::now();

        let retrained = match self.collaborators.model.full_retrain(&self.id, &plan).await {
            Ok(true) => true,
            Ok(false) => {
                warn!(agent = %self.id, "Full retrain reported failure");
                false
            }
            Err(e) => {
                error!(agent = %self.id, error = %e, "Full retrain failed");
                false
            }
        };
        telemetry::record_retrain(&self.id, retrained);
        info!(
            agent = %self.id,
            retrained,
            epochs = plan.epochs,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Full retrain finished"
        );
        retrained
    }

    async fn fine_tune(&self, mode: TradingMode) -> bool {
        let recent = match self.collaborators.market.recent_bars(&self.id, ADAPTATION_BARS).await {
            Ok(bars) => bars,
            Err(e) => {
                warn!(agent = %self.id, error = %e, "No data for adaptation");
                return false;
            }
        };
        let request = FineTuneRequest::new(&self.settings, mode);
        telemetry::record_fine_tune(&self.id);

        match self.collaborators.model.fine_tune(&self.id, &recent, &request).await {
            Ok(()) => true,
            Err(e) => {
                warn!(agent = %self.id, error = %e, "Fine-tune failed");
                false
            }
        }
    }

    async fn evaluate(&self) -> PerformanceReport {
        match self.collaborators.model.evaluate_performance(&self.id).await {
            Ok(report) => report,
            Err(e) => {
                warn!(agent = %self.id, error = %e, "Performance test failed to run");
                PerformanceReport::failed()
            }
        }
    }

    async fn validation_gate(&self, mode: TradingMode) -> f64 {
        let volatility = match self.collaborators.market.latest_volatility(&self.id).await {
            Ok(Some(v)) if v.is_finite() && v > 0.0 => v,
            Ok(_) => DEFAULT_VOLATILITY,
            Err(e) => {
                warn!(agent = %self.id, error = %e, "Volatility unavailable, using default");
                DEFAULT_VOLATILITY
            }
        };
        volatility * self.effective_multiplier(mode)
    }

    fn effective_multiplier(&self, mode: TradingMode) -> f64 {
        self.settings.error_multiplier * mode.error_multiplier_scale()
    }

    async fn refresh_settings(&mut self) {
        match self.collaborators.settings.load(&self.id).await {
            Ok(settings) => self.settings = settings,
            Err(e) => warn!(agent = %self.id, error = %e, "Settings unavailable, keeping snapshot"),
        }
    }

    /// Close every open position of this agent
    pub async fn close_positions(&self, reason: &str) {
        match self.collaborators.gateway.close_all_for_agent(&self.id).await {
            Ok(0) => {}
            Ok(closed) => info!(agent = %self.id, closed, reason, "Positions closed"),
            Err(e) => warn!(agent = %self.id, error = %e, reason, "Failed to close positions"),
        }
    }
}
