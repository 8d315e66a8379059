//! Drift Controller
//!
//! Classifies each new prediction error against a rolling baseline:
//! - OK: error within the warn band
//! - WARNING: three degraded bars, the model should be adapted
//! - ERROR: error above the critical band, model quarantined
//!
//! A quarantined model is barred from trading until it produces
//! `QUARANTINE_BARS` consecutive non-degraded forecasts.

use std::collections::VecDeque;
use std::fmt;
use tracing::{debug, error, info, warn};

use crate::utils::helpers::mean;

/// Rolling error window length
pub const HISTORY_LEN: usize = 50;
/// Degraded bars needed before a WARNING is raised
pub const WARNINGS_BEFORE_ADAPT: u32 = 3;
/// Clean bars needed to lift quarantine
pub const QUARANTINE_BARS: u32 = 4;
/// Warn band as a fraction of the error band
pub const WARN_RATIO: f64 = 0.8;

/// Drift classification of one observation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriftStatus {
    Ok,
    Warning,
    Error,
}

impl fmt::Display for DriftStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DriftStatus::Ok => write!(f, "OK"),
            DriftStatus::Warning => write!(f, "WARNING"),
            DriftStatus::Error => write!(f, "ERROR"),
        }
    }
}

/// Per-agent drift state
#[derive(Debug, Clone)]
pub struct DriftController {
    error_history: VecDeque<f64>,
    warning_count: u32,
    is_model_valid: bool,
    quarantine_bars_remaining: u32,
    error_threshold: f64,
    warn_threshold: f64,
}

impl DriftController {
    pub fn new() -> Self {
        Self {
            error_history: VecDeque::with_capacity(HISTORY_LEN + 1),
            warning_count: 0,
            is_model_valid: true,
            quarantine_bars_remaining: 0,
            error_threshold: 0.0,
            warn_threshold: 0.0,
        }
    }

    /// Classify `current_error` against the rolling mean.
    ///
    /// `dynamic_threshold` is volatility × the agent's error multiplier; the
    /// warn band sits at 80 % of it.
    pub fn check(&mut self, current_error: f64, dynamic_threshold: f64) -> DriftStatus {
        self.error_threshold = dynamic_threshold;
        self.warn_threshold = dynamic_threshold * WARN_RATIO;

        let Some(mean_error) = mean(self.error_history.iter().copied()) else {
            // No baseline yet
            self.record(current_error);
            return DriftStatus::Ok;
        };

        if current_error > mean_error * self.error_threshold {
            error!(
                error = current_error,
                limit = mean_error * self.error_threshold,
                "Critical forecast drift, model quarantined"
            );
            self.is_model_valid = false;
            self.quarantine_bars_remaining = QUARANTINE_BARS;
            self.warning_count = 0;
            // Spikes stay out of the baseline
            return DriftStatus::Error;
        }

        let mut status = DriftStatus::Ok;
        if current_error > mean_error * self.warn_threshold {
            self.warning_count += 1;
            warn!(
                warnings = self.warning_count,
                error = current_error,
                "Degraded forecast {}/{}",
                self.warning_count,
                WARNINGS_BEFORE_ADAPT
            );
            if !self.is_model_valid {
                // Quarantine needs consecutive clean bars
                self.quarantine_bars_remaining = QUARANTINE_BARS;
            }
            if self.warning_count >= WARNINGS_BEFORE_ADAPT {
                self.warning_count = 0;
                status = DriftStatus::Warning;
            }
        } else {
            self.warning_count = self.warning_count.saturating_sub(1);

            if !self.is_model_valid {
                self.quarantine_bars_remaining = self.quarantine_bars_remaining.saturating_sub(1);
                if self.quarantine_bars_remaining == 0 {
                    self.is_model_valid = true;
                    info!("Quarantine lifted, trading re-enabled");
                } else {
                    debug!(remaining = self.quarantine_bars_remaining, "Model in quarantine");
                }
            }
        }

        self.record(current_error);
        status
    }

    fn record(&mut self, error: f64) {
        self.error_history.push_back(error);
        while self.error_history.len() > HISTORY_LEN {
            self.error_history.pop_front();
        }
    }

    /// Clear all state after a model passes validation
    pub fn reset(&mut self) {
        *self = Self::new();
    }

    pub fn mean_error(&self) -> Option<f64> {
        mean(self.error_history.iter().copied())
    }

    pub fn last_error(&self) -> Option<f64> {
        self.error_history.back().copied()
    }

    pub fn history_len(&self) -> usize {
        self.error_history.len()
    }

    pub fn warning_count(&self) -> u32 {
        self.warning_count
    }

    pub fn is_model_valid(&self) -> bool {
        self.is_model_valid
    }

    pub fn quarantine_bars_remaining(&self) -> u32 {
        self.quarantine_bars_remaining
    }

    pub fn error_threshold(&self) -> f64 {
        self.error_threshold
    }

    pub fn warn_threshold(&self) -> f64 {
        self.warn_threshold
    }
}

impl Default for DriftController {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const BASE: f64 = 0.0001;
    // warn band 1.2 × mean, error band 1.5 × mean
    const THRESHOLD: f64 = 1.5;

    fn with_baseline() -> DriftController {
        let mut ctrl = DriftController::new();
        for _ in 0..10 {
            assert_eq!(ctrl.check(BASE, THRESHOLD), DriftStatus::Ok);
        }
        ctrl
    }

    #[test]
    fn test_first_observation_is_ok() {
        let mut ctrl = DriftController::new();
        assert_eq!(ctrl.check(1000.0, THRESHOLD), DriftStatus::Ok);
        assert_eq!(ctrl.history_len(), 1);
        assert!(ctrl.is_model_valid());
    }

    #[test]
    fn test_thresholds_follow_dynamic_input() {
        let mut ctrl = DriftController::new();
        ctrl.check(BASE, 2.0);
        assert_eq!(ctrl.error_threshold(), 2.0);
        assert!((ctrl.warn_threshold() - 1.6).abs() < 1e-12);
    }

    #[test]
    fn test_third_degraded_bar_raises_warning() {
        let mut ctrl = with_baseline();
        let degraded = BASE * 1.3;
        assert_eq!(ctrl.check(degraded, THRESHOLD), DriftStatus::Ok);
        assert_eq!(ctrl.check(degraded, THRESHOLD), DriftStatus::Ok);
        assert_eq!(ctrl.check(degraded, THRESHOLD), DriftStatus::Warning);
        assert_eq!(ctrl.warning_count(), 0);
        assert!(ctrl.is_model_valid());
    }

    #[test]
    fn test_clean_bar_decays_warning_count() {
        let mut ctrl = with_baseline();
        ctrl.check(BASE * 1.3, THRESHOLD);
        ctrl.check(BASE * 1.3, THRESHOLD);
        assert_eq!(ctrl.warning_count(), 2);
        ctrl.check(BASE, THRESHOLD);
        assert_eq!(ctrl.warning_count(), 1);
    }

    #[test]
    fn test_spike_quarantines_model() {
        let mut ctrl = with_baseline();
        assert_eq!(ctrl.check(BASE * 3.0, THRESHOLD), DriftStatus::Error);
        assert!(!ctrl.is_model_valid());
        assert_eq!(ctrl.quarantine_bars_remaining(), QUARANTINE_BARS);
        // spike not recorded
        assert_eq!(ctrl.history_len(), 10);
    }

    #[test]
    fn test_quarantine_lifts_after_four_clean_bars() {
        let mut ctrl = with_baseline();
        ctrl.check(BASE * 3.0, THRESHOLD);
        for i in 1..=5 {
            assert_eq!(ctrl.check(BASE, THRESHOLD), DriftStatus::Ok);
            assert_eq!(ctrl.is_model_valid(), i >= 4, "bar {}", i);
        }
    }

    #[test]
    fn test_degraded_bar_restarts_quarantine_countdown() {
        let mut ctrl = with_baseline();
        ctrl.check(BASE * 3.0, THRESHOLD);
        ctrl.check(BASE, THRESHOLD);
        ctrl.check(BASE, THRESHOLD);
        assert_eq!(ctrl.quarantine_bars_remaining(), 2);
        ctrl.check(BASE * 1.3, THRESHOLD);
        assert_eq!(ctrl.quarantine_bars_remaining(), QUARANTINE_BARS);
        for _ in 0..3 {
            ctrl.check(BASE, THRESHOLD);
            assert!(!ctrl.is_model_valid());
        }
        ctrl.check(BASE, THRESHOLD);
        assert!(ctrl.is_model_valid());
    }

    #[test]
    fn test_reset_clears_everything() {
        let mut ctrl = with_baseline();
        ctrl.check(BASE * 3.0, THRESHOLD);
        ctrl.reset();
        assert!(ctrl.is_model_valid());
        assert_eq!(ctrl.history_len(), 0);
        assert_eq!(ctrl.warning_count(), 0);
    }

    proptest! {
        #[test]
        fn prop_history_is_bounded(errors in prop::collection::vec(0.0f64..1.0, 0..200), threshold in 0.1f64..5.0) {
            let mut ctrl = DriftController::new();
            for e in errors {
                ctrl.check(e, threshold);
                prop_assert!(ctrl.history_len() <= HISTORY_LEN);
                prop_assert!(ctrl.warning_count() < WARNINGS_BEFORE_ADAPT);
                prop_assert!(ctrl.quarantine_bars_remaining() <= QUARANTINE_BARS);
            }
        }

        #[test]
        fn prop_invalid_only_after_error(errors in prop::collection::vec(0.0f64..1.0, 1..100)) {
            let mut ctrl = DriftController::new();
            for e in errors {
                let was_valid = ctrl.is_model_valid();
                let status = ctrl.check(e, 1.5);
                if was_valid && !ctrl.is_model_valid() {
                    prop_assert_eq!(status, DriftStatus::Error);
                }
            }
        }
    }
}
