//! Agent Lifecycle State Machine
//!
//! Reported lifecycle of a supervised agent:
//! - Init: constructed, nothing loaded
//! - Training: full retrain in progress
//! - Testing: performance test in progress
//! - WaitTest: trained but not yet validated, entries suppressed
//! - Ok / Warn / Error: validated model, classified by the last bar
//! - Paused: manually stopped by the operator
//! - FatalError: retrain budget exhausted, needs operator intervention

use serde::{Deserialize, Serialize};
use std::time::Instant;
use tracing::{info, warn};

/// Lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AgentStatus {
    Init,
    Training,
    Testing,
    WaitTest,
    Ok,
    Warn,
    Error,
    Paused,
    FatalError,
}

impl AgentStatus {
    /// Numeric code exported as a metrics gauge
    pub fn code(&self) -> u8 {
        match self {
            AgentStatus::Init => 0,
            AgentStatus::Training => 1,
            AgentStatus::Testing => 2,
            AgentStatus::WaitTest => 3,
            AgentStatus::Ok => 4,
            AgentStatus::Warn => 5,
            AgentStatus::Error => 6,
            AgentStatus::Paused => 7,
            AgentStatus::FatalError => 8,
        }
    }

    /// Statuses a manual stop does not overwrite with PAUSED
    pub fn survives_manual_stop(&self) -> bool {
        matches!(
            self,
            AgentStatus::Training | AgentStatus::Testing | AgentStatus::WaitTest | AgentStatus::FatalError
        )
    }
}

impl std::fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AgentStatus::Init => write!(f, "INIT"),
            AgentStatus::Training => write!(f, "TRAINING"),
            AgentStatus::Testing => write!(f, "TESTING"),
            AgentStatus::WaitTest => write!(f, "WAIT_TEST"),
            AgentStatus::Ok => write!(f, "OK"),
            AgentStatus::Warn => write!(f, "WARN"),
            AgentStatus::Error => write!(f, "ERROR"),
            AgentStatus::Paused => write!(f, "PAUSED"),
            AgentStatus::FatalError => write!(f, "FATAL_ERROR"),
        }
    }
}

/// Status transition record
#[derive(Debug, Clone)]
pub struct StatusTransition {
    pub from: AgentStatus,
    pub to: AgentStatus,
    pub timestamp: i64,
    pub reason: Option<String>,
}

/// Lifecycle state machine of one agent
pub struct LifecycleStateMachine {
    agent: String,
    current: AgentStatus,
    previous: Option<AgentStatus>,
    state_entered_at: Instant,
    history: Vec<StatusTransition>,
    max_history: usize,
}

impl LifecycleStateMachine {
    pub fn new(agent: impl Into<String>) -> Self {
        Self {
            agent: agent.into(),
            current: AgentStatus::Init,
            previous: None,
            state_entered_at: Instant::now(),
            history: Vec::new(),
            max_history: 100,
        }
    }

    pub fn current_status(&self) -> AgentStatus {
        self.current
    }

    pub fn previous_status(&self) -> Option<AgentStatus> {
        self.previous
    }

    pub fn time_in_status(&self) -> std::time::Duration {
        self.state_entered_at.elapsed()
    }

    /// Check if transition is valid
    pub fn can_transition_to(&self, target: AgentStatus) -> bool {
        use AgentStatus::*;

        match (self.current, target) {
            (a, b) if a == b => false,

            // Nothing re-enters Init
            (_, Init) => false,

            // Fatal is reachable from every live status
            (_, FatalError) => true,

            // Operator intervention only
            (FatalError, Training) => true,
            (FatalError, Testing) => true,
            (FatalError, _) => false,

            (Init, Training | Testing | WaitTest | Ok | Paused) => true,

            (Training, WaitTest | Testing | Ok | Paused) => true,

            (Testing, Ok | WaitTest | Training) => true,

            (WaitTest, Testing | Training | Ok | Warn | Error) => true,

            (Ok | Warn | Error, Ok | Warn | Error) => true,
            (Ok | Warn | Error, Training | Testing | WaitTest | Paused) => true,

            (Paused, Ok | Warn | Error | WaitTest | Training | Testing) => true,

            _ => false,
        }
    }

    /// Transition to a new status
    pub fn transition_to(&mut self, target: AgentStatus) -> bool {
        self.transition_to_with_reason(target, None)
    }

    /// Transition to a new status with reason
    pub fn transition_to_with_reason(&mut self, target: AgentStatus, reason: Option<String>) -> bool {
        if !self.can_transition_to(target) {
            if self.current != target {
                warn!(
                    agent = %self.agent,
                    "Invalid status transition: {} -> {}",
                    self.current, target
                );
            }
            return false;
        }

        info!(
            agent = %self.agent,
            "Status: {} -> {}{}",
            self.current,
            target,
            reason.as_ref().map(|r| format!(" ({})", r)).unwrap_or_default()
        );

        self.history.push(StatusTransition {
            from: self.current,
            to: target,
            timestamp: chrono::Utc::now().timestamp_millis(),
            reason,
        });
        if self.history.len() > self.max_history {
            self.history.remove(0);
        }

        self.previous = Some(self.current);
        self.current = target;
        self.state_entered_at = Instant::now();

        true
    }

    pub fn history(&self) -> &[StatusTransition] {
        &self.history
    }

    /// Only a validated, healthy model may open positions
    pub fn permits_entries(&self) -> bool {
        self.current == AgentStatus::Ok
    }

    pub fn is_fatal(&self) -> bool {
        self.current == AgentStatus::FatalError
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_status() {
        let sm = LifecycleStateMachine::new("EURUSD_H1");
        assert_eq!(sm.current_status(), AgentStatus::Init);
        assert!(!sm.permits_entries());
    }

    #[test]
    fn test_training_to_trading_lifecycle() {
        let mut sm = LifecycleStateMachine::new("EURUSD_H1");
        assert!(sm.transition_to(AgentStatus::Training));
        assert!(sm.transition_to(AgentStatus::WaitTest));
        assert!(sm.transition_to(AgentStatus::Testing));
        assert!(sm.transition_to(AgentStatus::Ok));
        assert!(sm.permits_entries());
        assert!(sm.transition_to(AgentStatus::Warn));
        assert!(sm.transition_to(AgentStatus::Error));
        assert_eq!(sm.history().len(), 6);
        assert_eq!(sm.previous_status(), Some(AgentStatus::Warn));
    }

    #[test]
    fn test_fatal_needs_operator() {
        let mut sm = LifecycleStateMachine::new("EURUSD_H1");
        sm.transition_to(AgentStatus::Training);
        assert!(sm.transition_to(AgentStatus::FatalError));
        assert!(!sm.transition_to(AgentStatus::Ok));
        assert!(!sm.transition_to(AgentStatus::Paused));
        assert!(sm.is_fatal());
        assert!(sm.transition_to(AgentStatus::Training));
    }

    #[test]
    fn test_same_status_is_rejected() {
        let mut sm = LifecycleStateMachine::new("EURUSD_H1");
        sm.transition_to(AgentStatus::Paused);
        assert!(!sm.transition_to(AgentStatus::Paused));
        assert_eq!(sm.history().len(), 1);
    }

    #[test]
    fn test_history_is_bounded() {
        let mut sm = LifecycleStateMachine::new("EURUSD_H1");
        sm.transition_to(AgentStatus::Ok);
        for i in 0..150 {
            let target = if i % 2 == 0 { AgentStatus::Warn } else { AgentStatus::Ok };
            sm.transition_to(target);
        }
        assert_eq!(sm.history().len(), 100);
    }

    #[test]
    fn test_manual_stop_protection() {
        assert!(AgentStatus::WaitTest.survives_manual_stop());
        assert!(AgentStatus::FatalError.survives_manual_stop());
        assert!(!AgentStatus::Ok.survives_manual_stop());
        assert_eq!(AgentStatus::FatalError.to_string(), "FATAL_ERROR");
    }
}
