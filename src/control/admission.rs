//! Admission Controller
//!
//! Bounded counting gate over full-retrain cycles. Agents share compute and
//! history storage, so only `limit` of them may retrain at once.
//!
//! Prefer the scoped API (`try_acquire` / `acquire`): the returned
//! [`AdmissionPermit`] releases its slot on drop, including on error paths.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Notify;
use tracing::debug;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AdmissionError {
    #[error("all {limit} retraining slots are in use")]
    Exhausted { limit: usize },
}

/// Shared counting gate
#[derive(Debug)]
pub struct AdmissionController {
    limit: usize,
    current: AtomicUsize,
    released: Notify,
}

impl AdmissionController {
    pub fn new(limit: usize) -> Self {
        Self {
            limit,
            current: AtomicUsize::new(0),
            released: Notify::new(),
        }
    }

    /// Take a slot if one is free
    pub fn request_permission(&self) -> bool {
        let granted = self
            .current
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                (current < self.limit).then_some(current + 1)
            })
            .is_ok();
        if !granted {
            metrics::counter!("forecast_supervisor_admission_denied_total").increment(1);
        }
        granted
    }

    /// Return a slot, floored at zero
    pub fn release(&self) {
        let _ = self
            .current
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                Some(current.saturating_sub(1))
            });
        self.released.notify_one();
    }

    /// Scoped non-blocking acquisition
    pub fn try_acquire(self: &Arc<Self>) -> Result<AdmissionPermit, AdmissionError> {
        if self.request_permission() {
            Ok(AdmissionPermit {
                controller: Arc::clone(self),
            })
        } else {
            Err(AdmissionError::Exhausted { limit: self.limit })
        }
    }

    /// Scoped acquisition, waiting until a slot frees up
    pub async fn acquire(self: &Arc<Self>) -> AdmissionPermit {
        loop {
            let notified = self.released.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Ok(permit) = self.try_acquire() {
                return permit;
            }
            debug!(limit = self.limit, "Waiting for a retraining slot");
            notified.await;
        }
    }

    pub fn in_use(&self) -> usize {
        self.current.load(Ordering::Acquire)
    }

    pub fn limit(&self) -> usize {
        self.limit
    }
}

/// One admission slot, released on drop
#[derive(Debug)]
pub struct AdmissionPermit {
    controller: Arc<AdmissionController>,
}

impl Drop for AdmissionPermit {
    fn drop(&mut self) {
        self.controller.release();
    }
}
