//! The `submit` operation: admission followed by enqueue

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::controller::{Admission, RateAdmissionController};
use crate::queue::QueueClient;

/// What a submitter sees for one request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum AdmissionResult {
    Admitted,
    AdmittedDelayed { delay_ms: u64 },
    Rejected { reason: String },
    /// Retryable; nothing was enqueued
    TransientFailure { reason: String },
}

impl AdmissionResult {
    /// Whether the work was enqueued
    pub fn is_admitted(&self) -> bool {
        matches!(self, AdmissionResult::Admitted | AdmissionResult::AdmittedDelayed { .. })
    }
}

/// Front door used by request handlers and the CLI
#[derive(Debug, Clone)]
pub struct AdmissionService {
    controller: RateAdmissionController,
    queue: QueueClient,
    delay_jitter: Duration,
}

impl AdmissionService {
    pub fn new(controller: RateAdmissionController, queue: QueueClient) -> Self {
        Self {
            controller,
            queue,
            delay_jitter: Duration::ZERO,
        }
    }

    /// Spread deferred items over `[delay, delay + jitter]` instead of
    /// releasing them all at the window boundary
    pub fn with_delay_jitter(mut self, jitter: Duration) -> Self {
        self.delay_jitter = jitter;
        self
    }

    pub async fn submit(&self, work_key: &str) -> AdmissionResult {
        debug!(%work_key, "submit: called");
        let admission = match self.controller.admit(work_key).await {
            Ok(admission) => admission,
            Err(e) => {
                warn!(%work_key, error = %e, "submit: admission failed closed");
                return AdmissionResult::TransientFailure { reason: e.to_string() };
            }
        };

        let (delay, result) = match admission {
            Admission::Rejected { reason } => return AdmissionResult::Rejected { reason },
            Admission::Admitted => (Duration::ZERO, AdmissionResult::Admitted),
            Admission::AdmittedDelayed { delay } => {
                let delay = delay + self.jitter();
                (
                    delay,
                    AdmissionResult::AdmittedDelayed {
                        delay_ms: delay.as_millis() as u64,
                    },
                )
            }
        };

        // The window slot is already consumed; the caller is told to retry
        // rather than being told the work is queued when it is not
        if let Err(e) = self.queue.enqueue(work_key, delay).await {
            warn!(%work_key, error = %e, "submit: enqueue failed");
            return AdmissionResult::TransientFailure { reason: e.to_string() };
        }

        result
    }

    fn jitter(&self) -> Duration {
        let max_ms = self.delay_jitter.as_millis() as u64;
        if max_ms == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::rng().random_range(0..=max_ms))
    }
}
