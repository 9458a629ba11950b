//! Per-item execution state machine
//!
//! ```text
//! Dequeued -> LockPending{0} -> Spacing -> Executing -> Recorded -> Released
//!                  |  ^
//!                  +--+ contended, budget and deadline left (sleep poll_interval)
//!
//! any non-terminal state --error--> Failed (lease released best-effort)
//! ```
//!
//! Each call to [`Pipeline::step`] performs exactly one transition.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use super::config::SchedulerConfig;
use crate::error::PaceError;
use crate::executor::TaskExecutor;
use crate::keys::WorkKey;
use crate::lock::{ExecutionLock, Lease};
use crate::spacing::SpacingEnforcer;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineState {
    Dequeued,
    /// `attempt` counts failed acquisitions so far
    LockPending { attempt: u32 },
    Spacing { lease: Lease },
    Executing { lease: Lease },
    Recorded { lease: Lease, completed_at_ms: i64 },
    Released,
    Failed { reason: String },
}

impl PipelineState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, PipelineState::Released | PipelineState::Failed { .. })
    }

    pub fn name(&self) -> &'static str {
        match self {
            PipelineState::Dequeued => "dequeued",
            PipelineState::LockPending { .. } => "lock_pending",
            PipelineState::Spacing { .. } => "spacing",
            PipelineState::Executing { .. } => "executing",
            PipelineState::Recorded { .. } => "recorded",
            PipelineState::Released => "released",
            PipelineState::Failed { .. } => "failed",
        }
    }
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// What happened to one item
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineReport {
    pub work_key: WorkKey,
    /// `Released` or `Failed`
    pub state: PipelineState,
    pub lock_retries: u32,
    pub spacing_wait: Duration,
    pub completed_at_ms: Option<i64>,
    /// Lock waits give up before this instant
    pub deadline_ms: Option<i64>,
    /// The lease TTL ran out while the executor was still running
    pub lease_lost: bool,
}

impl PipelineReport {
    fn new(work_key: &WorkKey) -> Self {
        Self {
            work_key: work_key.clone(),
            state: PipelineState::Dequeued,
            lock_retries: 0,
            spacing_wait: Duration::ZERO,
            completed_at_ms: None,
            deadline_ms: None,
            lease_lost: false,
        }
    }

    pub fn succeeded(&self) -> bool {
        self.state == PipelineState::Released
    }
}

/// Everything one item needs on its way through the states
#[derive(Clone)]
pub struct Pipeline {
    lock: ExecutionLock,
    spacing: SpacingEnforcer,
    executor: Arc<dyn TaskExecutor>,
    config: SchedulerConfig,
}

impl fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipeline")
            .field("lock", &self.lock)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Pipeline {
    pub fn new(
        lock: ExecutionLock,
        spacing: SpacingEnforcer,
        executor: Arc<dyn TaskExecutor>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            lock,
            spacing,
            executor,
            config,
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Drive one item from `Dequeued` to a terminal state
    pub async fn run(&self, work_key: &WorkKey) -> PipelineReport {
        self.drive(PipelineReport::new(work_key)).await
    }

    /// Like [`Pipeline::run`], but stops waiting for the lock one poll before
    /// `deadline_ms` so the failure reaches the queue while the delivery
    /// still owns the item
    pub async fn run_until(&self, work_key: &WorkKey, deadline_ms: i64) -> PipelineReport {
        let mut report = PipelineReport::new(work_key);
        report.deadline_ms = Some(deadline_ms);
        self.drive(report).await
    }

    async fn drive(&self, mut report: PipelineReport) -> PipelineReport {
        let mut state = PipelineState::Dequeued;
        while !state.is_terminal() {
            state = self.step(state, &mut report).await;
        }
        report.state = state;
        report
    }

    /// Perform one transition; terminal states map to themselves
    pub async fn step(&self, state: PipelineState, report: &mut PipelineReport) -> PipelineState {
        let work_key = report.work_key.clone();
        match state {
            PipelineState::Dequeued => PipelineState::LockPending { attempt: 0 },

            PipelineState::LockPending { attempt } => match self.lock.acquire(&work_key, self.config.lease_ttl).await {
                Ok(Some(lease)) => PipelineState::Spacing { lease },
                Ok(None) => {
                    report.lock_retries += 1;
                    let attempts = attempt + 1;
                    let poll_interval = self.config.lock_retry.poll_interval;
                    let near_deadline = report
                        .deadline_ms
                        .is_some_and(|deadline| self.lock.now_ms() + poll_interval.as_millis() as i64 >= deadline);
                    if near_deadline || !self.config.lock_retry.allows(attempts) {
                        let err = PaceError::LockContended {
                            work_key: work_key.to_string(),
                            attempts,
                        };
                        info!(%work_key, attempts, near_deadline, "step: giving up on the lock");
                        return PipelineState::Failed { reason: err.to_string() };
                    }
                    debug!(%work_key, attempt = attempts, "step: lock contended");
                    tokio::time::sleep(poll_interval).await;
                    PipelineState::LockPending { attempt: attempts }
                }
                Err(e) => self.fail(None, PaceError::from(e)).await,
            },

            PipelineState::Spacing { lease } => {
                match self.spacing.wait_for_turn(&lease, self.config.min_interval).await {
                    Ok(waited) => {
                        report.spacing_wait += waited;
                        PipelineState::Executing { lease }
                    }
                    Err(e) => self.fail(Some(&lease), PaceError::from(e)).await,
                }
            }

            PipelineState::Executing { lease } => {
                if let Err(e) = self.executor.execute(&work_key).await {
                    // The timestamp is left alone so the retry is spaced from the last success
                    return self.fail(Some(&lease), PaceError::from(e)).await;
                }
                if lease.is_expired(self.lock.now_ms()) {
                    report.lease_lost = true;
                    warn!(%work_key, token = %lease.token, "step: lease expired during execution, key may have run concurrently");
                }
                match self.spacing.record_completion(&lease).await {
                    Ok(completed_at_ms) => PipelineState::Recorded { lease, completed_at_ms },
                    Err(e) => self.fail(Some(&lease), PaceError::from(e)).await,
                }
            }

            PipelineState::Recorded { lease, completed_at_ms } => {
                report.completed_at_ms = Some(completed_at_ms);
                self.release(&lease).await;
                debug!(%work_key, completed_at_ms, "step: released");
                PipelineState::Released
            }

            terminal @ (PipelineState::Released | PipelineState::Failed { .. }) => terminal,
        }
    }

    async fn fail(&self, lease: Option<&Lease>, err: PaceError) -> PipelineState {
        if let Some(lease) = lease {
            self.release(lease).await;
        }
        warn!(error = %err, transient = err.is_transient(), "step: pipeline failed");
        PipelineState::Failed { reason: err.to_string() }
    }

    /// Not retried; the lease TTL cleans up
    async fn release(&self, lease: &Lease) {
        if let Err(e) = self.lock.release(lease).await {
            warn!(work_key = %lease.work_key, error = %e, "release: failed, lock will expire");
        }
    }
}
