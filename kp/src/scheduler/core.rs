//! Worker loop - dequeues deliveries and runs their pipelines

use std::sync::Arc;
use std::time::Duration;

use keystore::{Delivery, FailOutcome, QueueResult};
use serde::Serialize;
use tokio::sync::{Semaphore, mpsc};
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use super::pipeline::{Pipeline, PipelineReport};
use crate::keys::WorkKey;
use crate::queue::QueueClient;

/// Counters accumulated over a worker's lifetime
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct WorkerStats {
    pub completed: u64,
    pub failed: u64,
    pub dead_lettered: u64,
    pub lock_retries: u64,
    pub spacing_wait: Duration,
}

impl WorkerStats {
    fn record(&mut self, outcome: &ItemOutcome) {
        if let Some(report) = &outcome.report {
            self.lock_retries += u64::from(report.lock_retries);
            self.spacing_wait += report.spacing_wait;
        }
        if outcome.succeeded() {
            self.completed += 1;
        } else {
            self.failed += 1;
        }
        if outcome.dead {
            self.dead_lettered += 1;
        }
    }
}

#[derive(Debug)]
struct ItemOutcome {
    report: Option<PipelineReport>,
    dead: bool,
}

impl ItemOutcome {
    fn succeeded(&self) -> bool {
        self.report.as_ref().is_some_and(PipelineReport::succeeded)
    }
}

/// One replica's scheduler loop
pub struct Worker {
    queue: QueueClient,
    pipeline: Pipeline,
    semaphore: Arc<Semaphore>,
    tasks: JoinSet<ItemOutcome>,
    stats: WorkerStats,
}

impl Worker {
    pub fn new(queue: QueueClient, pipeline: Pipeline) -> Self {
        let max_concurrent = pipeline.config().max_concurrent.max(1);
        debug!(max_concurrent, "Worker::new: called");
        Self {
            queue,
            pipeline,
            semaphore: Arc::new(Semaphore::new(max_concurrent)),
            tasks: JoinSet::new(),
            stats: WorkerStats::default(),
        }
    }

    pub fn stats(&self) -> &WorkerStats {
        &self.stats
    }

    pub fn in_flight(&self) -> usize {
        self.tasks.len()
    }

    /// Poll until a shutdown signal arrives, then drain gracefully
    pub async fn run(&mut self, mut shutdown_rx: mpsc::Receiver<()>) -> WorkerStats {
        info!(
            max_concurrent = self.pipeline.config().max_concurrent,
            "Worker starting"
        );
        let mut interval = tokio::time::interval(self.pipeline.config().poll_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.fill().await;
                }

                Some(joined) = self.tasks.join_next(), if !self.tasks.is_empty() => {
                    self.reap(joined);
                    // A permit just freed up
                    self.fill().await;
                }

                _ = shutdown_rx.recv() => {
                    info!("Shutdown signal received");
                    break;
                }
            }
        }

        self.shutdown().await;
        self.stats.clone()
    }

    /// Process until nothing is in flight and the queue holds no pending work
    ///
    /// Delayed and retry-scheduled items are waited for; dead letters are not.
    pub async fn run_until_idle(&mut self) -> QueueResult<WorkerStats> {
        debug!("run_until_idle: called");
        loop {
            self.fill().await;

            if !self.tasks.is_empty() {
                if let Some(joined) = self.tasks.join_next().await {
                    self.reap(joined);
                }
                continue;
            }

            let stats = self.queue.stats().await?;
            if stats.ready + stats.delayed + stats.leased == 0 {
                debug!(stats = ?self.stats, "run_until_idle: queue drained");
                return Ok(self.stats.clone());
            }
            tokio::time::sleep(self.pipeline.config().poll_interval).await;
        }
    }

    /// Dequeue while permits are free; returns how many pipelines started
    pub async fn fill(&mut self) -> usize {
        let mut started = 0;
        loop {
            let Ok(permit) = self.semaphore.clone().try_acquire_owned() else {
                break;
            };
            match self.queue.dequeue(self.pipeline.config().visibility_timeout).await {
                Ok(Some(delivery)) => {
                    let queue = self.queue.clone();
                    let pipeline = self.pipeline.clone();
                    self.tasks.spawn(async move {
                        let outcome = process(queue, pipeline, delivery).await;
                        drop(permit);
                        outcome
                    });
                    started += 1;
                }
                Ok(None) => break,
                Err(e) => {
                    warn!(error = %e, "fill: dequeue failed");
                    break;
                }
            }
        }
        started
    }

    fn reap(&mut self, joined: Result<ItemOutcome, tokio::task::JoinError>) {
        match joined {
            Ok(outcome) => self.stats.record(&outcome),
            Err(e) => {
                error!(error = %e, "reap: pipeline task panicked");
                self.stats.failed += 1;
            }
        }
    }

    /// Stop dequeuing and wait up to the configured timeout
    ///
    /// Aborted items were never acknowledged, so the queue redelivers them
    /// after their visibility timeout.
    async fn shutdown(&mut self) {
        let timeout = self.pipeline.config().shutdown_timeout;
        info!(in_flight = self.tasks.len(), ?timeout, "Worker shutting down");

        let deadline = tokio::time::Instant::now() + timeout;
        while !self.tasks.is_empty() {
            match tokio::time::timeout_at(deadline, self.tasks.join_next()).await {
                Ok(Some(joined)) => self.reap(joined),
                Ok(None) => break,
                Err(_) => {
                    warn!("Aborting {} in-flight pipelines after timeout", self.tasks.len());
                    self.tasks.abort_all();
                    while self.tasks.join_next().await.is_some() {}
                    break;
                }
            }
        }
        info!(stats = ?self.stats, "Worker shutdown complete");
    }
}

async fn process(queue: QueueClient, pipeline: Pipeline, delivery: Delivery) -> ItemOutcome {
    let item = &delivery.item;
    debug!(id = %item.id, work_key = %item.work_key, attempts = item.attempts, "process: called");

    let work_key = match WorkKey::parse(item.work_key.as_str()) {
        Ok(key) => key,
        Err(e) => {
            let dead = report_failure(&queue, &delivery, &e.to_string()).await;
            return ItemOutcome { report: None, dead };
        }
    };

    let report = pipeline.run_until(&work_key, delivery.deadline_ms).await;
    let dead = match &report.state {
        super::PipelineState::Released => {
            match queue.ack(&delivery).await {
                Ok(true) => info!(%work_key, id = %item.id, "Item completed"),
                Ok(false) => warn!(%work_key, id = %item.id, "process: completed after visibility timeout"),
                Err(e) => warn!(%work_key, id = %item.id, error = %e, "process: ack failed"),
            }
            false
        }
        super::PipelineState::Failed { reason } => report_failure(&queue, &delivery, reason).await,
        other => {
            warn!(%work_key, state = %other, "process: pipeline stopped in a non-terminal state");
            false
        }
    };

    ItemOutcome {
        report: Some(report),
        dead,
    }
}

/// Returns whether the item was dead-lettered
async fn report_failure(queue: &QueueClient, delivery: &Delivery, reason: &str) -> bool {
    let id = &delivery.item.id;
    match queue.fail(delivery, reason).await {
        Ok(FailOutcome::Retry { after }) => {
            debug!(%id, ?after, %reason, "report_failure: retry scheduled");
            false
        }
        Ok(FailOutcome::Dead) => {
            error!(%id, %reason, "Item dead-lettered");
            true
        }
        Ok(FailOutcome::Stale) => {
            warn!(%id, %reason, "report_failure: visibility deadline passed, item already redelivered");
            false
        }
        Err(e) => {
            warn!(%id, error = %e, "report_failure: queue rejected failure report, item will be redelivered");
            false
        }
    }
}
