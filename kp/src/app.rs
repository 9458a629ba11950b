//! Wiring: builds every component from a [`Config`]

use std::sync::Arc;

use eyre::{Context, Result};
use keystore::{Clock, KvStore, MemoryStore, SqliteStore, SystemClock, WorkQueue};
use tracing::{debug, warn};

use crate::admission::{AdmissionResult, AdmissionService, RateAdmissionController};
use crate::config::{Config, StoreBackend};
use crate::executor::{CompletionLog, TaskExecutor};
use crate::inspect::KeyStatus;
use crate::keys::{KeySpace, WorkKey};
use crate::lock::ExecutionLock;
use crate::queue::QueueClient;
use crate::scheduler::{Pipeline, Worker};
use crate::spacing::SpacingEnforcer;
use crate::store::StoreClient;

/// One replica's components, sharing a store and queue handle
#[derive(Debug, Clone)]
pub struct App {
    config: Config,
    replica_id: String,
    store: StoreClient,
    queue: QueueClient,
    keys: KeySpace,
    clock: Arc<dyn Clock>,
    service: AdmissionService,
}

impl App {
    /// Open the configured store and queue
    pub fn open(config: &Config) -> Result<Self> {
        config.validate().context("Invalid configuration")?;
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);

        let queue_path = config.queue.path();
        let queue = WorkQueue::open_with_clock(&queue_path, config.queue.policy(), clock.clone())
            .context(format!("Failed to open queue at {}", queue_path.display()))?;

        match config.store.backend {
            StoreBackend::Sqlite => {
                let store_path = config.store.path();
                let store = SqliteStore::open_with_clock(&store_path, clock.clone())
                    .context(format!("Failed to open store at {}", store_path.display()))?;
                Self::with_backends(config, store, queue, clock)
            }
            StoreBackend::Memory => {
                warn!("Using the in-memory store; state is not shared with other replicas");
                Self::with_backends(config, MemoryStore::with_clock(clock.clone()), queue, clock)
            }
        }
    }

    /// Build from explicit backends
    pub fn with_backends<S: KvStore + 'static>(
        config: &Config,
        store: S,
        queue: WorkQueue,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let replica_id = config.replica_id();
        debug!(%replica_id, "App::with_backends: called");

        let store = StoreClient::spawn(store).context("Failed to start store client")?;
        let queue = QueueClient::spawn(queue).context("Failed to start queue client")?;
        let keys = KeySpace::new(config.store.namespace.clone());

        let controller = RateAdmissionController::new(store.clone(), keys.clone(), config.rate.policy(), clock.clone());
        let service = AdmissionService::new(controller, queue.clone()).with_delay_jitter(config.rate.delay_jitter());

        Ok(Self {
            config: config.clone(),
            replica_id,
            store,
            queue,
            keys,
            clock,
            service,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn replica_id(&self) -> &str {
        &self.replica_id
    }

    pub fn store(&self) -> &StoreClient {
        &self.store
    }

    pub fn queue(&self) -> &QueueClient {
        &self.queue
    }

    pub fn admission(&self) -> &AdmissionService {
        &self.service
    }

    pub async fn submit(&self, work_key: &str) -> AdmissionResult {
        self.service.submit(work_key).await
    }

    pub fn completion_log(&self) -> CompletionLog {
        CompletionLog::new(self.config.executor.log_path(), self.replica_id.clone(), self.clock.clone())
    }

    pub fn lock(&self) -> ExecutionLock {
        ExecutionLock::new(self.store.clone(), self.keys.clone(), self.replica_id.clone(), self.clock.clone())
            .with_release_mode(self.config.lock.release)
    }

    pub fn spacing(&self) -> SpacingEnforcer {
        SpacingEnforcer::new(self.store.clone(), self.keys.clone(), self.clock.clone())
    }

    /// Worker that appends to the configured completion log
    pub fn worker(&self) -> Worker {
        self.worker_with_executor(Arc::new(self.completion_log()))
    }

    pub fn worker_with_executor(&self, executor: Arc<dyn TaskExecutor>) -> Worker {
        let pipeline = Pipeline::new(self.lock(), self.spacing(), executor, self.config.scheduler_config());
        Worker::new(self.queue.clone(), pipeline)
    }

    pub async fn status(&self, work_key: &str) -> Result<KeyStatus> {
        let work_key = WorkKey::parse(work_key)?;
        let status = KeyStatus::fetch(
            &self.store,
            &self.keys,
            &self.config.rate.policy(),
            self.clock.now_ms(),
            &work_key,
        )
        .await?;
        Ok(status)
    }
}
