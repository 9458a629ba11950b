//! Keypace - distributed per-key admission control and paced execution
//!
//! Keypace admits work items identified by a caller-supplied work key,
//! limits how many are admitted per key per window, and runs admitted work
//! strictly one-at-a-time per key with a minimum spacing between executions,
//! even when many stateless replicas share the load.
//!
//! # Core Concepts
//!
//! - **Store is the only shared state**: counters, flags, leases and
//!   timestamps live in a [`keystore::KvStore`]; replicas share no memory
//! - **Admission is not execution**: bursts are admitted (or deferred to the
//!   next window) immediately; pacing happens later at execution time
//! - **Lease then space**: the per-key lock is held before the spacing check
//!   and until the new timestamp is written
//! - **Fail closed**: store failures never turn into admissions
//!
//! # Modules
//!
//! - [`admission`] - Rate admission controller and the `submit` operation
//! - [`lock`] - Per-key execution lease
//! - [`spacing`] - Minimum interval between executions of one key
//! - [`scheduler`] - Worker loop and per-item pipeline
//! - [`executor`] - Task executor trait and the completion log
//! - [`store`] / [`queue`] - Async clients for the shared store and queue
//! - [`config`] - Configuration types and loading
//! - [`cli`] - Command-line interface

pub mod admission;
pub mod app;
pub mod cli;
pub mod config;
pub mod error;
pub mod executor;
pub mod inspect;
pub mod keys;
pub mod lock;
pub mod queue;
pub mod scheduler;
pub mod spacing;
pub mod store;

// Re-export commonly used types
pub use admission::{Admission, AdmissionResult, AdmissionService, RateAdmissionController, RatePolicy};
pub use app::App;
pub use config::Config;
pub use error::PaceError;
pub use executor::{CompletionLog, CompletionRecord, ExecutorError, TaskExecutor, read_completions};
pub use inspect::KeyStatus;
pub use keys::{KeySpace, WorkKey};
pub use lock::{ExecutionLock, Lease, LockRetryPolicy, ReleaseMode};
pub use queue::QueueClient;
pub use scheduler::{Pipeline, PipelineReport, PipelineState, SchedulerConfig, Worker, WorkerStats};
pub use spacing::SpacingEnforcer;
pub use store::{StoreClient, StoreError, StoreResult};
