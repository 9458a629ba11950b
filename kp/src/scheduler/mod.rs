//! Execution scheduler
//!
//! [`Worker`] pulls deliveries off the queue and runs each one through a
//! [`Pipeline`]: lock, spacing wait, execute, record, release.

mod config;
mod core;
mod pipeline;

pub use config::SchedulerConfig;
pub use self::core::{Worker, WorkerStats};
pub use pipeline::{Pipeline, PipelineReport, PipelineState};
