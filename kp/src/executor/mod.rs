//! Task execution collaborator
//!
//! The scheduler only knows [`TaskExecutor`]. Delivery is at-least-once, so
//! implementations must tolerate being called again for work that already
//! ran.

mod log;

pub use log::{CompletionLog, CompletionRecord, read_completions};

use async_trait::async_trait;
use thiserror::Error;

use crate::keys::WorkKey;

#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Failed(String),
}

#[async_trait]
pub trait TaskExecutor: Send + Sync {
    async fn execute(&self, work_key: &WorkKey) -> Result<(), ExecutorError>;
}
