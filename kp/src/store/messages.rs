//! Store actor messages
//!
//! Commands and responses for the actor pattern.

use std::time::Duration;

use keystore::KvError;
use thiserror::Error;
use tokio::sync::oneshot;

/// Errors from store operations
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    /// Backend or actor unreachable; callers must fail closed
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Corrupt store value: {0}")]
    Corrupt(String),
}

impl StoreError {
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }
}

impl From<KvError> for StoreError {
    fn from(err: KvError) -> Self {
        match err {
            KvError::Unavailable(reason) => StoreError::Unavailable(reason),
            KvError::Corrupt { .. } => StoreError::Corrupt(err.to_string()),
        }
    }
}

/// Response from store operations
pub type StoreResult<T> = Result<T, StoreError>;

/// Commands sent to the store actor
#[derive(Debug)]
pub enum StoreCommand {
    IncrWithTtl {
        key: String,
        ttl: Duration,
        reply: oneshot::Sender<StoreResult<i64>>,
    },
    SetNx {
        key: String,
        value: String,
        ttl: Duration,
        reply: oneshot::Sender<StoreResult<bool>>,
    },
    Get {
        key: String,
        reply: oneshot::Sender<StoreResult<Option<String>>>,
    },
    Set {
        key: String,
        value: String,
        ttl: Option<Duration>,
        reply: oneshot::Sender<StoreResult<()>>,
    },
    Delete {
        key: String,
        reply: oneshot::Sender<StoreResult<bool>>,
    },
    DeleteIfEquals {
        key: String,
        expected: String,
        reply: oneshot::Sender<StoreResult<bool>>,
    },
    Ttl {
        key: String,
        reply: oneshot::Sender<StoreResult<Option<Duration>>>,
    },
    PurgeExpired {
        reply: oneshot::Sender<StoreResult<usize>>,
    },

    // Shutdown
    Shutdown,
}
