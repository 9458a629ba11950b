//! Error taxonomy shared by admission and execution

use thiserror::Error;

use crate::executor::ExecutorError;
use crate::store::StoreError;

/// Errors surfaced by keypace components
///
/// Soft rate limiting is not an error: it is reported as
/// [`crate::Admission::AdmittedDelayed`] and the work is still enqueued.
#[derive(Debug, Error)]
pub enum PaceError {
    /// Missing or malformed work key; never enqueued
    #[error("Invalid work key: {0}")]
    Validation(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    /// Lock retry budget exhausted; handled by queue redelivery
    #[error("Lock for {work_key} still held after {attempts} attempts")]
    LockContended { work_key: String, attempts: u32 },

    #[error("Executor failed: {0}")]
    Executor(#[from] ExecutorError),

    #[error("Queue error: {0}")]
    Queue(#[from] keystore::QueueError),
}

impl PaceError {
    /// Whether the same request may succeed if retried later
    pub fn is_transient(&self) -> bool {
        match self {
            PaceError::Validation(_) => false,
            PaceError::Store(e) => e.is_transient(),
            PaceError::LockContended { .. } => true,
            PaceError::Executor(_) => true,
            PaceError::Queue(_) => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_transient() {
        assert!(!PaceError::Validation("empty".to_string()).is_transient());
        assert!(PaceError::Store(StoreError::Unavailable("down".to_string())).is_transient());
        assert!(!PaceError::Store(StoreError::Corrupt("bad".to_string())).is_transient());
        assert!(
            PaceError::LockContended {
                work_key: "123".to_string(),
                attempts: 3
            }
            .is_transient()
        );
    }

    #[test]
    fn test_display() {
        let err = PaceError::LockContended {
            work_key: "123".to_string(),
            attempts: 7,
        };
        assert_eq!(err.to_string(), "Lock for 123 still held after 7 attempts");

        let err = PaceError::Store(StoreError::Unavailable("connection refused".to_string()));
        assert_eq!(err.to_string(), "Store unavailable: connection refused");
    }
}
