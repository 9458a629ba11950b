//! The coordination store contract

use std::time::Duration;

use thiserror::Error;

/// Errors from key-value operations
#[derive(Debug, Error)]
pub enum KvError {
    /// The backend could not be reached or did not answer in time
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    /// A value had the wrong shape for the requested operation
    #[error("Corrupt value for key {key}: {reason}")]
    Corrupt { key: String, reason: String },
}

impl KvError {
    /// Whether retrying the same call later can succeed
    pub fn is_transient(&self) -> bool {
        matches!(self, KvError::Unavailable(_))
    }
}

impl From<rusqlite::Error> for KvError {
    fn from(err: rusqlite::Error) -> Self {
        KvError::Unavailable(err.to_string())
    }
}

pub type KvResult<T> = Result<T, KvError>;

/// Atomic primitives shared by every replica
///
/// Each call is atomic with respect to every other call on the same key,
/// from any process using the same backend. Expired keys behave exactly as
/// absent keys.
pub trait KvStore: Send {
    /// Increment the integer at `key`, creating it at 1 with expiry `ttl`
    /// when absent. The expiry is only set by the creating increment.
    fn incr_with_ttl(&mut self, key: &str, ttl: Duration) -> KvResult<i64>;

    /// Create `key` with `value` and expiry `ttl` only if it is absent.
    /// Returns whether this call created it.
    fn set_nx(&mut self, key: &str, value: &str, ttl: Duration) -> KvResult<bool>;

    fn get(&mut self, key: &str) -> KvResult<Option<String>>;

    /// Overwrite `key`. `None` means the key never expires.
    fn set(&mut self, key: &str, value: &str, ttl: Option<Duration>) -> KvResult<()>;

    /// Remove `key`. Returns whether a live key was removed.
    fn delete(&mut self, key: &str) -> KvResult<bool>;

    /// Remove `key` only if it currently holds `expected`.
    fn delete_if_equals(&mut self, key: &str, expected: &str) -> KvResult<bool>;

    /// Remaining lifetime of `key`; `Ok(None)` for absent or non-expiring keys.
    fn ttl(&mut self, key: &str) -> KvResult<Option<Duration>>;

    /// Drop expired entries. Returns how many were removed.
    fn purge_expired(&mut self) -> KvResult<usize>;
}

pub(crate) fn parse_counter(key: &str, value: &str) -> KvResult<i64> {
    value.parse::<i64>().map_err(|e| KvError::Corrupt {
        key: key.to_string(),
        reason: format!("not an integer ({}): {:?}", e, value),
    })
}

pub(crate) fn remaining(expires_at: Option<i64>, now_ms: i64) -> Option<Duration> {
    expires_at.map(|at| Duration::from_millis((at - now_ms).max(0) as u64))
}
