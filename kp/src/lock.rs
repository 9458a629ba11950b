//! Per-key execution lock
//!
//! A lock is a self-expiring store key holding the owner's lease token. The
//! TTL bounds how long a crashed or hung holder can block its key.

use std::sync::Arc;
use std::time::Duration;

use keystore::Clock;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::keys::{KeySpace, WorkKey};
use crate::store::{StoreClient, StoreResult};

/// Proof of lock ownership, handed out by [`ExecutionLock::acquire`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub work_key: WorkKey,
    pub token: String,
    pub ttl: Duration,
    pub acquired_at_ms: i64,
}

impl Lease {
    /// Whether the lease TTL has run out at `now_ms`
    pub fn is_expired(&self, now_ms: i64) -> bool {
        now_ms >= self.acquired_at_ms + self.ttl.as_millis() as i64
    }
}

/// How [`ExecutionLock::release`] removes the lock key
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ReleaseMode {
    /// Delete only if the key still holds this lease's token
    #[default]
    VerifyToken,
    /// Delete whatever holds the key
    Unconditional,
}

/// Retry budget for a contended lock, consumed by the scheduler
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockRetryPolicy {
    pub poll_interval: Duration,
    /// `None` retries until the delivery's visibility deadline is near
    pub max_attempts: Option<u32>,
}

impl Default for LockRetryPolicy {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(100),
            max_attempts: None,
        }
    }
}

impl LockRetryPolicy {
    /// Whether another attempt is allowed after `attempts` failed ones
    pub fn allows(&self, attempts: u32) -> bool {
        self.max_attempts.is_none_or(|max| attempts < max)
    }
}

#[derive(Debug, Clone)]
pub struct ExecutionLock {
    store: StoreClient,
    keys: KeySpace,
    replica_id: String,
    release_mode: ReleaseMode,
    clock: Arc<dyn Clock>,
}

impl ExecutionLock {
    pub fn new(store: StoreClient, keys: KeySpace, replica_id: impl Into<String>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            keys,
            replica_id: replica_id.into(),
            release_mode: ReleaseMode::default(),
            clock,
        }
    }

    pub fn with_release_mode(mut self, mode: ReleaseMode) -> Self {
        self.release_mode = mode;
        self
    }

    pub fn release_mode(&self) -> ReleaseMode {
        self.release_mode
    }

    /// Single acquisition attempt; `None` means another owner holds the key
    pub async fn acquire(&self, work_key: &WorkKey, lease_ttl: Duration) -> StoreResult<Option<Lease>> {
        let token = format!("{}:{}", self.replica_id, Uuid::now_v7());
        let acquired_at_ms = self.clock.now_ms();

        if !self.store.set_nx(&self.keys.lock(work_key), &token, lease_ttl).await? {
            debug!(%work_key, "acquire: held by another owner");
            return Ok(None);
        }

        debug!(%work_key, %token, ?lease_ttl, "acquire: acquired");
        Ok(Some(Lease {
            work_key: work_key.clone(),
            token,
            ttl: lease_ttl,
            acquired_at_ms,
        }))
    }

    /// Returns whether a lock key was deleted
    ///
    /// With [`ReleaseMode::VerifyToken`] a lease that expired and was taken
    /// over by someone else is left alone.
    pub async fn release(&self, lease: &Lease) -> StoreResult<bool> {
        let key = self.keys.lock(&lease.work_key);
        let released = match self.release_mode {
            ReleaseMode::VerifyToken => self.store.delete_if_equals(&key, &lease.token).await?,
            ReleaseMode::Unconditional => self.store.delete(&key).await?,
        };

        if !released {
            warn!(work_key = %lease.work_key, token = %lease.token, "release: lock no longer held by this lease");
        }
        Ok(released)
    }

    /// Current time on the clock leases are stamped with
    pub fn now_ms(&self) -> i64 {
        self.clock.now_ms()
    }

    /// Current holder's token, if any
    pub async fn holder(&self, work_key: &WorkKey) -> StoreResult<Option<String>> {
        self.store.get(&self.keys.lock(work_key)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keystore::{ManualClock, MemoryStore};

    fn lock(replica: &str, backend: MemoryStore, clock: &ManualClock) -> ExecutionLock {
        let store = StoreClient::spawn(backend).unwrap();
        ExecutionLock::new(store, KeySpace::new("t"), replica, Arc::new(clock.clone()))
    }

    fn key() -> WorkKey {
        WorkKey::parse("123").unwrap()
    }

    #[tokio::test]
    async fn test_acquire_release() {
        let clock = ManualClock::new(1_000);
        let lock = lock("a", MemoryStore::with_clock(Arc::new(clock.clone())), &clock);

        let lease = lock.acquire(&key(), Duration::from_secs(10)).await.unwrap().unwrap();
        assert!(lease.token.starts_with("a:"));
        assert_eq!(lock.holder(&key()).await.unwrap(), Some(lease.token.clone()));
        assert!(lock.acquire(&key(), Duration::from_secs(10)).await.unwrap().is_none());

        assert!(lock.release(&lease).await.unwrap());
        assert_eq!(lock.holder(&key()).await.unwrap(), None);
        assert!(lock.acquire(&key(), Duration::from_secs(10)).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_race_has_one_winner() {
        let clock = ManualClock::new(1_000);
        let backend = MemoryStore::with_clock(Arc::new(clock.clone()));
        let a = lock("a", backend.clone(), &clock);
        let b = lock("b", backend, &clock);

        let (ka, kb) = (key(), key());
        let (ra, rb) = tokio::join!(
            a.acquire(&ka, Duration::from_secs(10)),
            b.acquire(&kb, Duration::from_secs(10))
        );
        let winners = [ra.unwrap(), rb.unwrap()].into_iter().flatten().count();
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn test_expired_lease_cannot_release_new_owner() {
        let clock = ManualClock::new(1_000);
        let backend = MemoryStore::with_clock(Arc::new(clock.clone()));
        let a = lock("a", backend.clone(), &clock);
        let b = lock("b", backend, &clock);

        let stale = a.acquire(&key(), Duration::from_secs(10)).await.unwrap().unwrap();
        clock.advance(Duration::from_secs(11));
        assert!(stale.is_expired(clock.now_ms()));

        let fresh = b.acquire(&key(), Duration::from_secs(10)).await.unwrap().unwrap();
        assert!(!a.release(&stale).await.unwrap());
        assert_eq!(b.holder(&key()).await.unwrap(), Some(fresh.token));
    }

    #[tokio::test]
    async fn test_unconditional_release_deletes_any_holder() {
        let clock = ManualClock::new(1_000);
        let backend = MemoryStore::with_clock(Arc::new(clock.clone()));
        let a = lock("a", backend.clone(), &clock).with_release_mode(ReleaseMode::Unconditional);
        let b = lock("b", backend, &clock);

        let stale = a.acquire(&key(), Duration::from_secs(10)).await.unwrap().unwrap();
        clock.advance(Duration::from_secs(11));
        b.acquire(&key(), Duration::from_secs(10)).await.unwrap().unwrap();

        assert!(a.release(&stale).await.unwrap());
        assert_eq!(b.holder(&key()).await.unwrap(), None);
    }

    #[test]
    fn test_retry_budget() {
        let unbounded = LockRetryPolicy::default();
        assert!(unbounded.allows(u32::MAX - 1));

        let bounded = LockRetryPolicy {
            poll_interval: Duration::from_millis(10),
            max_attempts: Some(3),
        };
        assert!(bounded.allows(2));
        assert!(!bounded.allows(3));
    }

    #[test]
    fn test_release_mode_yaml() {
        let mode: ReleaseMode = serde_yaml::from_str("unconditional").unwrap();
        assert_eq!(mode, ReleaseMode::Unconditional);
        let mode: ReleaseMode = serde_yaml::from_str("verify-token").unwrap();
        assert_eq!(mode, ReleaseMode::VerifyToken);
    }
}
