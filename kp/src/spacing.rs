//! Minimum spacing between consecutive executions of one key

use std::sync::Arc;
use std::time::Duration;

use keystore::Clock;
use tracing::debug;

use crate::keys::{KeySpace, WorkKey};
use crate::lock::Lease;
use crate::store::{StoreClient, StoreError, StoreResult};

/// Reads and advances the Last-Execution Timestamp
///
/// Both operations take a [`Lease`], so only the current lock holder can
/// call them.
#[derive(Debug, Clone)]
pub struct SpacingEnforcer {
    store: StoreClient,
    keys: KeySpace,
    clock: Arc<dyn Clock>,
}

impl SpacingEnforcer {
    pub fn new(store: StoreClient, keys: KeySpace, clock: Arc<dyn Clock>) -> Self {
        Self { store, keys, clock }
    }

    /// Sleep until `min_interval` has passed since the last completion
    ///
    /// Returns how long it slept. The timestamp is checked once, before the
    /// sleep; the lock keeps it stable while we wait.
    pub async fn wait_for_turn(&self, lease: &Lease, min_interval: Duration) -> StoreResult<Duration> {
        let Some(last) = self.last_execution(&lease.work_key).await? else {
            return Ok(Duration::ZERO);
        };

        // A timestamp ahead of our clock counts as just now
        let elapsed = (self.clock.now_ms() - last).max(0) as u64;
        let wait = min_interval.saturating_sub(Duration::from_millis(elapsed));
        if !wait.is_zero() {
            debug!(work_key = %lease.work_key, elapsed_ms = elapsed, ?wait, "wait_for_turn: sleeping");
            tokio::time::sleep(wait).await;
        }
        Ok(wait)
    }

    /// Stamp the completion time; returns the stored value
    ///
    /// Never moves the timestamp backwards, so a small clock step on this
    /// replica cannot shorten the next key's spacing.
    pub async fn record_completion(&self, lease: &Lease) -> StoreResult<i64> {
        let now = self.clock.now_ms();
        let stamp = match self.last_execution(&lease.work_key).await? {
            Some(last) => now.max(last),
            None => now,
        };
        self.store
            .set(&self.keys.last_execution(&lease.work_key), &stamp.to_string(), None)
            .await?;
        debug!(work_key = %lease.work_key, stamp, "record_completion: stored");
        Ok(stamp)
    }

    pub async fn last_execution(&self, work_key: &WorkKey) -> StoreResult<Option<i64>> {
        let key = self.keys.last_execution(work_key);
        match self.store.get(&key).await? {
            None => Ok(None),
            Some(raw) => raw
                .parse::<i64>()
                .map(Some)
                .map_err(|_| StoreError::Corrupt(format!("{}: not a timestamp: {:?}", key, raw))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keystore::{ManualClock, MemoryStore};
    use std::time::Instant;

    const NOW: i64 = 1_700_000_000_000;

    fn setup() -> (SpacingEnforcer, StoreClient, ManualClock, Lease) {
        let clock = ManualClock::new(NOW);
        let store = StoreClient::spawn(MemoryStore::with_clock(Arc::new(clock.clone()))).unwrap();
        let spacing = SpacingEnforcer::new(store.clone(), KeySpace::new("t"), Arc::new(clock.clone()));
        let lease = Lease {
            work_key: WorkKey::parse("123").unwrap(),
            token: "r:1".to_string(),
            ttl: Duration::from_secs(10),
            acquired_at_ms: NOW,
        };
        (spacing, store, clock, lease)
    }

    #[tokio::test]
    async fn test_first_execution_does_not_wait() {
        let (spacing, _, _, lease) = setup();
        let waited = spacing.wait_for_turn(&lease, Duration::from_secs(1)).await.unwrap();
        assert_eq!(waited, Duration::ZERO);
    }

    #[tokio::test]
    async fn test_waits_remaining_interval() {
        let (spacing, _, clock, lease) = setup();
        spacing.record_completion(&lease).await.unwrap();
        clock.advance(Duration::from_millis(700));

        let started = Instant::now();
        let waited = spacing.wait_for_turn(&lease, Duration::from_secs(1)).await.unwrap();
        assert_eq!(waited, Duration::from_millis(300));
        assert!(started.elapsed() >= Duration::from_millis(300));
    }

    #[tokio::test]
    async fn test_no_wait_after_interval() {
        let (spacing, _, clock, lease) = setup();
        spacing.record_completion(&lease).await.unwrap();
        clock.advance(Duration::from_millis(1_500));

        let waited = spacing.wait_for_turn(&lease, Duration::from_secs(1)).await.unwrap();
        assert_eq!(waited, Duration::ZERO);
    }

    #[tokio::test]
    async fn test_future_timestamp_waits_full_interval() {
        let (spacing, store, _, lease) = setup();
        store
            .set("t:123:last", &(NOW + 5_000).to_string(), None)
            .await
            .unwrap();

        let waited = spacing.wait_for_turn(&lease, Duration::from_millis(200)).await.unwrap();
        assert_eq!(waited, Duration::from_millis(200));
    }

    #[tokio::test]
    async fn test_record_is_monotonic() {
        let (spacing, _, clock, lease) = setup();
        assert_eq!(spacing.record_completion(&lease).await.unwrap(), NOW);

        clock.set(NOW - 50);
        assert_eq!(spacing.record_completion(&lease).await.unwrap(), NOW);

        clock.set(NOW + 10);
        assert_eq!(spacing.record_completion(&lease).await.unwrap(), NOW + 10);
        assert_eq!(spacing.last_execution(&lease.work_key).await.unwrap(), Some(NOW + 10));
    }

    #[tokio::test]
    async fn test_corrupt_timestamp() {
        let (spacing, store, _, lease) = setup();
        store.set("t:123:last", "yesterday", None).await.unwrap();
        let err = spacing.wait_for_turn(&lease, Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, StoreError::Corrupt(_)));
    }
}
