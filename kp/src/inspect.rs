//! Read-only view of one key's coordination state, for operators

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::admission::RatePolicy;
use crate::keys::{KeySpace, WorkKey};
use crate::store::{StoreClient, StoreError, StoreResult};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct KeyStatus {
    pub work_key: String,
    pub window_id: i64,
    pub window_count: u64,
    pub per_window: u64,
    /// Remaining Rate-Exceeded Flag lifetime
    pub limited_for: Option<Duration>,
    pub lock_holder: Option<String>,
    pub lock_ttl: Option<Duration>,
    pub last_execution_ms: Option<i64>,
}

impl KeyStatus {
    pub async fn fetch(
        store: &StoreClient,
        keys: &KeySpace,
        policy: &RatePolicy,
        now_ms: i64,
        work_key: &WorkKey,
    ) -> StoreResult<Self> {
        let window_id = policy.window_id(now_ms);
        let counter_key = keys.window_counter(work_key, window_id);
        let window_count = match store.get(&counter_key).await? {
            Some(raw) => raw
                .parse()
                .map_err(|_| StoreError::Corrupt(format!("{}: not a counter: {:?}", counter_key, raw)))?,
            None => 0,
        };

        let flag_key = keys.rate_flag(work_key);
        let limited_for = match store.get(&flag_key).await? {
            Some(_) => store.ttl(&flag_key).await?,
            None => None,
        };

        let lock_key = keys.lock(work_key);
        let lock_holder = store.get(&lock_key).await?;
        let lock_ttl = match lock_holder {
            Some(_) => store.ttl(&lock_key).await?,
            None => None,
        };

        let last_key = keys.last_execution(work_key);
        let last_execution_ms = match store.get(&last_key).await? {
            Some(raw) => Some(
                raw.parse()
                    .map_err(|_| StoreError::Corrupt(format!("{}: not a timestamp: {:?}", last_key, raw)))?,
            ),
            None => None,
        };

        Ok(Self {
            work_key: work_key.to_string(),
            window_id,
            window_count,
            per_window: policy.per_window,
            limited_for,
            lock_holder,
            lock_ttl,
            last_execution_ms,
        })
    }
}

impl fmt::Display for KeyStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Key:             {}", self.work_key)?;
        writeln!(
            f,
            "Window:          {} ({}/{} admitted)",
            self.window_id, self.window_count, self.per_window
        )?;
        match self.limited_for {
            Some(ttl) => writeln!(f, "Rate limited:    yes ({}ms left)", ttl.as_millis())?,
            None => writeln!(f, "Rate limited:    no")?,
        }
        match (&self.lock_holder, self.lock_ttl) {
            (Some(holder), Some(ttl)) => writeln!(f, "Lock:            {} ({}ms left)", holder, ttl.as_millis())?,
            (Some(holder), None) => writeln!(f, "Lock:            {}", holder)?,
            (None, _) => writeln!(f, "Lock:            free")?,
        }
        match self.last_execution_ms.and_then(DateTime::<Utc>::from_timestamp_millis) {
            Some(at) => write!(f, "Last execution:  {}", at.to_rfc3339()),
            None => write!(f, "Last execution:  never"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keystore::{ManualClock, MemoryStore};
    use std::sync::Arc;

    const NOW: i64 = 1_700_000_040_000;

    #[tokio::test]
    async fn test_fetch_reflects_store() {
        let clock = ManualClock::new(NOW);
        let store = StoreClient::spawn(MemoryStore::with_clock(Arc::new(clock.clone()))).unwrap();
        let keys = KeySpace::new("t");
        let policy = RatePolicy::default();
        let key = WorkKey::parse("123").unwrap();

        let empty = KeyStatus::fetch(&store, &keys, &policy, NOW, &key).await.unwrap();
        assert_eq!(empty.window_count, 0);
        assert_eq!(empty.lock_holder, None);
        assert!(empty.to_string().contains("never"));

        let window_id = policy.window_id(NOW);
        for _ in 0..3 {
            store
                .incr_with_ttl(&keys.window_counter(&key, window_id), Duration::from_secs(60))
                .await
                .unwrap();
        }
        store.set(&keys.rate_flag(&key), "1", Some(Duration::from_secs(30))).await.unwrap();
        store.set_nx(&keys.lock(&key), "r:abc", Duration::from_secs(10)).await.unwrap();
        store.set(&keys.last_execution(&key), &NOW.to_string(), None).await.unwrap();

        let status = KeyStatus::fetch(&store, &keys, &policy, NOW, &key).await.unwrap();
        assert_eq!(status.window_count, 3);
        assert_eq!(status.limited_for, Some(Duration::from_secs(30)));
        assert_eq!(status.lock_holder.as_deref(), Some("r:abc"));
        assert_eq!(status.lock_ttl, Some(Duration::from_secs(10)));
        assert_eq!(status.last_execution_ms, Some(NOW));
        assert!(status.to_string().contains("3/20 admitted"));
    }
}
