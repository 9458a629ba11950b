//! In-process KvStore with the same atomicity contract as the SQLite backend

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tracing::debug;

use crate::clock::{Clock, SystemClock};
use crate::kv::{KvError, KvResult, KvStore, parse_counter, remaining};

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    expires_at: Option<i64>,
}

impl Entry {
    fn is_live(&self, now_ms: i64) -> bool {
        self.expires_at.is_none_or(|at| at > now_ms)
    }
}

#[derive(Debug, Default)]
struct Inner {
    entries: HashMap<String, Entry>,
    unavailable: bool,
}

/// Shared in-memory store
///
/// Clones share the same entries, so several simulated replicas can
/// coordinate through one instance. `set_available(false)` makes every
/// operation fail with [`KvError::Unavailable`] while leaving the data in
/// place, which models an outage of a store that retains its state.
#[derive(Debug, Clone)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
    clock: Arc<dyn Clock>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner::default())),
            clock,
        }
    }

    /// Toggle the simulated outage
    pub fn set_available(&self, available: bool) {
        debug!(available, "MemoryStore::set_available: called");
        if let Ok(mut inner) = self.inner.lock() {
            inner.unavailable = !available;
        }
    }

    /// Number of live keys
    pub fn len(&self) -> usize {
        let now = self.clock.now_ms();
        self.inner
            .lock()
            .map(|inner| inner.entries.values().filter(|e| e.is_live(now)).count())
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> KvResult<MutexGuard<'_, Inner>> {
        let inner = self
            .inner
            .lock()
            .map_err(|_| KvError::Unavailable("memory store mutex poisoned".to_string()))?;
        if inner.unavailable {
            return Err(KvError::Unavailable("simulated outage".to_string()));
        }
        Ok(inner)
    }

    fn live<'a>(inner: &'a mut Inner, key: &str, now: i64) -> Option<&'a mut Entry> {
        if inner.entries.get(key).is_some_and(|e| !e.is_live(now)) {
            inner.entries.remove(key);
        }
        inner.entries.get_mut(key)
    }
}

impl KvStore for MemoryStore {
    fn incr_with_ttl(&mut self, key: &str, ttl: Duration) -> KvResult<i64> {
        let now = self.clock.now_ms();
        let mut inner = self.lock()?;
        if let Some(entry) = Self::live(&mut inner, key, now) {
            let next = parse_counter(key, &entry.value)? + 1;
            entry.value = next.to_string();
            return Ok(next);
        }
        inner.entries.insert(
            key.to_string(),
            Entry {
                value: "1".to_string(),
                expires_at: Some(now + ttl.as_millis() as i64),
            },
        );
        Ok(1)
    }

    fn set_nx(&mut self, key: &str, value: &str, ttl: Duration) -> KvResult<bool> {
        let now = self.clock.now_ms();
        let mut inner = self.lock()?;
        if Self::live(&mut inner, key, now).is_some() {
            return Ok(false);
        }
        inner.entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: Some(now + ttl.as_millis() as i64),
            },
        );
        Ok(true)
    }

    fn get(&mut self, key: &str) -> KvResult<Option<String>> {
        let now = self.clock.now_ms();
        let mut inner = self.lock()?;
        Ok(Self::live(&mut inner, key, now).map(|e| e.value.clone()))
    }

    fn set(&mut self, key: &str, value: &str, ttl: Option<Duration>) -> KvResult<()> {
        let now = self.clock.now_ms();
        let mut inner = self.lock()?;
        inner.entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: ttl.map(|t| now + t.as_millis() as i64),
            },
        );
        Ok(())
    }

    fn delete(&mut self, key: &str) -> KvResult<bool> {
        let now = self.clock.now_ms();
        let mut inner = self.lock()?;
        Ok(inner.entries.remove(key).is_some_and(|e| e.is_live(now)))
    }

    fn delete_if_equals(&mut self, key: &str, expected: &str) -> KvResult<bool> {
        let now = self.clock.now_ms();
        let mut inner = self.lock()?;
        let matches = Self::live(&mut inner, key, now).is_some_and(|e| e.value == expected);
        if matches {
            inner.entries.remove(key);
        }
        Ok(matches)
    }

    fn ttl(&mut self, key: &str) -> KvResult<Option<Duration>> {
        let now = self.clock.now_ms();
        let mut inner = self.lock()?;
        Ok(Self::live(&mut inner, key, now).and_then(|e| remaining(e.expires_at, now)))
    }

    fn purge_expired(&mut self) -> KvResult<usize> {
        let now = self.clock.now_ms();
        let mut inner = self.lock()?;
        let before = inner.entries.len();
        inner.entries.retain(|_, e| e.is_live(now));
        Ok(before - inner.entries.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn store_at(start_ms: i64) -> (MemoryStore, ManualClock) {
        let clock = ManualClock::new(start_ms);
        (MemoryStore::with_clock(Arc::new(clock.clone())), clock)
    }

    #[test]
    fn test_incr_sets_ttl_only_on_creation() {
        let (mut store, clock) = store_at(0);
        let ttl = Duration::from_secs(60);

        assert_eq!(store.incr_with_ttl("c", ttl).unwrap(), 1);
        clock.advance(Duration::from_secs(30));
        assert_eq!(store.incr_with_ttl("c", ttl).unwrap(), 2);

        // Expiry still anchored at the first increment
        assert_eq!(store.ttl("c").unwrap(), Some(Duration::from_secs(30)));

        clock.advance(Duration::from_secs(30));
        assert_eq!(store.get("c").unwrap(), None);
        assert_eq!(store.incr_with_ttl("c", ttl).unwrap(), 1);
    }

    #[test]
    fn test_incr_rejects_non_integer() {
        let (mut store, _) = store_at(0);
        store.set("c", "abc", None).unwrap();
        let err = store.incr_with_ttl("c", Duration::from_secs(1)).unwrap_err();
        assert!(matches!(err, KvError::Corrupt { .. }));
        assert!(!err.is_transient());
    }

    #[test]
    fn test_set_nx_respects_expiry() {
        let (mut store, clock) = store_at(0);
        let ttl = Duration::from_millis(500);

        assert!(store.set_nx("lock", "a", ttl).unwrap());
        assert!(!store.set_nx("lock", "b", ttl).unwrap());

        clock.advance(Duration::from_millis(500));
        assert!(store.set_nx("lock", "b", ttl).unwrap());
        assert_eq!(store.get("lock").unwrap().as_deref(), Some("b"));
    }

    #[test]
    fn test_delete_if_equals() {
        let (mut store, _) = store_at(0);
        store.set("lock", "mine", Some(Duration::from_secs(1))).unwrap();

        assert!(!store.delete_if_equals("lock", "theirs").unwrap());
        assert!(store.delete_if_equals("lock", "mine").unwrap());
        assert!(!store.delete_if_equals("lock", "mine").unwrap());
    }

    #[test]
    fn test_delete_expired_reports_false() {
        let (mut store, clock) = store_at(0);
        store.set("k", "v", Some(Duration::from_millis(10))).unwrap();
        clock.advance(Duration::from_millis(10));
        assert!(!store.delete("k").unwrap());
    }

    #[test]
    fn test_outage_keeps_data() {
        let (mut store, _) = store_at(0);
        store.set("k", "v", None).unwrap();

        let handle = store.clone();
        handle.set_available(false);
        assert!(store.get("k").unwrap_err().is_transient());
        assert!(store.incr_with_ttl("n", Duration::from_secs(1)).is_err());

        handle.set_available(true);
        assert_eq!(store.get("k").unwrap().as_deref(), Some("v"));
        assert_eq!(store.get("n").unwrap(), None);
    }

    #[test]
    fn test_purge_expired() {
        let (mut store, clock) = store_at(0);
        store.set("a", "1", Some(Duration::from_millis(5))).unwrap();
        store.set("b", "1", None).unwrap();
        clock.advance(Duration::from_millis(5));

        assert_eq!(store.purge_expired().unwrap(), 1);
        assert_eq!(store.len(), 1);
    }
}
