//! Fixed-window rate admission controller

use std::sync::Arc;
use std::time::Duration;

use keystore::Clock;
use tracing::{debug, info};

use crate::keys::{KeySpace, WorkKey};
use crate::store::{StoreClient, StoreResult};

/// Per-key window cap
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RatePolicy {
    /// Length of one fixed window
    pub window: Duration,
    /// Admissions allowed per key per window
    pub per_window: u64,
}

impl Default for RatePolicy {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(60),
            per_window: 20,
        }
    }
}

impl RatePolicy {
    fn window_ms(&self) -> i64 {
        (self.window.as_millis() as i64).max(1)
    }

    /// Id of the window containing `now_ms`
    pub fn window_id(&self, now_ms: i64) -> i64 {
        now_ms.div_euclid(self.window_ms())
    }

    /// Time left in the window containing `now_ms`; never zero
    pub fn remainder(&self, now_ms: i64) -> Duration {
        let window_ms = self.window_ms();
        Duration::from_millis((window_ms - now_ms.rem_euclid(window_ms)) as u64)
    }
}

/// Outcome of one admission decision
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    Admitted,
    /// Over the window cap; deferred to the start of the next window
    AdmittedDelayed {
        delay: Duration,
    },
    Rejected {
        reason: String,
    },
}

/// Decides admission from the Window Counter and Rate-Exceeded Flag
#[derive(Debug, Clone)]
pub struct RateAdmissionController {
    store: StoreClient,
    keys: KeySpace,
    policy: RatePolicy,
    clock: Arc<dyn Clock>,
}

impl RateAdmissionController {
    pub fn new(store: StoreClient, keys: KeySpace, policy: RatePolicy, clock: Arc<dyn Clock>) -> Self {
        debug!(?policy, "RateAdmissionController::new: called");
        Self {
            store,
            keys,
            policy,
            clock,
        }
    }

    pub fn policy(&self) -> RatePolicy {
        self.policy
    }

    /// Admit, defer or reject one request for `work_key`
    ///
    /// Store failures are returned as errors and never default to admission.
    pub async fn admit(&self, work_key: &str) -> StoreResult<Admission> {
        let key = match WorkKey::parse(work_key) {
            Ok(key) => key,
            Err(e) => {
                debug!(%work_key, error = %e, "admit: invalid work key");
                return Ok(Admission::Rejected { reason: e.to_string() });
            }
        };

        let now = self.clock.now_ms();
        let window_id = self.policy.window_id(now);
        let flag_key = self.keys.rate_flag(&key);

        if self.store.get(&flag_key).await?.is_some() {
            let delay = self.policy.remainder(now);
            debug!(%key, ?delay, "admit: rate flag set, deferring");
            return Ok(Admission::AdmittedDelayed { delay });
        }

        // The increment alone decides; concurrent replicas each get a distinct count
        let count = self
            .store
            .incr_with_ttl(&self.keys.window_counter(&key, window_id), self.policy.window)
            .await?;

        if count as u64 > self.policy.per_window {
            let delay = self.policy.remainder(now);
            self.store.set(&flag_key, "1", Some(delay)).await?;
            info!(%key, count, window_id, ?delay, "admit: window cap exceeded, flag set");
            return Ok(Admission::AdmittedDelayed { delay });
        }

        debug!(%key, count, window_id, "admit: admitted");
        Ok(Admission::Admitted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::StoreError;
    use keystore::{ManualClock, MemoryStore};

    const MINUTE_START: i64 = 1_700_000_040_000; // window-aligned for 60s

    fn controller(per_window: u64) -> (RateAdmissionController, MemoryStore, ManualClock) {
        let clock = ManualClock::new(MINUTE_START);
        let backend = MemoryStore::with_clock(Arc::new(clock.clone()));
        let store = StoreClient::spawn(backend.clone()).unwrap();
        let policy = RatePolicy {
            window: Duration::from_secs(60),
            per_window,
        };
        let controller = RateAdmissionController::new(store, KeySpace::new("t"), policy, Arc::new(clock.clone()));
        (controller, backend, clock)
    }

    #[test]
    fn test_window_math() {
        let policy = RatePolicy::default();
        assert_eq!(policy.window_id(MINUTE_START) * 60_000, MINUTE_START);
        assert_eq!(policy.remainder(MINUTE_START), Duration::from_secs(60));
        assert_eq!(policy.remainder(MINUTE_START + 59_999), Duration::from_millis(1));
        assert_eq!(policy.window_id(MINUTE_START + 60_000), policy.window_id(MINUTE_START) + 1);
    }

    #[tokio::test]
    async fn test_cap_then_delay_until_window_end() {
        let (controller, _, clock) = controller(3);

        for _ in 0..3 {
            assert_eq!(controller.admit("123").await.unwrap(), Admission::Admitted);
        }

        clock.advance(Duration::from_secs(15));
        assert_eq!(
            controller.admit("123").await.unwrap(),
            Admission::AdmittedDelayed {
                delay: Duration::from_secs(45)
            }
        );

        // Flag path uses the same delay formula
        clock.advance(Duration::from_secs(5));
        assert_eq!(
            controller.admit("123").await.unwrap(),
            Admission::AdmittedDelayed {
                delay: Duration::from_secs(40)
            }
        );
    }

    #[tokio::test]
    async fn test_next_window_admits_again() {
        let (controller, _, clock) = controller(1);

        assert_eq!(controller.admit("a").await.unwrap(), Admission::Admitted);
        assert!(matches!(
            controller.admit("a").await.unwrap(),
            Admission::AdmittedDelayed { .. }
        ));

        clock.advance(Duration::from_secs(60));
        assert_eq!(controller.admit("a").await.unwrap(), Admission::Admitted);
    }

    #[tokio::test]
    async fn test_keys_are_independent() {
        let (controller, _, _) = controller(1);

        assert_eq!(controller.admit("a").await.unwrap(), Admission::Admitted);
        assert_eq!(controller.admit("b").await.unwrap(), Admission::Admitted);
        assert!(matches!(
            controller.admit("a").await.unwrap(),
            Admission::AdmittedDelayed { .. }
        ));
    }

    #[tokio::test]
    async fn test_invalid_key_rejected_without_touching_store() {
        let (controller, backend, _) = controller(1);

        assert!(matches!(
            controller.admit("").await.unwrap(),
            Admission::Rejected { .. }
        ));
        assert!(matches!(
            controller.admit("two words").await.unwrap(),
            Admission::Rejected { .. }
        ));
        assert!(backend.is_empty());
    }

    #[tokio::test]
    async fn test_outage_fails_closed() {
        let (controller, backend, _) = controller(20);

        backend.set_available(false);
        let err = controller.admit("123").await.unwrap_err();
        assert!(matches!(err, StoreError::Unavailable(_)));
    }

    #[tokio::test]
    async fn test_concurrent_admissions_never_exceed_cap() {
        let (controller, _, _) = controller(20);

        let handles: Vec<_> = (0..100)
            .map(|_| {
                let controller = controller.clone();
                tokio::spawn(async move { controller.admit("123").await.unwrap() })
            })
            .collect();

        let mut admitted = 0;
        for handle in handles {
            if handle.await.unwrap() == Admission::Admitted {
                admitted += 1;
            }
        }
        assert_eq!(admitted, 20);
    }
}
