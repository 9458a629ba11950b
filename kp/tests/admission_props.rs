//! Property tests for the per-window admission cap

use std::sync::Arc;
use std::time::Duration;

use keypace::{Admission, KeySpace, RateAdmissionController, RatePolicy, StoreClient};
use keystore::{ManualClock, MemoryStore};
use proptest::prelude::*;

const MINUTE_START: i64 = 1_700_000_040_000;

fn controller(per_window: u64, clock: &ManualClock) -> RateAdmissionController {
    let store = StoreClient::spawn(MemoryStore::with_clock(Arc::new(clock.clone()))).unwrap();
    let policy = RatePolicy {
        window: Duration::from_secs(60),
        per_window,
    };
    RateAdmissionController::new(store, KeySpace::new("prop"), policy, Arc::new(clock.clone()))
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    /// Within one window exactly min(requests, cap) are admitted and the rest deferred
    #[test]
    fn admitted_never_exceeds_cap(per_window in 1u64..30, requests in 0usize..60, offset_ms in 0i64..59_000) {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let (admitted, delays) = runtime.block_on(async {
            let clock = ManualClock::new(MINUTE_START + offset_ms);
            let controller = controller(per_window, &clock);
            let mut admitted = 0u64;
            let mut delays = Vec::new();
            for _ in 0..requests {
                match controller.admit("123").await.unwrap() {
                    Admission::Admitted => admitted += 1,
                    Admission::AdmittedDelayed { delay } => delays.push(delay),
                    Admission::Rejected { reason } => panic!("rejected: {}", reason),
                }
                clock.advance(Duration::from_millis(10));
            }
            (admitted, delays)
        });

        prop_assert_eq!(admitted, (requests as u64).min(per_window));
        prop_assert_eq!(delays.len() as u64, (requests as u64).saturating_sub(per_window));
        for delay in delays {
            prop_assert!(delay > Duration::ZERO && delay <= Duration::from_secs(60));
        }
    }

    /// Concurrent callers on one key still admit exactly the cap
    #[test]
    fn concurrent_admissions_respect_cap(per_window in 1u64..25, requests in 1usize..50) {
        let runtime = tokio::runtime::Builder::new_multi_thread().worker_threads(4).enable_all().build().unwrap();
        let admitted = runtime.block_on(async {
            let clock = ManualClock::new(MINUTE_START);
            let controller = controller(per_window, &clock);
            let handles: Vec<_> = (0..requests)
                .map(|_| {
                    let controller = controller.clone();
                    tokio::spawn(async move { controller.admit("123").await })
                })
                .collect();
            let mut admitted = 0u64;
            for handle in handles {
                if handle.await.unwrap().unwrap() == Admission::Admitted {
                    admitted += 1;
                }
            }
            admitted
        });

        prop_assert_eq!(admitted, (requests as u64).min(per_window));
    }
}
