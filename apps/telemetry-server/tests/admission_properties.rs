//! Property-based tests for the admission controller.
//!
//! - Threshold: concurrent `add` calls never admit more than the threshold,
//!   and the registry mirrors exactly the admitted keys
//! - Release: `remove` after `add` restores the prior state; a second
//!   `remove` is a no-op

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::sync::Arc;

use proptest::prelude::*;
use telemetry_server::ConnectionManager;
use telemetry_server::InMemoryRegistry;

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(4)
        .enable_all()
        .build()
        .unwrap()
}

fn manager(threshold: usize) -> (Arc<ConnectionManager>, Arc<InMemoryRegistry>) {
    let registry = Arc::new(InMemoryRegistry::new());
    let manager = Arc::new(ConnectionManager::new(threshold, registry.clone()));
    (manager, registry)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn concurrent_admission_respects_threshold(threshold in 1_usize..=16, attempts in 0_usize..=64) {
        let rt = runtime();
        let (manager, registry) = manager(threshold);

        let admitted = rt.block_on(async {
            let handles: Vec<_> = (0..attempts)
                .map(|i| {
                    let manager = Arc::clone(&manager);
                    tokio::spawn(async move { manager.add(&format!("peer-{i}")).await })
                })
                .collect();

            let mut admitted = 0;
            for handle in handles {
                if handle.await.unwrap() {
                    admitted += 1;
                }
            }
            admitted
        });

        prop_assert_eq!(admitted, attempts.min(threshold));
        prop_assert_eq!(manager.active(), admitted);
        prop_assert_eq!(registry.len(), admitted);
    }

    #[test]
    fn unlimited_threshold_admits_everyone(attempts in 0_usize..=64) {
        let rt = runtime();
        let (manager, registry) = manager(0);

        rt.block_on(async {
            for i in 0..attempts {
                assert!(manager.add(&format!("peer-{i}")).await);
            }
        });

        prop_assert_eq!(registry.len(), attempts);
    }

    #[test]
    fn remove_restores_prior_state(existing in 0_usize..8, threshold in 8_usize..=16) {
        let rt = runtime();
        let (manager, registry) = manager(threshold);

        rt.block_on(async {
            for i in 0..existing {
                assert!(manager.add(&format!("existing-{i}")).await);
            }
        });
        let before = registry.len();

        let (first, second) = rt.block_on(async {
            assert!(manager.add("transient").await);
            (manager.remove("transient").await, manager.remove("transient").await)
        });

        prop_assert!(first);
        prop_assert!(!second);
        prop_assert_eq!(registry.len(), before);
        prop_assert_eq!(manager.active(), existing);
        prop_assert!(registry.get("transient").is_none());
    }
}
