//! Connection Admission
//!
//! Limits the number of concurrent sessions and mirrors every admitted
//! session's key into an external registry table.
//!
//! # Consistency
//!
//! The in-memory set is the source of truth for the threshold check; all
//! mutations go through one mutex that is never held across registry I/O.
//! A key is written to the registry only after it is in the set, and is
//! deleted from the registry before it leaves the set, so the registry never
//! holds more entries than the set.
//!
//! Registry failures are logged and counted but never block a session.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, SecondsFormat, Utc};
use parking_lot::Mutex;

use super::ports::{RegistryError, RegistryStore};
use crate::domain::subscription::ParsedSubscription;
use crate::infrastructure::metrics::{self, Counter};

/// Value stored for each admitted connection.
pub const ACTIVE_MARKER: &str = "active";

/// Process-wide admission controller.
pub struct ConnectionManager {
    connections: Mutex<HashSet<String>>,
    threshold: usize,
    registry: Arc<dyn RegistryStore>,
}

impl ConnectionManager {
    /// Create a controller. A `threshold` of 0 admits without limit.
    #[must_use]
    pub fn new(threshold: usize, registry: Arc<dyn RegistryStore>) -> Self {
        Self {
            connections: Mutex::new(HashSet::new()),
            threshold,
            registry,
        }
    }

    /// Build the registry key for a connection attempt.
    ///
    /// Looks like `10.0.0.1:5000|OTHERS|proc|uptime|STREAM|2024-07-04T00:47:20.123456789Z`.
    #[must_use]
    pub fn connection_key(
        peer: &str,
        subscription: &ParsedSubscription,
        at: DateTime<Utc>,
    ) -> String {
        format!(
            "{peer}|{}|{}",
            subscription.fingerprint(),
            at.to_rfc3339_opts(SecondsFormat::Nanos, true)
        )
    }

    /// Admit a session, returning its key, or `None` at capacity.
    pub async fn admit(&self, peer: &str, subscription: &ParsedSubscription) -> Option<String> {
        let key = Self::connection_key(peer, subscription, Utc::now());
        self.add(&key).await.then_some(key)
    }

    /// Add `key` if below the threshold and not already present. Returns
    /// whether it was admitted.
    pub async fn add(&self, key: &str) -> bool {
        {
            let mut connections = self.connections.lock();
            if self.threshold != 0 && connections.len() >= self.threshold {
                tracing::warn!(
                    key,
                    active = connections.len(),
                    threshold = self.threshold,
                    "Connection rejected, server at capacity"
                );
                metrics::increment(Counter::AdmissionRejected);
                return false;
            }
            if !connections.insert(key.to_string()) {
                tracing::warn!(key, "Connection key already admitted");
                return false;
            }
            metrics::set_active_sessions(connections.len());
        }

        if let Err(e) = self.registry.set_field(key, ACTIVE_MARKER).await {
            tracing::warn!(key, error = %e, "Failed to record connection in registry");
            metrics::increment(Counter::RegistryError);
        }

        tracing::debug!(key, "Connection admitted");
        true
    }

    /// Remove `key`. Returns whether it was present.
    pub async fn remove(&self, key: &str) -> bool {
        if !self.connections.lock().contains(key) {
            return false;
        }

        if let Err(e) = self.registry.delete_field(key).await {
            tracing::warn!(key, error = %e, "Failed to delete connection from registry");
            metrics::increment(Counter::RegistryError);
        }

        let mut connections = self.connections.lock();
        let removed = connections.remove(key);
        metrics::set_active_sessions(connections.len());
        drop(connections);

        if removed {
            tracing::debug!(key, "Connection released");
        }
        removed
    }

    /// Delete every entry in the registry table.
    ///
    /// Run once at startup; entries left by a previous process are stale.
    ///
    /// # Errors
    ///
    /// Returns the first registry error encountered.
    pub async fn reset(&self) -> Result<usize, RegistryError> {
        let fields = self.registry.fields().await?;
        let mut deleted = 0;
        for field in &fields {
            if self.registry.delete_field(field).await? {
                deleted += 1;
            }
        }
        tracing::info!(deleted, "Connection registry reset");
        Ok(deleted)
    }

    /// Number of admitted connections.
    #[must_use]
    pub fn active(&self) -> usize {
        self.connections.lock().len()
    }

    /// Configured threshold, 0 meaning unlimited.
    #[must_use]
    pub const fn threshold(&self) -> usize {
        self.threshold
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::ports::MockRegistryStore;
    use crate::infrastructure::registry::InMemoryRegistry;
    use crate::proto::{Path, SubscribeRequest, Subscription, SubscriptionList, subscribe_request};

    fn manager(threshold: usize) -> (ConnectionManager, Arc<InMemoryRegistry>) {
        let registry = Arc::new(InMemoryRegistry::new());
        (
            ConnectionManager::new(threshold, Arc::clone(&registry) as Arc<dyn RegistryStore>),
            registry,
        )
    }

    fn subscription() -> ParsedSubscription {
        let request = SubscribeRequest {
            request: Some(subscribe_request::Request::Subscribe(SubscriptionList {
                prefix: Some(Path {
                    target: "OTHERS".to_string(),
                    ..Default::default()
                }),
                subscription: vec![Subscription {
                    path: Some(Path {
                        element: vec!["proc".to_string(), "uptime".to_string()],
                        ..Default::default()
                    }),
                    ..Default::default()
                }],
                ..Default::default()
            })),
        };
        ParsedSubscription::from_request(&request).unwrap()
    }

    #[test]
    fn connection_key_format() {
        let at = DateTime::parse_from_rfc3339("2017-07-04T00:47:20.5Z")
            .unwrap()
            .with_timezone(&Utc);
        let key = ConnectionManager::connection_key("10.0.0.1:5000", &subscription(), at);
        assert_eq!(
            key,
            "10.0.0.1:5000|OTHERS|proc|uptime|STREAM|2017-07-04T00:47:20.500000000Z"
        );
    }

    #[tokio::test]
    async fn add_respects_threshold() {
        let (manager, registry) = manager(2);

        assert!(manager.add("a").await);
        assert!(manager.add("b").await);
        assert!(!manager.add("c").await);

        assert_eq!(manager.active(), 2);
        let mut fields = registry.fields().await.unwrap();
        fields.sort();
        assert_eq!(fields, vec!["a".to_string(), "b".to_string()]);
    }

    #[tokio::test]
    async fn zero_threshold_is_unlimited() {
        let (manager, registry) = manager(0);
        for i in 0..500 {
            assert!(manager.add(&format!("k{i}")).await);
        }
        assert_eq!(manager.active(), 500);
        assert_eq!(registry.len(), 500);
    }

    #[tokio::test]
    async fn remove_restores_state_and_is_idempotent() {
        let (manager, registry) = manager(1);

        assert!(manager.add("a").await);
        assert!(manager.remove("a").await);
        assert!(!manager.remove("a").await);

        assert_eq!(manager.active(), 0);
        assert!(registry.is_empty());
        assert!(manager.add("b").await);
    }

    #[tokio::test]
    async fn admit_returns_distinct_keys_for_identical_subscriptions() {
        let (manager, _registry) = manager(0);
        let sub = subscription();

        let first = manager.admit("peer", &sub).await.unwrap();
        let second = manager.admit("peer", &sub).await.unwrap();

        assert_ne!(first, second);
        assert_eq!(manager.active(), 2);
    }

    #[tokio::test]
    async fn admit_at_capacity_creates_no_entry() {
        let (manager, registry) = manager(1);
        let sub = subscription();

        assert!(manager.admit("peer-1", &sub).await.is_some());
        assert!(manager.admit("peer-2", &sub).await.is_none());

        let fields = registry.fields().await.unwrap();
        assert_eq!(fields.len(), 1);
        assert!(fields[0].starts_with("peer-1|"));
    }

    #[tokio::test]
    async fn reset_clears_stale_entries() {
        let (manager, registry) = manager(0);
        registry.set_field("stale-1", "active").await.unwrap();
        registry.set_field("stale-2", "active").await.unwrap();

        assert_eq!(manager.reset().await.unwrap(), 2);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn registry_failures_fail_open() {
        let mut registry = MockRegistryStore::new();
        registry
            .expect_set_field()
            .times(1)
            .returning(|_, _| Err(RegistryError::Connection("refused".to_string())));
        registry
            .expect_delete_field()
            .times(1)
            .returning(|_| Err(RegistryError::Connection("refused".to_string())));
        let manager = ConnectionManager::new(1, Arc::new(registry));

        assert!(manager.add("a").await);
        assert!(!manager.add("b").await);
        assert!(manager.remove("a").await);
        assert_eq!(manager.active(), 0);
    }

    #[tokio::test]
    async fn duplicate_key_is_not_admitted_twice() {
        let mut registry = MockRegistryStore::new();
        registry
            .expect_set_field()
            .times(1)
            .returning(|_, _| Ok(()));
        let manager = ConnectionManager::new(0, Arc::new(registry));

        assert!(manager.add("key-1").await);
        assert!(!manager.add("key-1").await);
        assert_eq!(manager.active(), 1);
    }

    #[tokio::test]
    async fn registry_receives_active_marker() {
        let mut registry = MockRegistryStore::new();
        registry
            .expect_set_field()
            .withf(|field, value| field == "key-1" && value == ACTIVE_MARKER)
            .times(1)
            .returning(|_, _| Ok(()));
        let manager = ConnectionManager::new(0, Arc::new(registry));

        assert!(manager.add("key-1").await);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn concurrent_adds_never_exceed_threshold() {
        let (manager, registry) = manager(5);
        let manager = Arc::new(manager);

        let handles: Vec<_> = (0..64)
            .map(|i| {
                let manager = Arc::clone(&manager);
                tokio::spawn(async move { manager.add(&format!("key-{i}")).await })
            })
            .collect();

        let mut admitted = 0;
        for handle in handles {
            if handle.await.unwrap() {
                admitted += 1;
            }
        }

        assert_eq!(admitted, 5);
        assert_eq!(manager.active(), 5);
        assert_eq!(registry.len(), 5);
    }
}
