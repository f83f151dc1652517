//! Built-in Producers
//!
//! [`ProducerRegistry`] is the default [`ProducerFactory`]: it maps each
//! [`ProducerKind`] to an optional constructor. Kinds without one are
//! reported as unavailable, which the session turns into `NotFound`.

mod system_stats;

use std::collections::HashMap;
use std::sync::Arc;

pub use system_stats::{SystemStatsConfig, SystemStatsProducer};

use crate::application::ports::{Producer, ProducerError, ProducerFactory};
use crate::domain::subscription::{ParsedSubscription, ProducerKind};

type Constructor =
    Box<dyn Fn(&ParsedSubscription) -> Result<Arc<dyn Producer>, ProducerError> + Send + Sync>;

/// Producer constructors by kind.
#[derive(Default)]
pub struct ProducerRegistry {
    constructors: HashMap<ProducerKind, Constructor>,
}

impl ProducerRegistry {
    /// Create a registry with no producers.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry serving `OTHERS` from host statistics.
    #[must_use]
    pub fn with_system_stats(config: SystemStatsConfig) -> Self {
        Self::new().with(ProducerKind::NonDb, move |subscription| {
            SystemStatsProducer::new(config.clone(), subscription)
                .map(|p| Arc::new(p) as Arc<dyn Producer>)
        })
    }

    /// Register (or replace) the constructor for `kind`.
    #[must_use]
    pub fn with<F>(mut self, kind: ProducerKind, constructor: F) -> Self
    where
        F: Fn(&ParsedSubscription) -> Result<Arc<dyn Producer>, ProducerError>
            + Send
            + Sync
            + 'static,
    {
        self.constructors.insert(kind, Box::new(constructor));
        self
    }

    /// Whether a constructor is registered for `kind`.
    #[must_use]
    pub fn supports(&self, kind: ProducerKind) -> bool {
        self.constructors.contains_key(&kind)
    }
}

impl std::fmt::Debug for ProducerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProducerRegistry")
            .field("kinds", &self.constructors.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl ProducerFactory for ProducerRegistry {
    fn create(
        &self,
        kind: ProducerKind,
        subscription: &ParsedSubscription,
    ) -> Result<Arc<dyn Producer>, ProducerError> {
        let constructor = self
            .constructors
            .get(&kind)
            .ok_or(ProducerError::Unavailable(kind.as_str()))?;
        constructor(subscription)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::{Path, SubscribeRequest, Subscription, SubscriptionList, subscribe_request};

    fn subscription(target: &str, path: &[&str]) -> ParsedSubscription {
        let request = SubscribeRequest {
            request: Some(subscribe_request::Request::Subscribe(SubscriptionList {
                prefix: Some(Path {
                    target: target.to_string(),
                    ..Default::default()
                }),
                subscription: vec![Subscription {
                    path: Some(Path {
                        element: path.iter().map(ToString::to_string).collect(),
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
    fn unregistered_kind_is_unavailable() {
        let registry = ProducerRegistry::with_system_stats(SystemStatsConfig::default());
        let sub = subscription("COUNTERS_DB", &["COUNTERS", "Ethernet0"]);

        assert!(!registry.supports(ProducerKind::Db));
        let err = registry.create(sub.producer_kind(), &sub).err().unwrap();
        assert_eq!(err, ProducerError::Unavailable("db"));
    }

    #[test]
    fn others_target_gets_system_stats() {
        let registry = ProducerRegistry::with_system_stats(SystemStatsConfig::default());
        let sub = subscription("OTHERS", &["proc", "uptime"]);

        assert!(registry.supports(ProducerKind::NonDb));
        assert!(registry.create(sub.producer_kind(), &sub).is_ok());
    }

    #[test]
    fn unknown_others_path_is_rejected() {
        let registry = ProducerRegistry::with_system_stats(SystemStatsConfig::default());
        let sub = subscription("OTHERS", &["platform", "fan"]);

        let err = registry.create(sub.producer_kind(), &sub).err().unwrap();
        assert!(matches!(err, ProducerError::InvalidPath(_)));
    }
}
