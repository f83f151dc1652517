//! Connection Registry Adapters
//!
//! Implementations of [`RegistryStore`]:
//!
//! - [`RedisRegistry`]: hash fields in a redis table, visible to other
//!   processes on the host
//! - [`InMemoryRegistry`]: process-local map, used when no registry URL is
//!   configured

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::Mutex;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;

use crate::application::ports::{RegistryError, RegistryStore};

/// Hash table holding the admitted connection keys.
pub const CONNECTIONS_TABLE: &str = "TELEMETRY_CONNECTIONS";

// =============================================================================
// Redis
// =============================================================================

/// Registry backed by a redis hash.
#[derive(Clone)]
pub struct RedisRegistry {
    connection: ConnectionManager,
    table: String,
}

impl RedisRegistry {
    /// Connect to the redis server at `url` (database index in the path).
    ///
    /// # Errors
    ///
    /// Returns `RegistryError::Connection` if the URL is invalid or the server
    /// cannot be reached.
    pub async fn connect(url: &str) -> Result<Self, RegistryError> {
        let client =
            redis::Client::open(url).map_err(|e| RegistryError::Connection(e.to_string()))?;
        let connection = client
            .get_connection_manager()
            .await
            .map_err(|e| RegistryError::Connection(e.to_string()))?;

        tracing::info!(table = CONNECTIONS_TABLE, "Connected to connection registry");
        Ok(Self {
            connection,
            table: CONNECTIONS_TABLE.to_string(),
        })
    }
}

fn command_error(e: &redis::RedisError) -> RegistryError {
    if e.is_io_error() || e.is_connection_dropped() || e.is_connection_refusal() {
        RegistryError::Connection(e.to_string())
    } else {
        RegistryError::Command(e.to_string())
    }
}

#[async_trait]
impl RegistryStore for RedisRegistry {
    async fn set_field(&self, field: &str, value: &str) -> Result<(), RegistryError> {
        let mut conn = self.connection.clone();
        conn.hset::<_, _, _, ()>(&self.table, field, value)
            .await
            .map_err(|e| command_error(&e))
    }

    async fn delete_field(&self, field: &str) -> Result<bool, RegistryError> {
        let mut conn = self.connection.clone();
        let removed: u64 = conn
            .hdel(&self.table, field)
            .await
            .map_err(|e| command_error(&e))?;
        Ok(removed > 0)
    }

    async fn fields(&self) -> Result<Vec<String>, RegistryError> {
        let mut conn = self.connection.clone();
        conn.hkeys(&self.table).await.map_err(|e| command_error(&e))
    }
}

// =============================================================================
// In-memory
// =============================================================================

/// Process-local registry.
#[derive(Debug, Default)]
pub struct InMemoryRegistry {
    fields: Mutex<HashMap<String, String>>,
}

impl InMemoryRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of fields.
    #[must_use]
    pub fn len(&self) -> usize {
        self.fields.lock().len()
    }

    /// Whether the registry holds no fields.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.fields.lock().is_empty()
    }

    /// Value stored under `field`.
    #[must_use]
    pub fn get(&self, field: &str) -> Option<String> {
        self.fields.lock().get(field).cloned()
    }
}

#[async_trait]
impl RegistryStore for InMemoryRegistry {
    async fn set_field(&self, field: &str, value: &str) -> Result<(), RegistryError> {
        self.fields
            .lock()
            .insert(field.to_string(), value.to_string());
        Ok(())
    }

    async fn delete_field(&self, field: &str) -> Result<bool, RegistryError> {
        Ok(self.fields.lock().remove(field).is_some())
    }

    async fn fields(&self) -> Result<Vec<String>, RegistryError> {
        let mut fields: Vec<String> = self.fields.lock().keys().cloned().collect();
        fields.sort();
        Ok(fields)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn in_memory_set_delete_list() {
        let registry = InMemoryRegistry::new();
        assert!(registry.is_empty());

        registry.set_field("b", "active").await.unwrap();
        registry.set_field("a", "active").await.unwrap();
        registry.set_field("a", "active").await.unwrap();

        assert_eq!(registry.len(), 2);
        assert_eq!(registry.get("a").as_deref(), Some("active"));
        assert_eq!(registry.fields().await.unwrap(), vec!["a", "b"]);

        assert!(registry.delete_field("a").await.unwrap());
        assert!(!registry.delete_field("a").await.unwrap());
        assert_eq!(registry.fields().await.unwrap(), vec!["b"]);
    }

    #[tokio::test]
    async fn redis_rejects_invalid_url() {
        let err = RedisRegistry::connect("not-a-redis-url").await.err().unwrap();
        assert!(matches!(err, RegistryError::Connection(_)));
    }
}
