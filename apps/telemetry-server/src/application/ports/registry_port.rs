//! Registry Port (Driven Port)
//!
//! Interface for the external hash map that mirrors admitted connections.
//! Every operation addresses one fixed table chosen by the adapter.

use async_trait::async_trait;

/// External key/value hash map of connection keys.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RegistryStore: Send + Sync {
    /// Set `field` to `value`.
    async fn set_field(&self, field: &str, value: &str) -> Result<(), RegistryError>;

    /// Delete `field`. Returns whether it existed.
    async fn delete_field(&self, field: &str) -> Result<bool, RegistryError>;

    /// List every field in the table.
    async fn fields(&self) -> Result<Vec<String>, RegistryError>;
}

/// Registry errors.
#[derive(Debug, Clone, thiserror::Error)]
pub enum RegistryError {
    /// The store could not be reached.
    #[error("registry connection error: {0}")]
    Connection(String),

    /// The store rejected a command.
    #[error("registry command failed: {0}")]
    Command(String),
}
