//! Producer Port (Driven Port)
//!
//! Interface for the data sources that fill a session's delivery queue.
//!
//! A session runs exactly one of the `*_run` methods on its own task. The run
//! method returning is the completion signal the session waits for, so an
//! implementation must return promptly once its control signal ends:
//!
//! - STREAM: `stop` is cancelled
//! - POLL / ONCE: the token channel yields `None`

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::domain::queue::DeliveryQueue;
use crate::domain::streaming::{DeliveryItem, Value};
use crate::domain::subscription::{ParsedSubscription, ProducerKind};

/// The queue type shared between a session and its producer.
pub type SessionQueue = DeliveryQueue<DeliveryItem>;

/// A source of telemetry values for one session.
#[async_trait]
pub trait Producer: Send + Sync {
    /// Push values continuously until `stop` is cancelled.
    async fn stream_run(
        &self,
        queue: Arc<SessionQueue>,
        stop: CancellationToken,
        subscription: &ParsedSubscription,
    );

    /// Produce one complete batch per token received on `polls`.
    async fn poll_run(
        &self,
        queue: Arc<SessionQueue>,
        polls: mpsc::Receiver<()>,
        subscription: &ParsedSubscription,
    );

    /// Produce one complete batch after the single token on `once`.
    async fn once_run(
        &self,
        queue: Arc<SessionQueue>,
        once: mpsc::Receiver<()>,
        subscription: &ParsedSubscription,
    );

    /// A value was written to the client.
    fn sent_one(&self, value: &Value);

    /// Writing to the client failed.
    fn failed_send(&self);

    /// Release producer resources. Called after the run method returned.
    fn close(&self);
}

/// Creates producers for parsed subscriptions.
pub trait ProducerFactory: Send + Sync {
    /// Create the producer of `kind` for `subscription`.
    ///
    /// # Errors
    ///
    /// Returns `ProducerError` if no producer can serve the subscription.
    fn create(
        &self,
        kind: ProducerKind,
        subscription: &ParsedSubscription,
    ) -> Result<Arc<dyn Producer>, ProducerError>;
}

/// Producer creation errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProducerError {
    /// No producer of this kind is available in this process.
    #[error("no {0} producer available")]
    Unavailable(&'static str),

    /// The producer does not serve a requested path.
    #[error("invalid path: {0}")]
    InvalidPath(String),

    /// The producer's backing source failed.
    #[error("producer backend error: {0}")]
    Backend(String),
}
