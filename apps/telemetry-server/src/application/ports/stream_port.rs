//! Stream Ports (Driver Ports)
//!
//! The two halves of a bidirectional subscribe stream as a session sees them.

use async_trait::async_trait;
use tonic::Status;

use crate::proto::{SubscribeRequest, SubscribeResponse};

/// Client-to-server half of a subscribe stream.
#[async_trait]
pub trait RequestStream: Send {
    /// Next client message, `None` at end of input.
    async fn recv(&mut self) -> Result<Option<SubscribeRequest>, Status>;
}

/// Server-to-client half of a subscribe stream.
#[async_trait]
pub trait ResponseSink: Send + Sync {
    /// Write one response.
    async fn send(&self, response: SubscribeResponse) -> Result<(), Status>;

    /// Resolves once the client is no longer reading the stream.
    async fn closed(&self);
}
