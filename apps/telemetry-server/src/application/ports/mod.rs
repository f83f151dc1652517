//! Port Interfaces
//!
//! Defines the interfaces (ports) the application layer depends on, following
//! the Hexagonal Architecture pattern. Infrastructure adapters implement them.
//!
//! ## Driven Ports (Outbound)
//!
//! - `Producer` / `ProducerFactory`: sources of telemetry values for a session
//! - `RegistryStore`: external hash map mirroring admitted connections
//! - `CertEvent` stream: filesystem changes to the server credentials
//!
//! ## Driver Ports (Inbound)
//!
//! - `RequestStream` / `ResponseSink`: the two halves of a subscribe stream

mod producer_port;
mod registry_port;
mod stream_port;
mod watch_port;

pub use producer_port::{Producer, ProducerError, ProducerFactory, SessionQueue};
#[cfg(test)]
pub use registry_port::MockRegistryStore;
pub use registry_port::{RegistryError, RegistryStore};
pub use stream_port::{RequestStream, ResponseSink};
pub use watch_port::{CertEvent, WatchError};
