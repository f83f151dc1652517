//! Domain Layer - Subscription, value, and queue types.
//!
//! This layer holds the types every session is built from: the parsed
//! subscription description, the telemetry values producers emit, and the
//! disposable priority queue that carries them to the send loop.

/// Parsed subscription descriptions and producer selection.
pub mod subscription;

/// Telemetry values and queue items.
pub mod streaming;

/// Disposable, bounded priority delivery queue.
pub mod queue;
