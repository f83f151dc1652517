//! Application Layer - Sessions, admission, and certificate rotation.
//!
//! This layer drives a subscription from its first request to teardown and
//! owns the process-wide state shared between sessions. It talks to the
//! outside world only through the traits in [`ports`].

/// Port interfaces for producers, the registry, streams, and file watching.
pub mod ports;

/// Per-stream subscription state machine.
pub mod session;

/// Connection admission against a threshold, mirrored to a registry.
pub mod admission;

/// Certificate change handling and server control signals.
pub mod rotation;
