//! gRPC Subscribe Service
//!
//! Hosts the gNMI `Subscribe` RPC. Each call becomes one [`Session`]: the
//! tonic request stream and an mpsc-backed response stream are adapted to
//! the session's stream ports, and the session's terminal error is sent as
//! the final item of the response stream.
//!
//! [`Session`]: crate::application::session::Session

pub mod server;
pub mod stream;

// Allow clippy warnings and missing docs in generated code
#[allow(
    missing_docs,
    clippy::all,
    clippy::pedantic,
    clippy::nursery,
    clippy::unwrap_used,
    clippy::expect_used
)]
pub mod proto {
    pub mod gnmi {
        include!("../../../../../packages/schema-gen/rust/gnmi/gnmi.rs");
    }
}

pub use server::TelemetryServer;
