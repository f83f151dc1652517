//! Configuration Module
//!
//! Configuration loading for the telemetry server.

mod settings;

pub use settings::{ConfigError, ServerConfig, TlsMode, TlsSettings};
