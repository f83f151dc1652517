//! Infrastructure Layer - Adapters and external integrations.
//!
//! This layer contains the concrete implementations of the port interfaces
//! defined in the application layer, plus the process plumbing around them.

/// Environment configuration.
pub mod config;

/// gNMI service and stream adapters.
pub mod grpc;

/// Health check HTTP endpoint.
pub mod health;

/// Server generations, restarts, and shutdown.
pub mod lifecycle;

/// Prometheus metrics instrumentation.
pub mod metrics;

/// Built-in telemetry producers.
pub mod producers;

/// Connection registry stores.
pub mod registry;

/// OpenTelemetry tracing integration.
pub mod telemetry;

/// Server credentials.
pub mod tls;

/// Certificate file watching.
pub mod watcher;
