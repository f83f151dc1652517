#![cfg_attr(
    test,
    allow(
        clippy::unwrap_used,
        clippy::expect_used,
        clippy::float_cmp,
        clippy::significant_drop_tightening,
        clippy::too_many_lines,
        clippy::needless_pass_by_value,
        clippy::default_trait_access,
        clippy::items_after_statements
    )
)]

//! Telemetry Server - gNMI Subscribe Service
//!
//! A gRPC server that accepts gNMI `Subscribe` streams, admits each one
//! against a connection threshold, and delivers telemetry values in STREAM,
//! POLL, or ONCE mode. The listener restarts in place when the server
//! certificate is rewritten and shuts down when it is removed.
//!
//! # Layers (inside → outside)
//!
//! - **Domain**: subscription parsing, telemetry values, the delivery queue
//!
//! - **Application**: use cases and port definitions
//!   - `session`: one subscribe stream from first request to teardown
//!   - `admission`: threshold plus external registry of live connections
//!   - `rotation`: certificate events to control signals
//!   - `ports`: producers, registry store, streams, file watching
//!
//! - **Infrastructure**: adapters and process plumbing
//!   - `grpc`: the gNMI service on tonic
//!   - `lifecycle`: listener generations, restart, shutdown
//!   - `producers`, `registry`, `watcher`, `tls`: port implementations
//!   - `config`, `health`, `metrics`, `telemetry`: ambient services
//!
//! # Data Flow
//!
//! ```text
//!                   ┌──────────────┐  put  ┌───────────────┐  get  ┌───────────┐
//! gNMI client ─────►│   Session    │──────►│ DeliveryQueue │──────►│ send loop │──► client
//!   (requests)      │ (recv task)  │       └───────────────┘       └───────────┘
//!                   └──────┬───────┘               ▲
//!                          │ poll / once tokens    │
//!                          ▼                       │
//!                   ┌──────────────┐               │
//!                   │   Producer   │───────────────┘
//!                   └──────────────┘
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]

// =============================================================================
// Module Declarations
// =============================================================================

/// Domain layer - Subscription, value, and queue types.
pub mod domain;

/// Application layer - Sessions, admission, rotation, and ports.
pub mod application;

/// Infrastructure layer - Adapters and external integrations.
pub mod infrastructure;

// =============================================================================
// Re-exports
// =============================================================================

// Generated gNMI types
pub use infrastructure::grpc::proto::gnmi as proto;

// Domain types
pub use domain::queue::{DeliveryQueue, QueueError};
pub use domain::streaming::{DeliveryItem, Value};
pub use domain::subscription::{DeliveryMode, ParsedSubscription, ProducerKind, SubscriptionError};

// Application services
pub use application::admission::ConnectionManager;
pub use application::rotation::{ControlSignal, RotationController, RotationOutcome};
pub use application::session::{Session, SessionError};

// Infrastructure config
pub use infrastructure::config::{ConfigError, ServerConfig, TlsMode, TlsSettings};

// gRPC server and lifecycle
pub use infrastructure::grpc::TelemetryServer;
pub use infrastructure::lifecycle::{
    BindRetryConfig, DriverConfig, ServerDriver, ServerError, ServerStatus,
};

// Health server
pub use infrastructure::health::{HealthServer, HealthServerError, HealthServerState};

// Producers and registries
pub use infrastructure::producers::{ProducerRegistry, SystemStatsConfig};
pub use infrastructure::registry::{InMemoryRegistry, RedisRegistry};

// Metrics
pub use infrastructure::metrics::init_metrics;

// Telemetry
pub use infrastructure::telemetry::{TelemetryConfig, TelemetryGuard, init as init_telemetry};
