//! Health Check and Metrics Endpoint
//!
//! HTTP endpoint for health checks, session counts, and Prometheus metrics.
//!
//! # Endpoints
//!
//! - `GET /health` - JSON health status
//! - `GET /healthz` - liveness probe (simple OK)
//! - `GET /readyz` - readiness probe (gRPC listener is serving)
//! - `GET /metrics` - Prometheus metrics in text format

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::{Json, Router, extract::State, http::StatusCode, response::IntoResponse, routing::get};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::application::admission::ConnectionManager;
use crate::infrastructure::lifecycle::ServerStatus;
use crate::infrastructure::metrics::get_metrics_handle;

// =============================================================================
// Health Response Types
// =============================================================================

/// Health check response.
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    /// Overall status.
    pub status: HealthStatus,
    /// Server version.
    pub version: String,
    /// Process uptime in seconds.
    pub uptime_secs: u64,
    /// Current time.
    pub current_time: DateTime<Utc>,
    /// Admission state.
    pub sessions: SessionStatus,
    /// Listener state.
    pub listener: ListenerStatus,
}

/// Overall health status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// Serving and accepting sessions.
    Healthy,
    /// Serving, but every admission slot is taken.
    Degraded,
    /// The gRPC listener is down.
    Unhealthy,
}

/// Admitted sessions against the threshold.
#[derive(Debug, Clone, Serialize)]
pub struct SessionStatus {
    /// Currently admitted sessions.
    pub active: usize,
    /// Admission threshold.
    pub threshold: usize,
}

/// gRPC listener state.
#[derive(Debug, Clone, Serialize)]
pub struct ListenerStatus {
    /// Whether a generation is accepting connections.
    pub serving: bool,
    /// Current generation number.
    pub generation: u64,
    /// Restarts since startup.
    pub restarts: u64,
    /// Bound address, once known.
    pub address: Option<String>,
}

// =============================================================================
// Health Server State
// =============================================================================

/// Shared state for the health server.
pub struct HealthServerState {
    version: String,
    started_at: Instant,
    admission: Arc<ConnectionManager>,
    status: Arc<ServerStatus>,
}

impl HealthServerState {
    /// Create new health server state.
    #[must_use]
    pub fn new(
        version: String,
        admission: Arc<ConnectionManager>,
        status: Arc<ServerStatus>,
    ) -> Self {
        Self {
            version,
            started_at: Instant::now(),
            admission,
            status,
        }
    }
}

// =============================================================================
// Health Server
// =============================================================================

/// Health check HTTP server.
pub struct HealthServer {
    port: u16,
    state: Arc<HealthServerState>,
    cancel: CancellationToken,
}

impl HealthServer {
    /// Create a new health server.
    #[must_use]
    pub const fn new(port: u16, state: Arc<HealthServerState>, cancel: CancellationToken) -> Self {
        Self {
            port,
            state,
            cancel,
        }
    }

    /// Run the health server until cancelled.
    ///
    /// # Errors
    ///
    /// Returns `HealthServerError` if binding fails or the HTTP server
    /// encounters a fatal error while running.
    pub async fn run(self) -> Result<(), HealthServerError> {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| HealthServerError::BindFailed(self.port, e.to_string()))?;

        tracing::info!(port = self.port, "Health server listening");

        axum::serve(listener, router(self.state))
            .with_graceful_shutdown(self.cancel.cancelled_owned())
            .await
            .map_err(|e| HealthServerError::ServerFailed(e.to_string()))?;

        tracing::info!("Health server stopped");
        Ok(())
    }
}

fn router(state: Arc<HealthServerState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/healthz", get(liveness_handler))
        .route("/readyz", get(readiness_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}

// =============================================================================
// HTTP Handlers
// =============================================================================

async fn health_handler(State(state): State<Arc<HealthServerState>>) -> impl IntoResponse {
    let response = build_health_response(&state);
    let status_code = match response.status {
        HealthStatus::Healthy | HealthStatus::Degraded => StatusCode::OK,
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };
    (status_code, Json(response))
}

async fn liveness_handler() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

async fn readiness_handler(State(state): State<Arc<HealthServerState>>) -> impl IntoResponse {
    if state.status.is_serving() {
        (StatusCode::OK, "READY")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "NOT READY")
    }
}

async fn metrics_handler() -> impl IntoResponse {
    get_metrics_handle().map_or_else(
        || {
            (
                StatusCode::SERVICE_UNAVAILABLE,
                [("content-type", "text/plain")],
                "Metrics not initialized".to_string(),
            )
        },
        |handle| {
            (
                StatusCode::OK,
                [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
                handle.render(),
            )
        },
    )
}

fn build_health_response(state: &HealthServerState) -> HealthResponse {
    let sessions = SessionStatus {
        active: state.admission.active(),
        threshold: state.admission.threshold(),
    };
    let listener = ListenerStatus {
        serving: state.status.is_serving(),
        generation: state.status.generation(),
        restarts: state.status.restarts(),
        address: state.status.local_addr().map(|addr| addr.to_string()),
    };

    HealthResponse {
        status: determine_health_status(&sessions, &listener),
        version: state.version.clone(),
        uptime_secs: state.started_at.elapsed().as_secs(),
        current_time: Utc::now(),
        sessions,
        listener,
    }
}

const fn determine_health_status(sessions: &SessionStatus, listener: &ListenerStatus) -> HealthStatus {
    if !listener.serving {
        HealthStatus::Unhealthy
    } else if sessions.active >= sessions.threshold {
        HealthStatus::Degraded
    } else {
        HealthStatus::Healthy
    }
}

// =============================================================================
// Errors
// =============================================================================

/// Health server errors.
#[derive(Debug, thiserror::Error)]
pub enum HealthServerError {
    /// Failed to bind to port.
    #[error("failed to bind to port {0}: {1}")]
    BindFailed(u16, String),

    /// Server error.
    #[error("server error: {0}")]
    ServerFailed(String),
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use test_case::test_case;

    use super::*;
    use crate::infrastructure::registry::InMemoryRegistry;

    fn listener(serving: bool) -> ListenerStatus {
        ListenerStatus {
            serving,
            generation: 1,
            restarts: 0,
            address: None,
        }
    }

    #[test]
    fn health_status_serialization() {
        assert_eq!(
            serde_json::to_string(&HealthStatus::Healthy).unwrap(),
            "\"healthy\""
        );
        assert_eq!(
            serde_json::to_string(&HealthStatus::Unhealthy).unwrap(),
            "\"unhealthy\""
        );
    }

    #[test_case(0, 4, true => HealthStatus::Healthy ; "room left")]
    #[test_case(4, 4, true => HealthStatus::Degraded ; "threshold reached")]
    #[test_case(0, 4, false => HealthStatus::Unhealthy ; "listener down")]
    fn status_from_sessions_and_listener(active: usize, threshold: usize, serving: bool) -> HealthStatus {
        determine_health_status(&SessionStatus { active, threshold }, &listener(serving))
    }

    #[tokio::test]
    async fn response_reflects_admission() {
        let admission = Arc::new(ConnectionManager::new(2, Arc::new(InMemoryRegistry::new())));
        assert!(admission.add("10.0.0.1:5000|OTHERS|proc|uptime|STREAM").await);

        let state = HealthServerState::new(
            "1.2.3".to_string(),
            Arc::clone(&admission),
            Arc::new(ServerStatus::new()),
        );
        let response = build_health_response(&state);

        assert_eq!(response.sessions.active, 1);
        assert_eq!(response.sessions.threshold, 2);
        assert_eq!(response.version, "1.2.3");
        assert!(!response.listener.serving);
        assert_eq!(response.status, HealthStatus::Unhealthy);
    }
}
