//! Prometheus Metrics Module
//!
//! Exposes the server's counters in Prometheus format.
//!
//! # Hook Points
//!
//! Every place the server counts something names a [`Counter`] and calls
//! [`increment`]. Labelled and gauge metrics have their own recording
//! functions.
//!
//! # Integration
//!
//! Metrics are exposed at `/metrics` on the health server port. Before
//! [`init_metrics`] runs, recording is a no-op, which is what unit tests see.

use std::sync::OnceLock;
use std::time::Duration;

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};

// =============================================================================
// Global Metrics Handle
// =============================================================================

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Install the Prometheus recorder and describe the server's metrics.
///
/// Repeated calls return the handle installed by the first call.
///
/// # Errors
///
/// Returns `BuildError` if another global recorder is already installed.
pub fn init_metrics() -> Result<PrometheusHandle, BuildError> {
    if let Some(handle) = PROMETHEUS_HANDLE.get() {
        return Ok(handle.clone());
    }

    let handle = PrometheusBuilder::new().install_recorder()?;
    register_metrics();
    Ok(PROMETHEUS_HANDLE.get_or_init(|| handle).clone())
}

/// Get the Prometheus handle for rendering metrics.
///
/// Returns `None` if metrics have not been initialized.
#[must_use]
pub fn get_metrics_handle() -> Option<PrometheusHandle> {
    PROMETHEUS_HANDLE.get().cloned()
}

// =============================================================================
// Metric Registration
// =============================================================================

const SUBSCRIBE_FAILURES: &str = "telemetry_subscribe_failures_total";
const ACTIVE_SESSIONS: &str = "telemetry_active_sessions";
const SEND_LATENCY: &str = "telemetry_send_latency_seconds";

fn register_metrics() {
    for c in Counter::ALL {
        describe_counter!(c.name(), c.description());
    }
    describe_counter!(SUBSCRIBE_FAILURES, "Subscribe streams ended by an error, by reason");
    describe_gauge!(ACTIVE_SESSIONS, "Admitted subscribe sessions");
    describe_histogram!(
        SEND_LATENCY,
        "Delay between sampling a value and writing it to the client"
    );
}

// =============================================================================
// Counters
// =============================================================================

/// Named increment hook points.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Counter {
    /// A subscribe stream was opened.
    SubscribeRequest,
    /// The admission threshold turned a session away.
    AdmissionRejected,
    /// A response was written to a client.
    MessageSent,
    /// Writing a response failed.
    SendFailure,
    /// A registry write or delete failed.
    RegistryError,
    /// A certificate change was turned into a restart request.
    CertificateRotation,
    /// The listener was rebuilt.
    ServerRestart,
    /// Reloaded credentials were rejected and the listener kept running.
    RestartFailed,
}

impl Counter {
    const ALL: [Self; 8] = [
        Self::SubscribeRequest,
        Self::AdmissionRejected,
        Self::MessageSent,
        Self::SendFailure,
        Self::RegistryError,
        Self::CertificateRotation,
        Self::ServerRestart,
        Self::RestartFailed,
    ];

    /// Prometheus metric name.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::SubscribeRequest => "telemetry_subscribe_requests_total",
            Self::AdmissionRejected => "telemetry_admission_rejections_total",
            Self::MessageSent => "telemetry_messages_sent_total",
            Self::SendFailure => "telemetry_send_failures_total",
            Self::RegistryError => "telemetry_registry_errors_total",
            Self::CertificateRotation => "telemetry_certificate_rotations_total",
            Self::ServerRestart => "telemetry_server_restarts_total",
            Self::RestartFailed => "telemetry_server_restart_failures_total",
        }
    }

    const fn description(self) -> &'static str {
        match self {
            Self::SubscribeRequest => "Subscribe streams opened",
            Self::AdmissionRejected => "Sessions rejected at the connection threshold",
            Self::MessageSent => "Responses written to clients",
            Self::SendFailure => "Responses that could not be written",
            Self::RegistryError => "Failed connection registry operations",
            Self::CertificateRotation => "Restarts requested by certificate changes",
            Self::ServerRestart => "Listener generations replaced",
            Self::RestartFailed => "Restarts abandoned because the new credentials were unusable",
        }
    }
}

/// Increment `counter` by one.
pub fn increment(c: Counter) {
    counter!(c.name()).increment(1);
}

/// Record a session that ended with an error.
pub fn record_session_failure(reason: &'static str) {
    counter!(SUBSCRIBE_FAILURES, "reason" => reason).increment(1);
}

/// Update the admitted session gauge.
#[allow(clippy::cast_precision_loss)]
pub fn set_active_sessions(count: usize) {
    gauge!(ACTIVE_SESSIONS).set(count as f64);
}

/// Record the delay between sampling a value and delivering it.
pub fn record_send_latency(latency: Duration) {
    histogram!(SEND_LATENCY).record(latency.as_secs_f64());
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    #[test]
    fn counter_names_are_unique_and_prefixed() {
        let names: HashSet<_> = Counter::ALL.iter().map(|c| c.name()).collect();
        assert_eq!(names.len(), Counter::ALL.len());
        assert!(names.iter().all(|n| n.starts_with("telemetry_") && n.ends_with("_total")));
    }

    #[test]
    fn recording_without_recorder_is_noop() {
        increment(Counter::MessageSent);
        record_session_failure("transport");
        set_active_sessions(3);
        record_send_latency(Duration::from_millis(5));
    }
}
