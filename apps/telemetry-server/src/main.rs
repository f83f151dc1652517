//! Telemetry Server Binary
//!
//! Starts the gNMI telemetry server.
//!
//! # Usage
//!
//! ```bash
//! TELEMETRY_PORT=50051 TELEMETRY_INSECURE=true cargo run --bin telemetry-server
//! ```
//!
//! # Environment Variables
//!
//! ## Required
//! - `TELEMETRY_PORT`: gRPC listen port
//! - `TELEMETRY_SERVER_CRT` / `TELEMETRY_SERVER_KEY`: unless insecure or no-TLS
//!
//! ## Optional
//! - `TELEMETRY_BIND_ADDR`: listen IP (default: 0.0.0.0)
//! - `TELEMETRY_THRESHOLD`: max concurrent sessions, 0 = unlimited (default: 100)
//! - `TELEMETRY_IDLE_CONN_SECS`: HTTP/2 keep-alive, 0 = off (default: 5)
//! - `TELEMETRY_CA_CRT`: CA for client certificates
//! - `TELEMETRY_INSECURE` / `TELEMETRY_NO_TLS` / `TELEMETRY_ALLOW_NO_CLIENT_AUTH`
//! - `TELEMETRY_HEALTH_PORT`: health and metrics port, 0 = off (default: 8082)
//! - `TELEMETRY_REGISTRY_URL`: redis URL of the connection registry
//! - `TELEMETRY_QUEUE_CAPACITY`: per-session queue bound (default: 1024)
//! - `OTEL_ENABLED`, `OTEL_EXPORTER_OTLP_ENDPOINT`, `OTEL_SERVICE_NAME`
//! - `RUST_LOG`: log filter (default: `telemetry_server=info`)

use std::sync::Arc;

use anyhow::Context;
use telemetry_server::application::ports::RegistryStore;
use telemetry_server::infrastructure::lifecycle::{
    DEFAULT_DRAIN_TIMEOUT, DriverConfig, ServerDriver, ServerStatus, forward_shutdown_signal,
};
use telemetry_server::infrastructure::watcher::watch_credentials;
use telemetry_server::{
    BindRetryConfig, ConnectionManager, ControlSignal, HealthServer, HealthServerState,
    InMemoryRegistry, ProducerRegistry, RedisRegistry, RotationController, ServerConfig,
    SystemStatsConfig, TelemetryServer, init_metrics, init_telemetry,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Control signals buffered for the lifecycle driver.
const CONTROL_BUFFER: usize = 8;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("failed to install rustls crypto provider"))?;

    load_dotenv();

    // Initialize telemetry (OpenTelemetry + tracing)
    let _telemetry_guard = init_telemetry();

    tracing::info!("Starting telemetry server");

    // Initialize Prometheus metrics
    if let Err(e) = init_metrics() {
        tracing::warn!(error = %e, "Prometheus recorder not installed");
    }

    let config = ServerConfig::from_env().context("invalid configuration")?;
    log_config(&config);

    let registry = connect_registry(config.registry_url.as_deref()).await;
    let admission = Arc::new(ConnectionManager::new(config.threshold, registry));
    match admission.reset().await {
        Ok(stale) => tracing::info!(stale, "Connection registry cleared"),
        Err(e) => tracing::warn!(error = %e, "Failed to clear connection registry"),
    }

    let producers = Arc::new(ProducerRegistry::with_system_stats(SystemStatsConfig::default()));
    let service = Arc::new(TelemetryServer::new(
        Arc::clone(&admission),
        producers,
        config.queue_capacity,
    ));

    let (control_tx, control_rx) = mpsc::channel::<ControlSignal>(CONTROL_BUFFER);
    let status = Arc::new(ServerStatus::new());
    let shutdown_token = CancellationToken::new();

    // Spawn health server
    if config.health_port > 0 {
        let state = Arc::new(HealthServerState::new(
            env!("CARGO_PKG_VERSION").to_string(),
            Arc::clone(&admission),
            Arc::clone(&status),
        ));
        let health_server = HealthServer::new(config.health_port, state, shutdown_token.clone());
        tokio::spawn(async move {
            if let Err(e) = health_server.run().await {
                tracing::error!(error = %e, "Health server error");
            }
        });
    }

    // Spawn certificate rotation
    let _cert_watcher = match config.tls.watched_files() {
        Some((cert, key)) => match watch_credentials(cert, key) {
            Ok((watcher, events)) => {
                let controller = RotationController::new(cert.clone(), control_tx.clone());
                tokio::spawn(async move {
                    let outcome = controller.run(events).await;
                    tracing::info!(?outcome, "Certificate rotation stopped");
                });
                Some(watcher)
            }
            Err(e) => {
                tracing::error!(error = %e, "Certificate rotation disabled");
                None
            }
        },
        None => None,
    };

    tokio::spawn(forward_shutdown_signal(control_tx));

    let driver = ServerDriver::new(
        DriverConfig {
            listen: config.listen,
            tls: config.tls.clone(),
            idle_timeout: config.idle_timeout,
            bind_retry: BindRetryConfig::default(),
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
        },
        service,
        control_rx,
        status,
    );
    let result = driver.run().await;

    shutdown_token.cancel();
    result.context("telemetry server failed")?;

    tracing::info!("Telemetry server stopped");
    Ok(())
}

/// Redis registry when configured and reachable, otherwise process-local.
async fn connect_registry(url: Option<&str>) -> Arc<dyn RegistryStore> {
    let Some(url) = url else {
        tracing::info!("No registry URL configured, using in-memory registry");
        return Arc::new(InMemoryRegistry::new());
    };

    match RedisRegistry::connect(url).await {
        Ok(registry) => Arc::new(registry),
        Err(e) => {
            tracing::warn!(error = %e, "Connection registry unavailable, using in-memory registry");
            Arc::new(InMemoryRegistry::new())
        }
    }
}

/// Log the parsed configuration.
fn log_config(config: &ServerConfig) {
    tracing::info!(
        listen = %config.listen,
        threshold = config.threshold,
        idle_timeout_secs = config.idle_timeout.as_secs(),
        tls = ?config.tls.mode,
        health_port = config.health_port,
        registry = config.registry_url.is_some(),
        "Configuration loaded"
    );
}

/// Load .env file from current directory or any ancestor directory.
fn load_dotenv() {
    if dotenvy::dotenv().is_ok() {
        return;
    }

    if let Ok(cwd) = std::env::current_dir() {
        let mut dir = cwd.as_path();
        while let Some(parent) = dir.parent() {
            let env_path = parent.join(".env");
            if env_path.exists() {
                let _ = dotenvy::from_path(&env_path);
                return;
            }
            dir = parent;
        }
    }
}
