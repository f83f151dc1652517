//! Server Lifecycle Driver
//!
//! Runs the gRPC listener in generations:
//!
//! ```text
//! ┌────────► bind (retry) ─► serve ──┐
//! │                                  │ control signal
//! └── Restart ◄── load TLS ◄─────────┤
//!                    │ (rejected)    └─► Shutdown / closed ─► stop
//!                    └─► keep serving
//! ```
//!
//! Credentials for the next generation are loaded before the current one is
//! touched. Once they are accepted the current generation's shutdown token
//! is cancelled: its acceptor drops the listening socket and its open streams
//! drain in the background while the next generation binds.

mod retry;
mod signals;

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tonic::transport::Server;

pub use retry::{BindRetry, BindRetryConfig};
pub use signals::forward_shutdown_signal;

use crate::application::rotation::ControlSignal;
use crate::infrastructure::config::TlsSettings;
use crate::infrastructure::grpc::TelemetryServer;
use crate::infrastructure::metrics::{self, Counter};
use crate::infrastructure::tls::{TlsError, TlsMaterial};
use crate::proto::g_nmi_server::GNmiServer;

/// Accepted connections buffered between the acceptor and tonic.
const ACCEPT_BACKLOG: usize = 128;

/// Pause after a failed `accept` before trying again.
const ACCEPT_ERROR_PAUSE: Duration = Duration::from_millis(50);

/// Default time allowed for open streams to finish on shutdown.
pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

// =============================================================================
// Status
// =============================================================================

/// Observable state of the driver, shared with the health endpoint.
#[derive(Debug, Default)]
pub struct ServerStatus {
    generation: AtomicU64,
    restarts: AtomicU64,
    serving: AtomicBool,
    local_addr: Mutex<Option<SocketAddr>>,
}

impl ServerStatus {
    /// Create a status with no generation started.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of the current (or last) listener generation, starting at 1.
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Restarts performed so far.
    #[must_use]
    pub fn restarts(&self) -> u64 {
        self.restarts.load(Ordering::SeqCst)
    }

    /// Whether a generation is accepting connections.
    #[must_use]
    pub fn is_serving(&self) -> bool {
        self.serving.load(Ordering::SeqCst)
    }

    /// Address the current generation is bound to.
    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock()
    }

    fn start_serving(&self, addr: SocketAddr) {
        *self.local_addr.lock() = Some(addr);
        self.serving.store(true, Ordering::SeqCst);
    }

    fn stop_serving(&self) {
        self.serving.store(false, Ordering::SeqCst);
    }
}

// =============================================================================
// Driver
// =============================================================================

/// Listener settings.
#[derive(Debug, Clone)]
pub struct DriverConfig {
    /// Address to bind. Port 0 picks a port once and keeps it across restarts.
    pub listen: SocketAddr,
    /// TLS settings, reloaded every generation.
    pub tls: TlsSettings,
    /// HTTP/2 keep-alive interval and timeout, zero disables.
    pub idle_timeout: Duration,
    /// Backoff for rebinding the port.
    pub bind_retry: BindRetryConfig,
    /// Time allowed for open streams on shutdown.
    pub drain_timeout: Duration,
}

/// Server lifecycle errors.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    /// Credentials could not be loaded.
    #[error(transparent)]
    Tls(#[from] TlsError),

    /// The listener could not be bound.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        /// Requested address.
        addr: SocketAddr,
        /// Last bind error.
        #[source]
        source: io::Error,
    },

    /// tonic rejected the configuration or failed while serving.
    #[error("gRPC transport error: {0}")]
    Transport(#[from] tonic::transport::Error),

    /// The serving task ended unexpectedly.
    #[error("gRPC server task failed: {0}")]
    Task(String),
}

/// Owns the control channel and runs listener generations.
pub struct ServerDriver {
    config: DriverConfig,
    service: Arc<TelemetryServer>,
    control: mpsc::Receiver<ControlSignal>,
    status: Arc<ServerStatus>,
}

type ServeHandle = JoinHandle<Result<(), tonic::transport::Error>>;

/// Transport for a generation that has not bound yet.
struct Prepared {
    builder: Server,
    tls: bool,
    client_auth: bool,
}

impl ServerDriver {
    /// Create a driver.
    #[must_use]
    pub fn new(
        config: DriverConfig,
        service: Arc<TelemetryServer>,
        control: mpsc::Receiver<ControlSignal>,
        status: Arc<ServerStatus>,
    ) -> Self {
        Self {
            config,
            service,
            control,
            status,
        }
    }

    /// Shared status handle.
    #[must_use]
    pub fn status(&self) -> Arc<ServerStatus> {
        Arc::clone(&self.status)
    }

    /// Serve until `Shutdown` arrives or every control sender is dropped.
    ///
    /// A restart whose credentials cannot be loaded leaves the current
    /// generation serving.
    ///
    /// # Errors
    ///
    /// Returns `ServerError` if the first generation cannot start
    /// (credentials, bind, transport configuration), a restarted generation
    /// cannot bind, or the serving task fails.
    pub async fn run(mut self) -> Result<(), ServerError> {
        let mut next = self.prepare()?;
        loop {
            let generation = self.status.generation.fetch_add(1, Ordering::SeqCst) + 1;
            let shutdown = CancellationToken::new();
            let mut serve = self.start_generation(generation, next, &shutdown).await?;

            next = loop {
                let signal = tokio::select! {
                    signal = self.control.recv() => signal,
                    result = &mut serve => {
                        self.status.stop_serving();
                        return match result {
                            Ok(Ok(())) => {
                                tracing::warn!(generation, "gRPC server stopped on its own");
                                Ok(())
                            }
                            Ok(Err(e)) => Err(ServerError::Transport(e)),
                            Err(e) => Err(ServerError::Task(e.to_string())),
                        };
                    }
                };

                if signal != Some(ControlSignal::Restart) {
                    shutdown.cancel();
                    self.status.stop_serving();
                    self.stop(generation, serve).await;
                    return Ok(());
                }

                match self.prepare() {
                    Ok(prepared) => break prepared,
                    Err(e) => {
                        metrics::increment(Counter::RestartFailed);
                        tracing::error!(
                            generation,
                            error = %e,
                            "Reloaded credentials unusable, keeping current listener"
                        );
                    }
                }
            };

            shutdown.cancel();
            self.status.stop_serving();
            self.status.restarts.fetch_add(1, Ordering::SeqCst);
            metrics::increment(Counter::ServerRestart);
            tracing::info!(generation, "Restarting gRPC server with reloaded credentials");
            tokio::spawn(drain(generation, serve));
        }
    }

    /// Load credentials and build the transport for the next generation.
    fn prepare(&self) -> Result<Prepared, ServerError> {
        let tls = TlsMaterial::load(&self.config.tls)?;

        let mut builder = Server::builder();
        if let Some(tls) = &tls {
            // Rejects a key that does not belong to the certificate.
            builder = builder.tls_config(tls.server_config())?;
        }
        if !self.config.idle_timeout.is_zero() {
            builder = builder
                .http2_keepalive_interval(Some(self.config.idle_timeout))
                .http2_keepalive_timeout(Some(self.config.idle_timeout));
        }

        Ok(Prepared {
            builder,
            tls: tls.is_some(),
            client_auth: tls.as_ref().is_some_and(TlsMaterial::verifies_clients),
        })
    }

    async fn start_generation(
        &mut self,
        generation: u64,
        prepared: Prepared,
        shutdown: &CancellationToken,
    ) -> Result<ServeHandle, ServerError> {
        let listener = self.bind().await?;
        let local_addr = listener.local_addr().map_err(|source| ServerError::Bind {
            addr: self.config.listen,
            source,
        })?;
        // Keep an OS-assigned port across restarts.
        self.config.listen = local_addr;

        let Prepared {
            mut builder,
            tls,
            client_auth,
        } = prepared;
        let router = builder.add_service(GNmiServer::from_arc(Arc::clone(&self.service)));
        let incoming = spawn_acceptor(listener, shutdown.clone());
        let handle = tokio::spawn(
            router.serve_with_incoming_shutdown(incoming, shutdown.clone().cancelled_owned()),
        );

        self.status.start_serving(local_addr);
        tracing::info!(
            generation,
            addr = %local_addr,
            tls,
            client_auth,
            "gRPC server listening"
        );
        Ok(handle)
    }

    async fn stop(&self, generation: u64, mut serve: ServeHandle) {
        tracing::info!(generation, "Stopping gRPC server");
        match tokio::time::timeout(self.config.drain_timeout, &mut serve).await {
            Ok(_) => tracing::info!(generation, "gRPC server stopped"),
            Err(_) => {
                tracing::warn!(
                    generation,
                    timeout_secs = self.config.drain_timeout.as_secs(),
                    "Open streams did not finish, closing them"
                );
                serve.abort();
            }
        }
    }

    async fn bind(&self) -> Result<TcpListener, ServerError> {
        let addr = self.config.listen;
        let mut retry = BindRetry::new(self.config.bind_retry.clone());
        loop {
            match TcpListener::bind(addr).await {
                Ok(listener) => return Ok(listener),
                Err(source) => {
                    let Some(delay) = retry.next_delay() else {
                        return Err(ServerError::Bind { addr, source });
                    };
                    tracing::warn!(
                        addr = %addr,
                        attempt = retry.attempt_count(),
                        delay_ms = delay.as_millis(),
                        error = %source,
                        "Bind failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

async fn drain(generation: u64, serve: ServeHandle) {
    match serve.await {
        Ok(Ok(())) => tracing::info!(generation, "Previous generation drained"),
        Ok(Err(e)) => tracing::warn!(generation, error = %e, "Previous generation failed"),
        Err(e) => tracing::warn!(generation, error = %e, "Previous generation task failed"),
    }
}

/// Accept connections until `shutdown`, then drop the listener.
fn spawn_acceptor(
    listener: TcpListener,
    shutdown: CancellationToken,
) -> ReceiverStream<io::Result<TcpStream>> {
    let (tx, rx) = mpsc::channel(ACCEPT_BACKLOG);
    tokio::spawn(async move {
        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        if let Err(e) = stream.set_nodelay(true) {
                            tracing::debug!(peer = %peer, error = %e, "Failed to set TCP_NODELAY");
                        }
                        if tx.send(Ok(stream)).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "Accept failed");
                        tokio::time::sleep(ACCEPT_ERROR_PAUSE).await;
                    }
                }
            }
        }
        tracing::debug!("Listener closed");
    });
    ReceiverStream::new(rx)
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::admission::ConnectionManager;
    use crate::infrastructure::config::TlsMode;
    use crate::infrastructure::producers::ProducerRegistry;
    use crate::infrastructure::registry::InMemoryRegistry;

    fn driver(
        listen: SocketAddr,
        tls: TlsMode,
    ) -> (ServerDriver, mpsc::Sender<ControlSignal>, Arc<ServerStatus>) {
        let _ = rustls::crypto::ring::default_provider().install_default();
        let admission = Arc::new(ConnectionManager::new(0, Arc::new(InMemoryRegistry::new())));
        let service = Arc::new(TelemetryServer::new(
            admission,
            Arc::new(ProducerRegistry::new()),
            16,
        ));
        let (tx, rx) = mpsc::channel(4);
        let status = Arc::new(ServerStatus::new());
        let config = DriverConfig {
            listen,
            tls: TlsSettings {
                mode: tls,
                allow_no_client_auth: false,
            },
            idle_timeout: Duration::from_secs(5),
            bind_retry: BindRetryConfig {
                max_attempts: 3,
                ..BindRetryConfig::default()
            },
            drain_timeout: Duration::from_secs(1),
        };
        (
            ServerDriver::new(config, service, rx, Arc::clone(&status)),
            tx,
            status,
        )
    }

    async fn wait_for_generation(status: &ServerStatus, generation: u64) -> SocketAddr {
        for _ in 0..200 {
            if status.is_serving() && status.generation() == generation {
                if let Some(addr) = status.local_addr() {
                    return addr;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("generation {generation} never started serving");
    }

    #[tokio::test]
    async fn restart_keeps_port_and_bumps_generation() {
        let (driver, control, status) = driver("127.0.0.1:0".parse().unwrap(), TlsMode::SelfSigned);
        let handle = tokio::spawn(driver.run());

        let first = wait_for_generation(&status, 1).await;
        control.send(ControlSignal::Restart).await.unwrap();
        let second = wait_for_generation(&status, 2).await;

        assert_eq!(first, second);
        assert_eq!(status.restarts(), 1);
        assert!(TcpStream::connect(second).await.is_ok());

        control.send(ControlSignal::Shutdown).await.unwrap();
        handle.await.unwrap().unwrap();
        assert!(!status.is_serving());
    }

    #[tokio::test]
    async fn dropped_control_channel_stops_driver() {
        let (driver, control, status) = driver("127.0.0.1:0".parse().unwrap(), TlsMode::Disabled);
        let handle = tokio::spawn(driver.run());

        wait_for_generation(&status, 1).await;
        drop(control);

        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }

    fn write_identity(cert: &std::path::Path, key: &std::path::Path) {
        let identity = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
        std::fs::write(key, identity.key_pair.serialize_pem()).unwrap();
        std::fs::write(cert, identity.cert.pem()).unwrap();
    }

    #[tokio::test]
    async fn rejected_credentials_keep_current_generation() {
        let dir = tempfile::tempdir().unwrap();
        let cert = dir.path().join("server.crt");
        let key = dir.path().join("server.key");
        write_identity(&cert, &key);

        let (driver, control, status) = driver(
            "127.0.0.1:0".parse().unwrap(),
            TlsMode::Files {
                cert: cert.clone(),
                key: key.clone(),
                ca: None,
            },
        );
        let handle = tokio::spawn(driver.run());
        let addr = wait_for_generation(&status, 1).await;

        // New certificate, old key.
        let stranger = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
        std::fs::write(&cert, stranger.cert.pem()).unwrap();
        control.send(ControlSignal::Restart).await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert!(!handle.is_finished());
        assert!(status.is_serving());
        assert_eq!(status.generation(), 1);
        assert_eq!(status.restarts(), 0);
        assert!(TcpStream::connect(addr).await.is_ok());

        // The matching key lands later.
        std::fs::write(&key, stranger.key_pair.serialize_pem()).unwrap();
        control.send(ControlSignal::Restart).await.unwrap();

        assert_eq!(wait_for_generation(&status, 2).await, addr);
        assert_eq!(status.restarts(), 1);

        control.send(ControlSignal::Shutdown).await.unwrap();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn missing_credentials_fail_startup() {
        let dir = tempfile::tempdir().unwrap();
        let (driver, _control, status) = driver(
            "127.0.0.1:0".parse().unwrap(),
            TlsMode::Files {
                cert: dir.path().join("server.crt"),
                key: dir.path().join("server.key"),
                ca: None,
            },
        );

        let err = driver.run().await.unwrap_err();
        assert!(matches!(err, ServerError::Tls(_)));
        assert!(!status.is_serving());
    }

    #[tokio::test]
    async fn occupied_port_fails_after_retries() {
        let blocker = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = blocker.local_addr().unwrap();
        let (driver, _control, _status) = driver(addr, TlsMode::Disabled);

        let err = driver.run().await.unwrap_err();
        assert!(matches!(err, ServerError::Bind { .. }));
    }
}
