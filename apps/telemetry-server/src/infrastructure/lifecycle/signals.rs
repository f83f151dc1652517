//! OS signal handling.

use std::future::Future;

use tokio::signal;
use tokio::sync::mpsc;

use crate::application::rotation::ControlSignal;

/// Wait for SIGTERM, SIGQUIT, or Ctrl-C and send a single `Shutdown`.
pub async fn forward_shutdown_signal(control: mpsc::Sender<ControlSignal>) {
    let name = wait_for_signal().await;
    tracing::info!(signal = name, "Received signal, initiating shutdown");
    if control.send(ControlSignal::Shutdown).await.is_err() {
        tracing::debug!("Server already stopped");
    }
}

async fn wait_for_signal() -> &'static str {
    let ctrl_c = guard("Ctrl-C", async { signal::ctrl_c().await });

    #[cfg(unix)]
    let terminate = unix_signal(signal::unix::SignalKind::terminate(), "SIGTERM");
    #[cfg(unix)]
    let quit = unix_signal(signal::unix::SignalKind::quit(), "SIGQUIT");

    #[cfg(not(unix))]
    let terminate = std::future::pending::<&'static str>();
    #[cfg(not(unix))]
    let quit = std::future::pending::<&'static str>();

    tokio::select! {
        name = ctrl_c => name,
        name = terminate => name,
        name = quit => name,
    }
}

#[cfg(unix)]
async fn unix_signal(kind: signal::unix::SignalKind, name: &'static str) -> &'static str {
    match signal::unix::signal(kind) {
        Ok(mut stream) => {
            stream.recv().await;
            name
        }
        Err(e) => {
            tracing::error!(signal = name, error = %e, "Failed to install signal handler");
            std::future::pending().await
        }
    }
}

/// Resolve to `name` when `wait` succeeds; never resolve if it fails.
async fn guard<F>(name: &'static str, wait: F) -> &'static str
where
    F: Future<Output = std::io::Result<()>>,
{
    match wait.await {
        Ok(()) => name,
        Err(e) => {
            tracing::error!(signal = name, error = %e, "Failed to install signal handler");
            std::future::pending().await
        }
    }
}
