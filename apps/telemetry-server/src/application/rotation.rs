//! Certificate Rotation
//!
//! Turns filesystem events on the server certificate and key into control
//! signals for the server lifecycle driver:
//!
//! ```text
//! Watching ──Modified──► (quiet for `debounce`) ──► Restart ──► Watching
//!    │
//!    ├──Removed──► Shutdown ──► Stopped
//!    └──error────► Stopped (logged, serving continues)
//! ```
//!
//! Writers rarely update a file in one event, so modifications arriving within
//! the debounce window are coalesced into a single restart. A restart the
//! driver cannot carry out leaves the old listener up, so a key written after
//! its certificate simply triggers the next one.

use std::path::PathBuf;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;

use super::ports::{CertEvent, WatchError};
use crate::infrastructure::metrics::{self, Counter};

/// Default window for coalescing certificate writes.
pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(250);

/// Signal from the process to the server lifecycle driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ControlSignal {
    /// Stop serving and exit.
    Shutdown = 0,
    /// Reload credentials and restart the listener.
    Restart = 1,
}

impl ControlSignal {
    /// Numeric value of the signal.
    #[must_use]
    pub const fn as_i32(self) -> i32 {
        self as i32
    }
}

/// Why the rotation controller stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RotationOutcome {
    /// The certificate was removed and shutdown was requested.
    CertificateRemoved,
    /// The watcher failed; rotation monitoring is off.
    WatchFailed(String),
    /// The watcher's event stream ended.
    WatchClosed,
    /// The lifecycle driver is no longer listening for signals.
    DriverGone,
}

/// Watches one certificate path and drives restarts.
#[derive(Debug)]
pub struct RotationController {
    cert_path: PathBuf,
    control: mpsc::Sender<ControlSignal>,
    debounce: Duration,
}

impl RotationController {
    /// Create a controller for `cert_path` that signals on `control`.
    #[must_use]
    pub const fn new(cert_path: PathBuf, control: mpsc::Sender<ControlSignal>) -> Self {
        Self {
            cert_path,
            control,
            debounce: DEFAULT_DEBOUNCE,
        }
    }

    /// Override the coalescing window.
    #[must_use]
    pub const fn with_debounce(mut self, debounce: Duration) -> Self {
        self.debounce = debounce;
        self
    }

    /// Consume watcher events until the controller stops.
    pub async fn run(
        self,
        mut events: mpsc::Receiver<Result<CertEvent, WatchError>>,
    ) -> RotationOutcome {
        tracing::info!(path = %self.cert_path.display(), "Watching server certificate");

        let mut pending_restart: Option<Instant> = None;

        loop {
            let next = match pending_restart {
                Some(deadline) => tokio::select! {
                    event = events.recv() => Some(event),
                    () = tokio::time::sleep_until(deadline) => None,
                },
                None => Some(events.recv().await),
            };

            match next {
                None => {
                    pending_restart = None;
                    tracing::info!(
                        path = %self.cert_path.display(),
                        "Server certificate changed, requesting restart"
                    );
                    if !self.signal(ControlSignal::Restart).await {
                        return RotationOutcome::DriverGone;
                    }
                    metrics::increment(Counter::CertificateRotation);
                }
                Some(None) => {
                    if pending_restart.is_some() && !self.signal(ControlSignal::Restart).await {
                        return RotationOutcome::DriverGone;
                    }
                    tracing::info!(path = %self.cert_path.display(), "Certificate watch closed");
                    return RotationOutcome::WatchClosed;
                }
                Some(Some(Ok(CertEvent::Modified))) => {
                    tracing::debug!(path = %self.cert_path.display(), "Certificate modified");
                    pending_restart = Some(Instant::now() + self.debounce);
                }
                Some(Some(Ok(CertEvent::Removed))) => {
                    tracing::warn!(
                        path = %self.cert_path.display(),
                        "Server certificate removed, requesting shutdown"
                    );
                    if !self.signal(ControlSignal::Shutdown).await {
                        return RotationOutcome::DriverGone;
                    }
                    return RotationOutcome::CertificateRemoved;
                }
                Some(Some(Err(e))) => {
                    tracing::error!(
                        path = %self.cert_path.display(),
                        error = %e,
                        "Certificate watcher failed, rotation monitoring stopped"
                    );
                    return RotationOutcome::WatchFailed(e.to_string());
                }
            }
        }
    }

    async fn signal(&self, signal: ControlSignal) -> bool {
        if self.control.send(signal).await.is_err() {
            tracing::warn!(signal = signal.as_i32(), "Server driver gone, dropping control signal");
            return false;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn controller(debounce: Duration) -> (RotationController, mpsc::Receiver<ControlSignal>) {
        let (tx, rx) = mpsc::channel(4);
        (
            RotationController::new(PathBuf::from("/etc/ssl/server.crt"), tx)
                .with_debounce(debounce),
            rx,
        )
    }

    #[test]
    fn signal_values() {
        assert_eq!(ControlSignal::Shutdown.as_i32(), 0);
        assert_eq!(ControlSignal::Restart.as_i32(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn burst_of_writes_restarts_once() {
        let (controller, mut control) = controller(Duration::from_millis(100));
        let (events_tx, events_rx) = mpsc::channel(8);
        let task = tokio::spawn(controller.run(events_rx));

        for _ in 0..3 {
            events_tx.send(Ok(CertEvent::Modified)).await.unwrap();
        }

        assert_eq!(control.recv().await, Some(ControlSignal::Restart));

        drop(events_tx);
        assert_eq!(task.await.unwrap(), RotationOutcome::WatchClosed);
        assert!(control.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn separate_writes_restart_separately() {
        let (controller, mut control) = controller(Duration::from_millis(50));
        let (events_tx, events_rx) = mpsc::channel(8);
        let task = tokio::spawn(controller.run(events_rx));

        events_tx.send(Ok(CertEvent::Modified)).await.unwrap();
        assert_eq!(control.recv().await, Some(ControlSignal::Restart));

        events_tx.send(Ok(CertEvent::Modified)).await.unwrap();
        assert_eq!(control.recv().await, Some(ControlSignal::Restart));

        drop(events_tx);
        assert_eq!(task.await.unwrap(), RotationOutcome::WatchClosed);
    }

    #[tokio::test]
    async fn removal_requests_shutdown_and_stops() {
        let (controller, mut control) = controller(Duration::from_millis(50));
        let (events_tx, events_rx) = mpsc::channel(8);

        events_tx.send(Ok(CertEvent::Removed)).await.unwrap();
        events_tx.send(Ok(CertEvent::Modified)).await.unwrap();

        assert_eq!(
            controller.run(events_rx).await,
            RotationOutcome::CertificateRemoved
        );
        assert_eq!(control.recv().await, Some(ControlSignal::Shutdown));
        assert!(control.try_recv().is_err());
    }

    #[tokio::test]
    async fn removal_supersedes_pending_restart() {
        let (controller, mut control) = controller(Duration::from_secs(60));
        let (events_tx, events_rx) = mpsc::channel(8);

        events_tx.send(Ok(CertEvent::Modified)).await.unwrap();
        events_tx.send(Ok(CertEvent::Removed)).await.unwrap();

        assert_eq!(
            controller.run(events_rx).await,
            RotationOutcome::CertificateRemoved
        );
        assert_eq!(control.recv().await, Some(ControlSignal::Shutdown));
        assert!(control.try_recv().is_err());
    }

    #[tokio::test]
    async fn watcher_error_stops_without_signal() {
        let (controller, mut control) = controller(Duration::from_millis(50));
        let (events_tx, events_rx) = mpsc::channel(8);

        events_tx
            .send(Err(WatchError::Backend("inotify queue overflow".to_string())))
            .await
            .unwrap();

        let outcome = controller.run(events_rx).await;
        assert!(matches!(outcome, RotationOutcome::WatchFailed(_)));
        assert!(control.try_recv().is_err());
    }

    #[tokio::test]
    async fn stops_when_driver_is_gone() {
        let (controller, control) = controller(Duration::from_millis(50));
        drop(control);
        let (events_tx, events_rx) = mpsc::channel(8);

        events_tx.send(Ok(CertEvent::Removed)).await.unwrap();

        assert_eq!(controller.run(events_rx).await, RotationOutcome::DriverGone);
    }
}
