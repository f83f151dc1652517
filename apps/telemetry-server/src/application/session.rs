//! Subscription Session
//!
//! One [`Session`] serves one subscribe stream:
//!
//! ```text
//! Created ─► Parsing ─► Admitted ─► Running(mode) ─► Draining ─► Closed
//!                 └────► Rejected
//! ```
//!
//! While running, three tasks cooperate:
//!
//! - the **producer** task (tracked) fills the delivery queue
//! - the **receive** task (not joined) reads client messages, primes poll
//!   tokens, and detects the end of the stream
//! - the **send loop** (the caller of [`Session::run`]) drains the queue to the
//!   client
//!
//! The first of {receive end, send failure, forced close} triggers
//! [`Session::close`], which disposes the queue and ends the active mode
//! signal. `run` then waits for the producer task, releases the admission
//! slot, and returns the terminal error.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tonic::{Code, Status};
use tracing::Instrument;
use uuid::Uuid;

use super::admission::ConnectionManager;
use super::ports::{
    Producer, ProducerError, ProducerFactory, RequestStream, ResponseSink, SessionQueue,
};
use crate::domain::queue::DeliveryQueue;
use crate::domain::streaming::{DeliveryItem, FatalValue};
use crate::domain::subscription::{DeliveryMode, ParsedSubscription, SubscriptionError};
use crate::infrastructure::metrics::{self, Counter};
use crate::proto::subscribe_request;

// =============================================================================
// Errors
// =============================================================================

/// Terminal session failures.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// The client ended its stream before sending a subscription.
    #[error("stream EOF received before init")]
    EndOfStreamBeforeInit,

    /// The first request was not a usable subscription.
    #[error(transparent)]
    Subscription(#[from] SubscriptionError),

    /// The connection threshold has been reached.
    #[error("server connections are at capacity")]
    AdmissionDenied,

    /// No producer could serve the subscription.
    #[error(transparent)]
    Producer(#[from] ProducerError),

    /// Reading from or writing to the stream failed.
    #[error("stream error: {}", .0.message())]
    Transport(Status),

    /// The producer reported an unrecoverable error.
    #[error(transparent)]
    Fatal(#[from] FatalValue),
}

impl SessionError {
    /// gRPC status code reported to the client.
    #[must_use]
    pub fn code(&self) -> Code {
        match self {
            Self::EndOfStreamBeforeInit => Code::Aborted,
            Self::Subscription(
                SubscriptionError::NotSubscriptionList | SubscriptionError::UnknownMode(_),
            ) => Code::InvalidArgument,
            Self::Subscription(SubscriptionError::MissingPrefix | SubscriptionError::EmptyTarget) => {
                Code::Unimplemented
            }
            Self::Subscription(SubscriptionError::NoSubscription) | Self::Producer(_) => {
                Code::NotFound
            }
            Self::AdmissionDenied => Code::ResourceExhausted,
            Self::Transport(status) => status.code(),
            Self::Fatal(_) => Code::Internal,
        }
    }

    /// Short label used for metrics.
    #[must_use]
    pub const fn reason(&self) -> &'static str {
        match self {
            Self::EndOfStreamBeforeInit => "eof_before_init",
            Self::Subscription(_) => "invalid_subscription",
            Self::AdmissionDenied => "admission_denied",
            Self::Producer(_) => "producer_unavailable",
            Self::Transport(_) => "transport",
            Self::Fatal(_) => "fatal_value",
        }
    }
}

impl From<SessionError> for Status {
    fn from(err: SessionError) -> Self {
        match err {
            SessionError::Transport(status) => status,
            other => Self::new(other.code(), other.to_string()),
        }
    }
}

// =============================================================================
// Session
// =============================================================================

/// Message counters of a session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionStats {
    /// Responses written to the client.
    pub sent: u64,
    /// Client messages read, including the terminating read.
    pub received: u64,
    /// Errors recorded.
    pub errors: u64,
}

#[derive(Default)]
struct Controls {
    closed: bool,
    stop: Option<CancellationToken>,
    polled: Option<mpsc::Sender<()>>,
    once: Option<mpsc::Sender<()>>,
}

/// Server-side state of one subscribe stream.
pub struct Session {
    id: Uuid,
    peer: String,
    admission: Arc<ConnectionManager>,
    producers: Arc<dyn ProducerFactory>,
    queue: Arc<SessionQueue>,
    controls: Mutex<Controls>,
    teardown: CancellationToken,
    producer_tasks: TaskTracker,
    sent: AtomicU64,
    received: AtomicU64,
    errors: AtomicU64,
}

impl Session {
    /// Create a session for a stream from `peer`.
    #[must_use]
    pub fn new(
        peer: impl Into<String>,
        admission: Arc<ConnectionManager>,
        producers: Arc<dyn ProducerFactory>,
        queue_capacity: usize,
    ) -> Arc<Self> {
        Arc::new(Self {
            id: Uuid::new_v4(),
            peer: peer.into(),
            admission,
            producers,
            queue: Arc::new(DeliveryQueue::new(queue_capacity)),
            controls: Mutex::new(Controls::default()),
            teardown: CancellationToken::new(),
            producer_tasks: TaskTracker::new(),
            sent: AtomicU64::new(0),
            received: AtomicU64::new(0),
            errors: AtomicU64::new(0),
        })
    }

    /// Session identifier used in logs.
    #[must_use]
    pub const fn id(&self) -> Uuid {
        self.id
    }

    /// Peer address of the client.
    #[must_use]
    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Current message counters.
    #[must_use]
    pub fn stats(&self) -> SessionStats {
        SessionStats {
            sent: self.sent.load(Ordering::Relaxed),
            received: self.received.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }

    /// Whether teardown has started.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.controls.lock().closed
    }

    /// Tear the session down. Safe to call from any task, any number of times.
    pub fn close(&self) {
        let mut controls = self.controls.lock();
        if controls.closed {
            return;
        }
        controls.closed = true;

        self.queue.dispose();
        if let Some(stop) = controls.stop.take() {
            stop.cancel();
        }
        controls.polled = None;
        controls.once = None;
        drop(controls);

        self.teardown.cancel();
        tracing::debug!(session_id = %self.id, "Session closing");
    }

    /// Serve the stream until it ends, returning the terminal error if any.
    ///
    /// # Errors
    ///
    /// Returns the [`SessionError`] that ended the session.
    pub async fn run<R, S>(self: Arc<Self>, requests: R, responses: S) -> Result<(), SessionError>
    where
        R: RequestStream + 'static,
        S: ResponseSink + Clone + 'static,
    {
        let span = tracing::info_span!("session", session_id = %self.id, peer = %self.peer);
        async move {
            metrics::increment(Counter::SubscribeRequest);
            let result = Arc::clone(&self).run_inner(requests, responses).await;
            self.close();

            if let Err(e) = &result {
                self.errors.fetch_add(1, Ordering::Relaxed);
                metrics::record_session_failure(e.reason());
                tracing::info!(error = %e, code = ?e.code(), "Session failed");
            }

            let stats = self.stats();
            tracing::info!(
                sent = stats.sent,
                received = stats.received,
                errors = stats.errors,
                "Session closed"
            );
            result
        }
        .instrument(span)
        .await
    }

    async fn run_inner<R, S>(
        self: Arc<Self>,
        mut requests: R,
        responses: S,
    ) -> Result<(), SessionError>
    where
        R: RequestStream + 'static,
        S: ResponseSink + Clone + 'static,
    {
        let subscription = self.receive_subscription(&mut requests).await?;
        tracing::info!(
            target = %subscription.target,
            mode = %subscription.mode,
            paths = subscription.paths.len(),
            "Subscription received"
        );

        let key = self
            .admission
            .admit(&self.peer, &subscription)
            .await
            .ok_or(SessionError::AdmissionDenied)?;

        let result = Arc::clone(&self)
            .serve(&subscription, requests, responses)
            .await;

        self.admission.remove(&key).await;
        result
    }

    async fn receive_subscription<R: RequestStream>(
        &self,
        requests: &mut R,
    ) -> Result<ParsedSubscription, SessionError> {
        let first = requests.recv().await;
        self.received.fetch_add(1, Ordering::Relaxed);

        let request = match first {
            Ok(Some(request)) => request,
            Ok(None) => return Err(SessionError::EndOfStreamBeforeInit),
            Err(status) => return Err(SessionError::Transport(status)),
        };
        Ok(ParsedSubscription::from_request(&request)?)
    }

    async fn serve<R, S>(
        self: Arc<Self>,
        subscription: &ParsedSubscription,
        requests: R,
        responses: S,
    ) -> Result<(), SessionError>
    where
        R: RequestStream + 'static,
        S: ResponseSink + Clone + 'static,
    {
        let kind = subscription.producer_kind();
        let producer = self.producers.create(kind, subscription)?;
        tracing::debug!(producer = kind.as_str(), "Producer created");

        self.start_producer(Arc::clone(&producer), subscription.clone());
        self.spawn_receiver(requests, responses.clone(), subscription.mode);

        let result = self.send_loop(&responses, producer.as_ref()).await;

        self.close();
        self.producer_tasks.close();
        self.producer_tasks.wait().await;
        producer.close();
        result
    }

    fn start_producer(&self, producer: Arc<dyn Producer>, subscription: ParsedSubscription) {
        let mut controls = self.controls.lock();
        if controls.closed {
            return;
        }

        let queue = Arc::clone(&self.queue);
        let span = tracing::Span::current();
        match subscription.mode {
            DeliveryMode::Stream => {
                let stop = CancellationToken::new();
                controls.stop = Some(stop.clone());
                self.producer_tasks.spawn(
                    async move { producer.stream_run(queue, stop, &subscription).await }
                        .instrument(span),
                );
            }
            DeliveryMode::Poll => {
                let (polled, polls) = mpsc::channel(1);
                // Implicit first poll.
                let _ = polled.try_send(());
                controls.polled = Some(polled);
                self.producer_tasks.spawn(
                    async move { producer.poll_run(queue, polls, &subscription).await }
                        .instrument(span),
                );
            }
            DeliveryMode::Once => {
                let (once, token) = mpsc::channel(1);
                let _ = once.try_send(());
                controls.once = Some(once);
                self.producer_tasks.spawn(
                    async move {
                        producer
                            .once_run(Arc::clone(&queue), token, &subscription)
                            .await;
                        // Fails only if the session is already closing.
                        let _ = queue.put([DeliveryItem::EndOfBatch]).await;
                    }
                    .instrument(span),
                );
            }
        }
    }

    fn spawn_receiver<R, S>(self: &Arc<Self>, requests: R, responses: S, mode: DeliveryMode)
    where
        R: RequestStream + 'static,
        S: ResponseSink + 'static,
    {
        let session = Arc::clone(self);
        tokio::spawn(
            async move {
                tokio::select! {
                    () = session.teardown.cancelled() => {}
                    () = session.receive_loop(requests, &responses, mode) => {}
                }
                session.close();
            }
            .instrument(tracing::Span::current()),
        );
    }

    async fn receive_loop<R, S>(&self, mut requests: R, responses: &S, mode: DeliveryMode)
    where
        R: RequestStream,
        S: ResponseSink,
    {
        loop {
            let next = requests.recv().await;
            self.received.fetch_add(1, Ordering::Relaxed);

            match next {
                Err(status) => {
                    tracing::debug!(code = ?status.code(), message = status.message(), "Receive failed");
                    return;
                }
                Ok(None) => {
                    tracing::debug!("Client closed its send direction");
                    if matches!(mode, DeliveryMode::Stream | DeliveryMode::Once) {
                        // Half-close does not mean the client stopped reading.
                        responses.closed().await;
                        tracing::debug!("Client connection closed");
                    }
                    return;
                }
                Ok(Some(request)) => match (mode, request.request) {
                    (DeliveryMode::Poll, Some(subscribe_request::Request::Poll(_))) => {
                        self.prime_poll();
                    }
                    (DeliveryMode::Poll, other) => {
                        tracing::debug!(request = ?other, "Non-poll message in POLL mode");
                        return;
                    }
                    (_, other) => {
                        tracing::debug!(request = ?other, "Ignoring unexpected client message");
                    }
                },
            }
        }
    }

    fn prime_poll(&self) {
        let controls = self.controls.lock();
        let Some(polled) = &controls.polled else {
            return;
        };
        match polled.try_send(()) {
            Ok(()) | Err(mpsc::error::TrySendError::Closed(())) => {}
            Err(mpsc::error::TrySendError::Full(())) => {
                tracing::debug!("Poll already pending, coalescing");
            }
        }
    }

    async fn send_loop<S: ResponseSink>(
        &self,
        responses: &S,
        producer: &dyn Producer,
    ) -> Result<(), SessionError> {
        loop {
            let Ok(items) = self.queue.get(1).await else {
                tracing::debug!("Delivery queue disposed");
                return Ok(());
            };

            for item in items {
                let value = match item {
                    DeliveryItem::Value(value) => value,
                    DeliveryItem::EndOfBatch => {
                        tracing::debug!("Batch delivered");
                        return Ok(());
                    }
                };

                let response = value.to_response()?;
                if let Err(status) = responses.send(response).await {
                    tracing::debug!(code = ?status.code(), "Send failed");
                    producer.failed_send();
                    metrics::increment(Counter::SendFailure);
                    return Err(SessionError::Transport(status));
                }

                self.sent.fetch_add(1, Ordering::Relaxed);
                metrics::increment(Counter::MessageSent);
                producer.sent_one(&value);
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
