//! gNMI Subscribe Service Implementation

use std::pin::Pin;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_stream::Stream;
use tokio_stream::wrappers::ReceiverStream;
use tonic::{Request, Response, Status, Streaming};

use super::stream::ResponseItem;
use crate::application::admission::ConnectionManager;
use crate::application::ports::ProducerFactory;
use crate::application::session::Session;
use crate::proto::SubscribeRequest;
use crate::proto::g_nmi_server::GNmi;

/// Responses buffered between a session and the transport.
const RESPONSE_BUFFER: usize = 64;

type BoxedStream = Pin<Box<dyn Stream<Item = ResponseItem> + Send>>;

/// The gNMI service: one session per `Subscribe` call.
pub struct TelemetryServer {
    admission: Arc<ConnectionManager>,
    producers: Arc<dyn ProducerFactory>,
    queue_capacity: usize,
}

impl TelemetryServer {
    /// Create the service.
    #[must_use]
    pub fn new(
        admission: Arc<ConnectionManager>,
        producers: Arc<dyn ProducerFactory>,
        queue_capacity: usize,
    ) -> Self {
        Self {
            admission,
            producers,
            queue_capacity,
        }
    }

    /// Admission controller shared by every session.
    #[must_use]
    pub fn admission(&self) -> &Arc<ConnectionManager> {
        &self.admission
    }
}

#[tonic::async_trait]
impl GNmi for TelemetryServer {
    type SubscribeStream = BoxedStream;

    async fn subscribe(
        &self,
        request: Request<Streaming<SubscribeRequest>>,
    ) -> Result<Response<Self::SubscribeStream>, Status> {
        let peer = request
            .remote_addr()
            .map_or_else(|| "unknown".to_string(), |addr| addr.to_string());
        let requests = request.into_inner();

        let session = Session::new(
            peer,
            Arc::clone(&self.admission),
            Arc::clone(&self.producers),
            self.queue_capacity,
        );

        let (tx, rx) = mpsc::channel(RESPONSE_BUFFER);
        let responses = tx.clone();
        tokio::spawn(async move {
            if let Err(e) = session.run(requests, responses).await {
                // The client may already be gone.
                let _ = tx.send(Err(e.into())).await;
            }
        });

        Ok(Response::new(Box::pin(ReceiverStream::new(rx))))
    }
}
