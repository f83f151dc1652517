//! Stream port adapters for tonic and tokio channels.

use async_trait::async_trait;
use tokio::sync::mpsc;
use tonic::{Status, Streaming};

use crate::application::ports::{RequestStream, ResponseSink};
use crate::proto::{SubscribeRequest, SubscribeResponse};

/// Items of a subscribe response stream.
pub type ResponseItem = Result<SubscribeResponse, Status>;

#[async_trait]
impl RequestStream for Streaming<SubscribeRequest> {
    async fn recv(&mut self) -> Result<Option<SubscribeRequest>, Status> {
        self.message().await
    }
}

#[async_trait]
impl RequestStream for mpsc::Receiver<Result<SubscribeRequest, Status>> {
    async fn recv(&mut self) -> Result<Option<SubscribeRequest>, Status> {
        mpsc::Receiver::recv(self).await.transpose()
    }
}

#[async_trait]
impl ResponseSink for mpsc::Sender<ResponseItem> {
    async fn send(&self, response: SubscribeResponse) -> Result<(), Status> {
        mpsc::Sender::send(self, Ok(response))
            .await
            .map_err(|_| Status::cancelled("client is no longer reading the stream"))
    }

    async fn closed(&self) {
        mpsc::Sender::closed(self).await;
    }
}

#[cfg(test)]
mod tests {
    use tonic::Code;

    use super::*;

    #[tokio::test]
    async fn channel_request_stream_ends_with_none() {
        let (tx, mut rx) = mpsc::channel(2);
        tx.send(Ok(SubscribeRequest::default())).await.unwrap();
        tx.send(Err(Status::unavailable("reset"))).await.unwrap();
        drop(tx);

        assert!(RequestStream::recv(&mut rx).await.unwrap().is_some());
        assert_eq!(
            RequestStream::recv(&mut rx).await.unwrap_err().code(),
            Code::Unavailable
        );
        assert!(RequestStream::recv(&mut rx).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn sink_fails_once_reader_is_gone() {
        let (tx, rx) = mpsc::channel::<ResponseItem>(1);
        drop(rx);

        ResponseSink::closed(&tx).await;
        let err = ResponseSink::send(&tx, SubscribeResponse::default())
            .await
            .unwrap_err();
        assert_eq!(err.code(), Code::Cancelled);
    }
}
