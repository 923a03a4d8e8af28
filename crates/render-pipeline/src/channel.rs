//! Push and pull delivery over byte streams
//!
//! A push connection carries JSON requests in and response frames plus
//! notifications out, for as long as the client stays connected. A pull
//! connection carries exactly one request line in and the raw body out.

use crate::error::{PipelineError, Result};
use crate::notify::ChannelWriter;
use crate::protocol::{encode_frame, ChannelCodec, ImageRequest, WireMessage, DEFAULT_MAX_MESSAGE_LEN};
use crate::service::PipelineService;
use async_trait::async_trait;
use bytes::Bytes;
use futures::{Sink, SinkExt, StreamExt};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use tokio_util::codec::{Framed, LinesCodec};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Serializes writes to one connection. A failed write marks the
/// connection closed, which cancels every request still running on it.
pub struct SinkWriter<S> {
    sink: Mutex<S>,
    connection: CancellationToken,
}

impl<S> SinkWriter<S> {
    pub fn new(sink: S, connection: CancellationToken) -> Self {
        Self {
            sink: Mutex::new(sink),
            connection,
        }
    }
}

#[async_trait]
impl<S> ChannelWriter for SinkWriter<S>
where
    S: Sink<WireMessage, Error = PipelineError> + Unpin + Send,
{
    async fn send(&self, message: WireMessage) -> Result<()> {
        if self.connection.is_cancelled() {
            return Err(PipelineError::Channel("connection closed".to_string()));
        }
        let mut sink = self.sink.lock().await;
        if let Err(e) = sink.send(message).await {
            self.connection.cancel();
            return Err(PipelineError::Channel(e.to_string()));
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        !self.connection.is_cancelled()
    }
}

/// Run one push connection until the client disconnects or `shutdown` fires
pub async fn serve_push<T>(service: Arc<PipelineService>, stream: T, shutdown: &CancellationToken)
where
    T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let (sink, mut inbound) = Framed::new(stream, ChannelCodec::new()).split::<WireMessage>();
    let connection = shutdown.child_token();
    let writer: Arc<dyn ChannelWriter> = Arc::new(SinkWriter::new(sink, connection.clone()));
    let client = service.notifications().register(writer.clone());
    info!(client = %client, "push client connected");

    loop {
        tokio::select! {
            _ = connection.cancelled() => break,
            message = inbound.next() => match message {
                Some(Ok(WireMessage::Text(text))) => match ImageRequest::from_json(&text) {
                    Ok(request) => {
                        tokio::spawn(handle_push_request(
                            Arc::clone(&service),
                            Arc::clone(&writer),
                            request,
                            connection.child_token(),
                        ));
                    }
                    Err(e) => warn!(client = %client, error = %e, "ignoring malformed request"),
                },
                Some(Ok(WireMessage::Binary(data))) => {
                    debug!(client = %client, len = data.len(), "ignoring inbound binary message");
                }
                Some(Err(e)) => {
                    warn!(client = %client, error = %e, "push connection fault");
                    break;
                }
                None => break,
            }
        }
    }

    connection.cancel();
    service.notifications().unregister(&client);
    info!(client = %client, "push client disconnected");
}

async fn handle_push_request(
    service: Arc<PipelineService>,
    writer: Arc<dyn ChannelWriter>,
    request: ImageRequest,
    liveness: CancellationToken,
) {
    let payload = match service.fetch(&request, &liveness).await {
        Ok(payload) => payload,
        Err(PipelineError::Cancelled) => {
            debug!(request_id = request.request_id, file_id = %request.file_id, "request cancelled");
            return;
        }
        Err(e) => {
            warn!(request_id = request.request_id, error = %e, "request failed");
            Bytes::new()
        }
    };

    if liveness.is_cancelled() || !writer.is_open() {
        debug!(request_id = request.request_id, "connection gone, dropping frame");
        return;
    }
    let frame = encode_frame(request.request_id, &payload);
    if let Err(e) = writer.send(WireMessage::Binary(frame)).await {
        debug!(request_id = request.request_id, error = %e, "frame not delivered");
    }
}

/// Answer one pull request: a JSON line in, the raw body out, then close.
/// The client may half-close its write side after the request line. A read
/// error or a failed write means it went away, which cancels the request.
pub async fn serve_pull<T>(
    service: Arc<PipelineService>,
    stream: T,
    shutdown: &CancellationToken,
) -> Result<()>
where
    T: AsyncRead + AsyncWrite + Send + Unpin,
{
    let mut lines = Framed::new(stream, LinesCodec::new_with_max_length(DEFAULT_MAX_MESSAGE_LEN));
    let line = match lines.next().await {
        Some(Ok(line)) => line,
        Some(Err(e)) => return Err(PipelineError::Protocol(e.to_string())),
        None => return Ok(()),
    };
    let request = ImageRequest::from_pull_json(&line, service.config().pull_priority)?;
    let liveness = shutdown.child_token();

    let result = {
        let fetch = service.fetch(&request, &liveness);
        tokio::pin!(fetch);
        let mut reading = true;
        loop {
            tokio::select! {
                result = &mut fetch => break result,
                next = lines.next(), if reading => match next {
                    // Anything after the request line is ignored
                    Some(Ok(_)) => continue,
                    // Half-close: the request is complete
                    None => reading = false,
                    Some(Err(e)) => {
                        debug!(file_id = %request.file_id, error = %e, "pull connection fault");
                        liveness.cancel();
                        break Err(PipelineError::Cancelled);
                    }
                },
            }
        }
    };

    let payload = match result {
        Ok(payload) => payload,
        Err(PipelineError::Cancelled) => {
            debug!(file_id = %request.file_id, "pull client went away");
            return Ok(());
        }
        Err(e) => return Err(e),
    };

    let mut stream = lines.into_inner();
    if let Err(e) = stream.write_all(&payload).await {
        debug!(file_id = %request.file_id, error = %e, "pull client went away");
        return Ok(());
    }
    stream.shutdown().await?;
    debug!(file_id = %request.file_id, size = request.size, len = payload.len(), "pull request served");
    Ok(())
}
