//! Client channels and unary calls.
//!
//! A [`Channel`] is a shared handle to one `host:port` target; channels
//! are interned process-wide so every stub built against the same target
//! string shares the underlying HTTP/2 connection. A [`Call`] executes a
//! single unary exchange as one batch of six operations and reports the
//! outcome through the completion queue the call was created against.

use crate::error::CoreError;
use crate::frame::{encode_frame, FrameDecoder};
use crate::http2::{h2_error_to_status, metadata_from_headers, metadata_into_headers, send_all};
use crate::metadata::{Metadata, Timeout};
use crate::queue::{CompletionQueue, CompletionSender, Tag};
use crate::runtime::Runtime;
use crate::status::{Code, Status};
use crate::{MessageSlot, MetadataSlot, StatusSlot};

use bytes::Bytes;
use http::header::CONTENT_TYPE;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::Instant;
use tokio::net::TcpStream;
use tokio::sync::Notify;

fn registry() -> &'static Mutex<HashMap<String, Weak<ChannelInner>>> {
    static REGISTRY: OnceLock<Mutex<HashMap<String, Weak<ChannelInner>>>> = OnceLock::new();
    REGISTRY.get_or_init(|| Mutex::new(HashMap::new()))
}

struct ChannelInner {
    target: String,
    runtime: Runtime,
    // Lazily established; cleared and re-dialed when a send fails readiness.
    sender: tokio::sync::Mutex<Option<h2::client::SendRequest<Bytes>>>,
}

impl Drop for ChannelInner {
    fn drop(&mut self) {
        let mut registry = registry().lock();
        if let Some(entry) = registry.get(&self.target) {
            if entry.upgrade().is_none() {
                registry.remove(&self.target);
            }
        }
    }
}

/// Shared handle to a connection target. Insecure (plaintext HTTP/2) only;
/// TLS credentials are an extension point outside this runtime.
#[derive(Clone)]
pub struct Channel {
    inner: Arc<ChannelInner>,
}

impl Channel {
    /// Get the channel for `target`, reusing a live one when the same
    /// target string is already held elsewhere in the process.
    pub fn insecure(runtime: &Runtime, target: &str) -> Channel {
        let mut registry = registry().lock();
        if let Some(inner) = registry.get(target).and_then(Weak::upgrade) {
            return Channel { inner };
        }
        let inner = Arc::new(ChannelInner {
            target: target.to_string(),
            runtime: runtime.clone(),
            sender: tokio::sync::Mutex::new(None),
        });
        registry.insert(target.to_string(), Arc::downgrade(&inner));
        Channel { inner }
    }

    /// The `host:port` this channel dials.
    pub fn target(&self) -> &str {
        &self.inner.target
    }

    /// Create a unary call against this channel.
    ///
    /// The call completes onto `cq` and is bounded by `deadline`; the
    /// deadline is also propagated to the server via `grpc-timeout`.
    pub fn create_call(&self, cq: &CompletionQueue, path: &str, deadline: Instant) -> Call {
        Call {
            channel: self.inner.clone(),
            path: path.to_string(),
            deadline,
            completions: cq.sender(),
            cancel: Arc::new(CancelState::default()),
            status_slot: None,
            started: false,
        }
    }
}

/// One operation of a client batch. A unary call submits exactly the six
/// ops below, in this order, as a single batch.
pub enum ClientOp {
    SendInitialMetadata(Metadata),
    SendMessage(Bytes),
    SendCloseFromClient,
    RecvInitialMetadata(MetadataSlot),
    RecvMessage(MessageSlot),
    RecvStatusOnClient(StatusSlot),
}

#[derive(Default)]
struct CancelState {
    notify: Notify,
    fired: AtomicBool,
}

/// A single unary call in flight.
pub struct Call {
    channel: Arc<ChannelInner>,
    path: String,
    deadline: Instant,
    completions: CompletionSender,
    cancel: Arc<CancelState>,
    status_slot: Option<StatusSlot>,
    started: bool,
}

impl Call {
    /// The wire-level method path.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Start the unary batch. The batch must be exactly
    /// send-initial-metadata, send-message, send-close-from-client,
    /// recv-initial-metadata, recv-message, recv-status-on-client, in that
    /// order; anything else is rejected before any I/O happens.
    pub fn start_batch(&mut self, ops: Vec<ClientOp>, tag: Tag) -> Result<(), CoreError> {
        if self.started {
            return Err(CoreError::BatchRejected("call already has a batch in flight"));
        }
        let parts = UnaryParts::from_ops(ops)?;
        self.started = true;
        self.status_slot = Some(parts.status.clone());

        let channel = self.channel.clone();
        let path = self.path.clone();
        let deadline = self.deadline;
        let cancel = self.cancel.clone();
        let completions = self.completions.clone();
        tracing::trace!(path = %self.path, tag, "starting unary batch");
        self.channel.runtime.spawn(async move {
            let success = tokio::select! {
                success = run_unary(channel, path, deadline, &parts) => success,
                // Dropping the exchange future resets the HTTP/2 stream.
                _ = cancel.notify.notified() => false,
            };
            completions.complete(tag, success);
        });
        Ok(())
    }

    /// Cancel the call, recording `code` and `details` as its status if no
    /// status has been received yet. Safe to call at any point; the remote
    /// stream is reset if the exchange is still in flight.
    pub fn cancel_with_status(&self, code: Code, details: &str) {
        if self.cancel.fired.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::debug!(path = %self.path, code = %code, "cancelling call");
        if let Some(slot) = &self.status_slot {
            slot.lock().get_or_insert(Status::new(code, details));
        }
        self.cancel.notify.notify_one();
    }
}

struct UnaryParts {
    metadata: Metadata,
    message: Bytes,
    initial_metadata: MetadataSlot,
    response: MessageSlot,
    status: StatusSlot,
}

impl UnaryParts {
    fn from_ops(ops: Vec<ClientOp>) -> Result<UnaryParts, CoreError> {
        let mut ops = ops.into_iter();
        let batch = match (
            ops.next(),
            ops.next(),
            ops.next(),
            ops.next(),
            ops.next(),
            ops.next(),
        ) {
            (
                Some(ClientOp::SendInitialMetadata(metadata)),
                Some(ClientOp::SendMessage(message)),
                Some(ClientOp::SendCloseFromClient),
                Some(ClientOp::RecvInitialMetadata(initial_metadata)),
                Some(ClientOp::RecvMessage(response)),
                Some(ClientOp::RecvStatusOnClient(status)),
            ) => UnaryParts {
                metadata,
                message,
                initial_metadata,
                response,
                status,
            },
            _ => return Err(CoreError::BatchRejected("unary batch must be the six canonical ops")),
        };
        if ops.next().is_some() {
            return Err(CoreError::BatchRejected("unary batch must be the six canonical ops"));
        }
        Ok(batch)
    }
}

fn fill_status(slot: &StatusSlot, status: Status) {
    slot.lock().get_or_insert(status);
}

async fn ready_sender(
    channel: &ChannelInner,
) -> Result<h2::client::SendRequest<Bytes>, Status> {
    let mut guard = channel.sender.lock().await;
    if let Some(sender) = guard.clone() {
        match sender.ready().await {
            Ok(ready) => return Ok(ready),
            Err(error) => {
                tracing::debug!(target = %channel.target, %error, "cached connection stale, re-dialing");
                *guard = None;
            }
        }
    }
    let stream = TcpStream::connect(&channel.target).await.map_err(|e| {
        Status::unavailable(format!("failed to connect to {}: {}", channel.target, e))
    })?;
    let _ = stream.set_nodelay(true);
    let (sender, connection) = h2::client::handshake(stream).await.map_err(|e| {
        Status::unavailable(format!("http/2 handshake with {} failed: {}", channel.target, e))
    })?;
    tokio::spawn({
        let target = channel.target.clone();
        async move {
            if let Err(error) = connection.await {
                tracing::debug!(%target, %error, "client connection terminated");
            }
        }
    });
    *guard = Some(sender.clone());
    sender
        .ready()
        .await
        .map_err(|e| Status::unavailable(format!("connection to {} not ready: {}", channel.target, e)))
}

/// Run the six-op exchange. Returns the batch success flag; the receive
/// slots are filled with whatever arrived before completion or failure.
async fn run_unary(
    channel: Arc<ChannelInner>,
    path: String,
    deadline: Instant,
    parts: &UnaryParts,
) -> bool {
    let mut sender = match ready_sender(&channel).await {
        Ok(sender) => sender,
        Err(status) => {
            fill_status(&parts.status, status);
            return false;
        }
    };

    let timeout = Timeout::from_duration(deadline.saturating_duration_since(Instant::now()));
    let request = http::Request::builder()
        .method(http::Method::POST)
        .version(http::Version::HTTP_2)
        .uri(format!("http://{}{}", channel.target, path))
        .header(CONTENT_TYPE, "application/grpc")
        .header("te", "trailers")
        .header("grpc-timeout", timeout.to_grpc_format())
        .body(());
    let mut request = match request {
        Ok(request) => request,
        Err(error) => {
            fill_status(&parts.status, Status::internal(format!("invalid request: {}", error)));
            return false;
        }
    };
    if let Err(status) = metadata_into_headers(&parts.metadata, request.headers_mut()) {
        fill_status(&parts.status, status);
        return false;
    }

    // send-initial-metadata happens with the request headers; send-message
    // and send-close-from-client are the framed payload with END_STREAM.
    let (response, mut request_stream) = match sender.send_request(request, false) {
        Ok(pair) => pair,
        Err(error) => {
            fill_status(&parts.status, h2_error_to_status(&error));
            return false;
        }
    };
    if let Err(error) = send_all(&mut request_stream, encode_frame(&parts.message), true).await {
        fill_status(&parts.status, h2_error_to_status(&error));
        return false;
    }

    let response = match response.await {
        Ok(response) => response,
        Err(error) => {
            fill_status(&parts.status, h2_error_to_status(&error));
            return false;
        }
    };
    let (head, mut body) = response.into_parts();

    // Trailers-only response: the status arrives with the headers and no
    // message follows.
    if let Some(status) = Status::from_trailers(&head.headers) {
        parts.initial_metadata.lock().get_or_insert(Metadata::new());
        fill_status(&parts.status, status);
        return true;
    }
    parts
        .initial_metadata
        .lock()
        .get_or_insert(metadata_from_headers(&head.headers));

    let mut decoder = FrameDecoder::new();
    while let Some(chunk) = body.data().await {
        let chunk = match chunk {
            Ok(chunk) => chunk,
            Err(error) => {
                fill_status(&parts.status, h2_error_to_status(&error));
                return false;
            }
        };
        let _ = body.flow_control().release_capacity(chunk.len());
        decoder.push(&chunk);
        match decoder.next() {
            Ok(Some(message)) => {
                parts.response.lock().get_or_insert(message);
            }
            Ok(None) => {}
            Err(error) => {
                fill_status(&parts.status, Status::internal(error.to_string()));
                return false;
            }
        }
    }

    let trailers = match body.trailers().await {
        Ok(trailers) => trailers,
        Err(error) => {
            fill_status(&parts.status, h2_error_to_status(&error));
            return false;
        }
    };
    let status = trailers
        .as_ref()
        .and_then(Status::from_trailers)
        .unwrap_or_else(|| Status::unknown("server sent no grpc-status"));
    tracing::trace!(%path, code = %status.code(), "unary exchange complete");
    fill_status(&parts.status, status);
    true
}
