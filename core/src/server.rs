//! Server primitives: port binding, call acceptance, per-call batches.
//!
//! The server side mirrors the client's batch model. The driving thread
//! asks for the next call with [`Server::request_call`], then runs two
//! batches against the accepted [`ServerCall`]: a *read* batch
//! (send-initial-metadata + recv-message) and a *send* batch
//! (recv-close-on-server + optional send-message + send-status). Each
//! batch posts one completion event; only one call is expected in flight
//! at a time.

use crate::error::CoreError;
use crate::frame::{encode_frame, FrameDecoder};
use crate::http2::{
    is_stream_reset, metadata_from_headers, metadata_into_headers, probe_reset, send_all,
};
use crate::metadata::{Metadata, Timeout};
use crate::queue::{CompletionQueue, CompletionSender, Tag};
use crate::runtime::Runtime;
use crate::status::Status;
use crate::{CancelSlot, MessageSlot};

use bytes::Bytes;
use http::header::CONTENT_TYPE;
use parking_lot::Mutex;
use std::net::TcpListener as StdTcpListener;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

/// Slot filled with the accepted call when a `request_call` completes.
pub type AcceptSlot = Arc<Mutex<Option<ServerCall>>>;

/// Wire-level details of an accepted call.
#[derive(Debug, Clone)]
pub struct CallDetails {
    /// Fully-qualified method path, e.g. `/pkg.Service/Method`.
    pub method: String,
    /// The `:authority` the client addressed.
    pub authority: String,
    /// Deadline propagated via `grpc-timeout`, if any.
    pub deadline: Option<Instant>,
}

/// One operation of a server batch.
pub enum ServerOp {
    SendInitialMetadata(Metadata),
    RecvMessage(MessageSlot),
    RecvCloseOnServer(CancelSlot),
    SendMessage(Bytes),
    SendStatusFromServer(Status),
}

struct CallIo {
    body: Option<h2::RecvStream>,
    respond: Option<h2::server::SendResponse<Bytes>>,
    send: Option<h2::SendStream<Bytes>>,
    cancelled: bool,
}

/// An accepted call. Owns the HTTP/2 stream handles until the send batch
/// completes; dropping the call resets anything still open.
pub struct ServerCall {
    details: CallDetails,
    metadata: Metadata,
    io: Arc<Mutex<CallIo>>,
    completions: CompletionSender,
    runtime: Runtime,
}

impl ServerCall {
    /// Call details captured at accept time.
    pub fn details(&self) -> &CallDetails {
        &self.details
    }

    /// Request metadata captured at accept time.
    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    /// Start a batch on this call.
    ///
    /// Two shapes are accepted, matching unary handling:
    /// send-initial-metadata + recv-message (the read batch), and
    /// recv-close-on-server + optional send-message + send-status-from-server
    /// (the send batch). Anything else is rejected without I/O.
    pub fn start_batch(&self, ops: Vec<ServerOp>, tag: Tag) -> Result<(), CoreError> {
        match Shape::of(ops)? {
            Shape::Read { initial_metadata, message } => {
                self.start_read(initial_metadata, message, tag);
            }
            Shape::Send { close, message, status } => {
                self.start_send(close, message, status, tag);
            }
        }
        Ok(())
    }

    fn start_read(&self, initial_metadata: Metadata, slot: MessageSlot, tag: Tag) {
        // Never fails to start: errors are reported through the event.
        let io = self.io.clone();
        let completions = self.completions.clone();
        let method = self.details.method.clone();
        self.runtime.spawn(async move {
            let (respond, mut body) = {
                let mut guard = io.lock();
                (guard.respond.take(), guard.body.take())
            };

            let mut success = true;
            let mut cancelled = false;
            let mut send = None;

            match respond {
                Some(mut respond) => match initial_metadata_response(&initial_metadata) {
                    Ok(response) => match respond.send_response(response, false) {
                        Ok(stream) => send = Some(stream),
                        Err(error) => {
                            tracing::debug!(%method, %error, "failed to send initial metadata");
                            cancelled |= is_stream_reset(&error);
                            success = false;
                        }
                    },
                    Err(()) => success = false,
                },
                None => success = false,
            }

            if success {
                match body.as_mut() {
                    Some(body) => match read_one_message(body).await {
                        Ok(message) => {
                            *slot.lock() = message;
                        }
                        Err(reset) => {
                            cancelled |= reset;
                            success = false;
                        }
                    },
                    None => success = false,
                }
            }

            {
                let mut guard = io.lock();
                guard.body = body;
                guard.send = send;
                guard.cancelled |= cancelled;
            }
            tracing::trace!(%method, tag, success, "read batch complete");
            completions.complete(tag, success);
        });
    }

    fn start_send(
        &self,
        close: CancelSlot,
        message: Option<Bytes>,
        status: Status,
        tag: Tag,
    ) {
        let io = self.io.clone();
        let completions = self.completions.clone();
        let method = self.details.method.clone();
        self.runtime.spawn(async move {
            let (body, respond, send, mut cancelled) = {
                let mut guard = io.lock();
                (
                    guard.body.take(),
                    guard.respond.take(),
                    guard.send.take(),
                    guard.cancelled,
                )
            };

            let mut success = true;
            let mut send = send;

            // recv-close-on-server: observe whether the client went away
            // before we commit the response.
            if let Some(stream) = send.as_mut() {
                if !cancelled && probe_reset(stream).await.is_some() {
                    cancelled = true;
                }
            }
            // The request half is done with.
            drop(body);

            if let Some(mut stream) = send.take() {
                if status.is_ok() {
                    if let Some(payload) = message {
                        if let Err(error) = send_all(&mut stream, encode_frame(&payload), false).await
                        {
                            tracing::debug!(%method, %error, "failed to send response message");
                            cancelled |= is_stream_reset(&error);
                            success = false;
                        }
                    }
                }
                if success {
                    if let Err(error) = stream.send_trailers(status.to_trailers()) {
                        tracing::debug!(%method, %error, "failed to send trailers");
                        cancelled |= is_stream_reset(&error);
                        success = false;
                    }
                }
            } else if let Some(mut respond) = respond {
                // Initial metadata never went out; send a trailers-only
                // response carrying the status.
                match trailers_only_response(&status) {
                    Ok(response) => {
                        if let Err(error) = respond.send_response(response, true) {
                            tracing::debug!(%method, %error, "failed to send trailers-only response");
                            cancelled |= is_stream_reset(&error);
                            success = false;
                        }
                    }
                    Err(()) => success = false,
                }
            } else {
                success = false;
            }

            *close.lock() = Some(cancelled);
            tracing::trace!(%method, tag, success, cancelled, "send batch complete");
            completions.complete(tag, success);
        });
    }
}

enum Shape {
    Read {
        initial_metadata: Metadata,
        message: MessageSlot,
    },
    Send {
        close: CancelSlot,
        message: Option<Bytes>,
        status: Status,
    },
}

impl Shape {
    fn of(ops: Vec<ServerOp>) -> Result<Shape, CoreError> {
        let mut ops = ops.into_iter();
        let shape = match (ops.next(), ops.next(), ops.next()) {
            (
                Some(ServerOp::SendInitialMetadata(initial_metadata)),
                Some(ServerOp::RecvMessage(message)),
                None,
            ) => Shape::Read {
                initial_metadata,
                message,
            },
            (
                Some(ServerOp::RecvCloseOnServer(close)),
                Some(ServerOp::SendMessage(payload)),
                Some(ServerOp::SendStatusFromServer(status)),
            ) => Shape::Send {
                close,
                message: Some(payload),
                status,
            },
            (
                Some(ServerOp::RecvCloseOnServer(close)),
                Some(ServerOp::SendStatusFromServer(status)),
                None,
            ) => Shape::Send {
                close,
                message: None,
                status,
            },
            _ => {
                return Err(CoreError::BatchRejected(
                    "server batch must be read (initial-metadata + recv-message) or send (recv-close [+ message] + status)",
                ))
            }
        };
        if ops.next().is_some() {
            return Err(CoreError::BatchRejected("trailing ops in server batch"));
        }
        Ok(shape)
    }
}

fn initial_metadata_response(metadata: &Metadata) -> Result<http::Response<()>, ()> {
    let mut response = http::Response::builder()
        .status(200)
        .header(CONTENT_TYPE, "application/grpc")
        .body(())
        .map_err(|_| ())?;
    metadata_into_headers(metadata, response.headers_mut()).map_err(|_| ())?;
    Ok(response)
}

fn trailers_only_response(status: &Status) -> Result<http::Response<()>, ()> {
    let mut response = http::Response::builder()
        .status(200)
        .header(CONTENT_TYPE, "application/grpc")
        .body(())
        .map_err(|_| ())?;
    for (name, value) in status.to_trailers().iter() {
        response.headers_mut().append(name.clone(), value.clone());
    }
    Ok(response)
}

/// Read a single framed message from the request stream.
///
/// `Ok(None)` means the client closed without a payload. `Err(reset)`
/// reports whether the failure was a client reset.
async fn read_one_message(body: &mut h2::RecvStream) -> Result<Option<Bytes>, bool> {
    let mut decoder = FrameDecoder::new();
    while let Some(chunk) = body.data().await {
        let chunk = match chunk {
            Ok(chunk) => chunk,
            Err(error) => return Err(is_stream_reset(&error)),
        };
        let _ = body.flow_control().release_capacity(chunk.len());
        decoder.push(&chunk);
        match decoder.next() {
            Ok(Some(message)) => return Ok(Some(message)),
            Ok(None) => {}
            Err(_) => return Err(false),
        }
    }
    Ok(None)
}

struct Incoming {
    head: http::request::Parts,
    body: h2::RecvStream,
    respond: h2::server::SendResponse<Bytes>,
}

struct PendingAccept {
    slot: AcceptSlot,
    tag: Tag,
}

/// A bound, running server instance.
pub struct Server {
    runtime: Runtime,
    completions: Option<CompletionSender>,
    listener: Option<StdTcpListener>,
    port: Option<u16>,
    pending_tx: Option<mpsc::UnboundedSender<PendingAccept>>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    conn_tasks: Arc<Mutex<Vec<JoinHandle<()>>>>,
    loop_tasks: Vec<JoinHandle<()>>,
    notified: bool,
}

impl Server {
    /// Create a server on the given runtime.
    pub fn new(runtime: &Runtime) -> Server {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Server {
            runtime: runtime.clone(),
            completions: None,
            listener: None,
            port: None,
            pending_tx: None,
            shutdown_tx,
            shutdown_rx,
            conn_tasks: Arc::new(Mutex::new(Vec::new())),
            loop_tasks: Vec::new(),
            notified: false,
        }
    }

    /// Bind the completion queue all batches and accepts report to.
    pub fn register_queue(&mut self, cq: &CompletionQueue) {
        self.completions = Some(cq.sender());
    }

    /// Bind a plaintext HTTP/2 port. `host:0` binds an ephemeral port; the
    /// port actually chosen is returned.
    pub fn add_insecure_port(&mut self, addr: &str) -> Result<u16, CoreError> {
        if self.listener.is_some() {
            return Err(CoreError::ServerState("port already bound"));
        }
        let listener = StdTcpListener::bind(addr)?;
        listener.set_nonblocking(true)?;
        let port = listener.local_addr()?.port();
        tracing::info!(%addr, port, "server bound");
        self.listener = Some(listener);
        self.port = Some(port);
        Ok(port)
    }

    /// The bound port, once [`add_insecure_port`](Self::add_insecure_port)
    /// has succeeded.
    pub fn port(&self) -> Option<u16> {
        self.port
    }

    /// Start accepting connections.
    pub fn start(&mut self) -> Result<(), CoreError> {
        let listener = self
            .listener
            .take()
            .ok_or(CoreError::ServerState("no port bound"))?;
        let completions = self
            .completions
            .clone()
            .ok_or(CoreError::ServerState("no completion queue registered"))?;

        let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();
        let (pending_tx, pending_rx) = mpsc::unbounded_channel();
        self.pending_tx = Some(pending_tx);

        self.loop_tasks.push(self.runtime.spawn(accept_loop(
            listener,
            incoming_tx,
            self.shutdown_rx.clone(),
            self.conn_tasks.clone(),
        )));
        self.loop_tasks.push(self.runtime.spawn(match_accepts(
            incoming_rx,
            pending_rx,
            completions,
            self.runtime.clone(),
            self.shutdown_rx.clone(),
        )));
        Ok(())
    }

    /// Ask for the next incoming call. When one arrives, `slot` is filled
    /// with the [`ServerCall`] and an event with `tag` is posted; at
    /// shutdown the event is posted with `success == false` instead.
    pub fn request_call(&self, slot: &AcceptSlot, tag: Tag) -> Result<(), CoreError> {
        let pending_tx = self
            .pending_tx
            .as_ref()
            .ok_or(CoreError::ServerState("server not started"))?;
        let pending = PendingAccept {
            slot: slot.clone(),
            tag,
        };
        if pending_tx.send(pending).is_err() {
            // Matcher already gone: report the failed accept directly.
            if let Some(completions) = &self.completions {
                completions.complete(tag, false);
            }
        }
        Ok(())
    }

    /// Stop accepting, fail outstanding accept requests, and post an event
    /// with `tag` once the accept machinery has wound down.
    pub fn shutdown_and_notify(&mut self, tag: Tag) {
        let completions = match &self.completions {
            Some(completions) => completions.clone(),
            None => return,
        };
        if self.notified {
            completions.complete(tag, true);
            return;
        }
        self.notified = true;
        tracing::info!("server shutting down");
        let _ = self.shutdown_tx.send(true);
        self.pending_tx = None;
        let tasks = std::mem::take(&mut self.loop_tasks);
        self.runtime.spawn(async move {
            for task in tasks {
                let _ = task.await;
            }
            completions.complete(tag, true);
        });
    }

    /// Hard-cancel every connection, resetting any in-flight call.
    pub fn cancel_all_calls(&self) {
        let mut tasks = self.conn_tasks.lock();
        tracing::debug!(connections = tasks.len(), "cancelling all calls");
        for task in tasks.drain(..) {
            task.abort();
        }
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(true);
        self.cancel_all_calls();
        for task in self.loop_tasks.drain(..) {
            task.abort();
        }
    }
}

async fn accept_loop(
    listener: StdTcpListener,
    incoming_tx: mpsc::UnboundedSender<Incoming>,
    mut shutdown: watch::Receiver<bool>,
    conn_tasks: Arc<Mutex<Vec<JoinHandle<()>>>>,
) {
    let listener = match TcpListener::from_std(listener) {
        Ok(listener) => listener,
        Err(error) => {
            tracing::warn!(%error, "failed to register listener with the runtime");
            return;
        }
    };
    loop {
        if *shutdown.borrow() {
            break;
        }
        tokio::select! {
            _ = shutdown.changed() => {}
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    tracing::trace!(%peer, "connection accepted");
                    let task = tokio::spawn(serve_connection(
                        stream,
                        incoming_tx.clone(),
                        shutdown.clone(),
                    ));
                    conn_tasks.lock().push(task);
                }
                Err(error) => {
                    tracing::warn!(%error, "accept failed");
                }
            }
        }
    }
    tracing::debug!("accept loop stopped");
}

async fn serve_connection(
    stream: TcpStream,
    incoming_tx: mpsc::UnboundedSender<Incoming>,
    mut shutdown: watch::Receiver<bool>,
) {
    let _ = stream.set_nodelay(true);
    let mut connection = match h2::server::handshake(stream).await {
        Ok(connection) => connection,
        Err(error) => {
            tracing::debug!(%error, "server handshake failed");
            return;
        }
    };
    loop {
        if *shutdown.borrow() {
            break;
        }
        tokio::select! {
            _ = shutdown.changed() => {}
            accepted = connection.accept() => match accepted {
                Some(Ok((request, respond))) => {
                    let (head, body) = request.into_parts();
                    if incoming_tx.send(Incoming { head, body, respond }).is_err() {
                        break;
                    }
                }
                Some(Err(error)) => {
                    tracing::debug!(%error, "connection error");
                    break;
                }
                None => break,
            }
        }
    }
}

async fn match_accepts(
    mut incoming_rx: mpsc::UnboundedReceiver<Incoming>,
    mut pending_rx: mpsc::UnboundedReceiver<PendingAccept>,
    completions: CompletionSender,
    runtime: Runtime,
    mut shutdown: watch::Receiver<bool>,
) {
    'outer: loop {
        if *shutdown.borrow() {
            break;
        }
        let pending = tokio::select! {
            _ = shutdown.changed() => continue,
            pending = pending_rx.recv() => match pending {
                Some(pending) => pending,
                None => break,
            },
        };
        let incoming = loop {
            if *shutdown.borrow() {
                completions.complete(pending.tag, false);
                break 'outer;
            }
            tokio::select! {
                _ = shutdown.changed() => {}
                incoming = incoming_rx.recv() => match incoming {
                    Some(incoming) => break incoming,
                    None => {
                        completions.complete(pending.tag, false);
                        break 'outer;
                    }
                },
            }
        };

        let call = accept_call(incoming, completions.clone(), runtime.clone());
        tracing::debug!(method = %call.details().method, "call accepted");
        *pending.slot.lock() = Some(call);
        completions.complete(pending.tag, true);
    }

    // Anything still queued can no longer be served.
    pending_rx.close();
    while let Ok(pending) = pending_rx.try_recv() {
        completions.complete(pending.tag, false);
    }
    tracing::debug!("accept matcher stopped");
}

fn accept_call(incoming: Incoming, completions: CompletionSender, runtime: Runtime) -> ServerCall {
    let Incoming { head, body, respond } = incoming;
    let deadline = head
        .headers
        .get("grpc-timeout")
        .and_then(|v| v.to_str().ok())
        .and_then(Timeout::parse)
        .map(|t| Instant::now() + t.as_duration());
    let authority = head
        .uri
        .authority()
        .map(|a| a.to_string())
        .unwrap_or_default();
    let details = CallDetails {
        method: head.uri.path().to_string(),
        authority,
        deadline,
    };
    let metadata = metadata_from_headers(&head.headers);
    ServerCall {
        details,
        metadata,
        io: Arc::new(Mutex::new(CallIo {
            body: Some(body),
            respond: Some(respond),
            send: None,
            cancelled: false,
        })),
        completions,
        runtime,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bind_ephemeral_port() {
        let runtime = Runtime::acquire().unwrap();
        let mut server = Server::new(&runtime);
        let port = server.add_insecure_port("127.0.0.1:0").unwrap();
        assert!(port > 0);
        assert_eq!(server.port(), Some(port));
    }

    #[test]
    fn double_bind_rejected() {
        let runtime = Runtime::acquire().unwrap();
        let mut server = Server::new(&runtime);
        server.add_insecure_port("127.0.0.1:0").unwrap();
        assert!(matches!(
            server.add_insecure_port("127.0.0.1:0"),
            Err(CoreError::ServerState(_))
        ));
    }

    #[test]
    fn bind_in_use_port_fails() {
        let runtime = Runtime::acquire().unwrap();
        let holder = StdTcpListener::bind("127.0.0.1:0").unwrap();
        let addr = holder.local_addr().unwrap();

        let mut server = Server::new(&runtime);
        // Rebinding the exact address must fail cleanly.
        let result = server.add_insecure_port(&addr.to_string());
        assert!(matches!(result, Err(CoreError::Io(_))));
    }

    #[test]
    fn start_requires_bind_and_queue() {
        let runtime = Runtime::acquire().unwrap();
        let mut server = Server::new(&runtime);
        assert!(server.start().is_err());

        let cq = CompletionQueue::new();
        server.register_queue(&cq);
        assert!(server.start().is_err());

        server.add_insecure_port("127.0.0.1:0").unwrap();
        server.start().unwrap();
    }

    #[test]
    fn request_call_before_start_rejected() {
        let runtime = Runtime::acquire().unwrap();
        let server = Server::new(&runtime);
        let slot: AcceptSlot = crate::slot();
        assert!(matches!(
            server.request_call(&slot, 1),
            Err(CoreError::ServerState(_))
        ));
    }

    #[test]
    fn shutdown_posts_tag_and_fails_pending_accept() {
        let runtime = Runtime::acquire().unwrap();
        let mut cq = CompletionQueue::new();
        let mut server = Server::new(&runtime);
        server.register_queue(&cq);
        server.add_insecure_port("127.0.0.1:0").unwrap();
        server.start().unwrap();

        let slot: AcceptSlot = crate::slot();
        server.request_call(&slot, 1).unwrap();
        server.shutdown_and_notify(99);

        let mut seen = Vec::new();
        for _ in 0..2 {
            match cq.next(std::time::Duration::from_secs(5)) {
                crate::queue::Event::Op { tag, success } => seen.push((tag, success)),
                other => panic!("unexpected event: {:?}", other),
            }
        }
        seen.sort_unstable();
        assert_eq!(seen, vec![(1, false), (99, true)]);
        assert!(slot.lock().is_none());
    }

    #[test]
    fn batch_shape_validation() {
        let bad = Shape::of(vec![ServerOp::SendMessage(Bytes::new())]);
        assert!(bad.is_err());

        let read = Shape::of(vec![
            ServerOp::SendInitialMetadata(Metadata::new()),
            ServerOp::RecvMessage(crate::slot()),
        ]);
        assert!(matches!(read, Ok(Shape::Read { .. })));

        let send = Shape::of(vec![
            ServerOp::RecvCloseOnServer(crate::slot()),
            ServerOp::SendStatusFromServer(Status::ok()),
        ]);
        assert!(matches!(send, Ok(Shape::Send { message: None, .. })));

        let send_full = Shape::of(vec![
            ServerOp::RecvCloseOnServer(crate::slot()),
            ServerOp::SendMessage(Bytes::from_static(b"r")),
            ServerOp::SendStatusFromServer(Status::ok()),
        ]);
        assert!(matches!(send_full, Ok(Shape::Send { message: Some(_), .. })));
    }
}
