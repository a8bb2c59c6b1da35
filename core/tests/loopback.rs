//! Loopback tests driving the server and client halves of the runtime
//! against each other over real sockets.

use bytes::Bytes;
use rpc_core::{
    slot, AcceptSlot, CancelSlot, Channel, ClientOp, Code, CompletionQueue, Event, Metadata,
    MessageSlot, MetadataSlot, Runtime, Server, ServerOp, Status, StatusSlot,
};
use std::thread;
use std::time::{Duration, Instant};

const TAG_ACCEPT: u64 = 1;
const TAG_READ: u64 = 2;
const TAG_SEND: u64 = 3;
const TAG_SHUTDOWN: u64 = 99;

/// What the loopback server should do with each accepted call.
#[derive(Clone, Copy)]
enum Behavior {
    /// Echo the request payload with OK.
    Echo,
    /// Reply OK without sending any message.
    OkEmpty,
    /// Respond with the given status and no message.
    Fail(Code),
    /// Echo the value of the `x-trace` request metadata key.
    EchoTraceMetadata,
    /// Sleep before responding, to let client deadlines fire.
    SlowEcho(Duration),
}

struct CallOutcome {
    cancelled: bool,
    method: String,
}

/// Serve `behaviors.len()` calls, then shut down. Returns the bound port
/// and a handle yielding per-call outcomes.
fn serve(behaviors: Vec<Behavior>) -> (u16, thread::JoinHandle<Vec<CallOutcome>>) {
    let runtime = Runtime::acquire().unwrap();
    let mut server = Server::new(&runtime);
    let mut cq = CompletionQueue::new();
    server.register_queue(&cq);
    let port = server.add_insecure_port("127.0.0.1:0").unwrap();
    server.start().unwrap();

    let handle = thread::spawn(move || {
        let mut outcomes = Vec::new();
        for behavior in behaviors {
            let accept: AcceptSlot = slot();
            server.request_call(&accept, TAG_ACCEPT).unwrap();
            wait_for(&mut cq, TAG_ACCEPT);
            let call = accept.lock().take().expect("accept slot filled");
            let method = call.details().method.clone();

            let message: MessageSlot = slot();
            call.start_batch(
                vec![
                    ServerOp::SendInitialMetadata(Metadata::new()),
                    ServerOp::RecvMessage(message.clone()),
                ],
                TAG_READ,
            )
            .unwrap();
            wait_for(&mut cq, TAG_READ);
            let payload = message.lock().take().unwrap_or_default();

            let (status, response) = match behavior {
                Behavior::Echo => (Status::ok(), Some(payload)),
                Behavior::OkEmpty => (Status::ok(), None),
                Behavior::Fail(code) => (Status::new(code, "scripted failure"), None),
                Behavior::EchoTraceMetadata => {
                    let value = call.metadata().get("x-trace").unwrap_or("").to_string();
                    (Status::ok(), Some(Bytes::from(value)))
                }
                Behavior::SlowEcho(delay) => {
                    thread::sleep(delay);
                    (Status::ok(), Some(payload))
                }
            };

            let close: CancelSlot = slot();
            let mut ops = vec![ServerOp::RecvCloseOnServer(close.clone())];
            if status.is_ok() {
                if let Some(response) = response {
                    ops.push(ServerOp::SendMessage(response));
                }
            }
            ops.push(ServerOp::SendStatusFromServer(status));
            call.start_batch(ops, TAG_SEND).unwrap();
            wait_for(&mut cq, TAG_SEND);

            outcomes.push(CallOutcome {
                cancelled: close.lock().take().unwrap_or(false),
                method,
            });
        }
        server.shutdown_and_notify(TAG_SHUTDOWN);
        wait_for(&mut cq, TAG_SHUTDOWN);
        outcomes
    });
    (port, handle)
}

fn wait_for(cq: &mut CompletionQueue, tag: u64) -> bool {
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        match cq.next(Duration::from_millis(200)) {
            Event::Op { tag: seen, success } if seen == tag => return success,
            Event::Op { .. } => {}
            Event::Timeout => assert!(Instant::now() < deadline, "timed out waiting for tag {}", tag),
            Event::Shutdown => panic!("queue shut down waiting for tag {}", tag),
        }
    }
}

struct UnaryResult {
    success: bool,
    timed_out: bool,
    response: Option<Bytes>,
    initial_metadata: Option<Metadata>,
    status: Option<Status>,
}

fn unary(port: u16, path: &str, payload: &[u8], metadata: Metadata, timeout: Duration) -> UnaryResult {
    let runtime = Runtime::acquire().unwrap();
    let channel = Channel::insecure(&runtime, &format!("127.0.0.1:{}", port));
    let mut cq = CompletionQueue::new();
    let deadline = Instant::now() + timeout;
    let mut call = channel.create_call(&cq, path, deadline);

    let initial_metadata: MetadataSlot = slot();
    let response: MessageSlot = slot();
    let status: StatusSlot = slot();
    call.start_batch(
        vec![
            ClientOp::SendInitialMetadata(metadata),
            ClientOp::SendMessage(Bytes::copy_from_slice(payload)),
            ClientOp::SendCloseFromClient,
            ClientOp::RecvInitialMetadata(initial_metadata.clone()),
            ClientOp::RecvMessage(response.clone()),
            ClientOp::RecvStatusOnClient(status.clone()),
        ],
        1,
    )
    .unwrap();

    match cq.next_before(deadline) {
        Event::Op { tag: 1, success } => UnaryResult {
            success,
            timed_out: false,
            response: response.lock().take(),
            initial_metadata: initial_metadata.lock().take(),
            status: status.lock().take(),
        },
        Event::Timeout => {
            call.cancel_with_status(Code::Cancelled, "client cancelled due to timeout");
            UnaryResult {
                success: false,
                timed_out: true,
                response: None,
                initial_metadata: None,
                status: status.lock().take(),
            }
        }
        other => panic!("unexpected event: {:?}", other),
    }
}

#[test]
fn echo_roundtrip() {
    let (port, server) = serve(vec![Behavior::Echo]);
    let result = unary(port, "/test.Echo/Ping", b"hello loopback", Metadata::new(), Duration::from_secs(5));

    assert!(result.success);
    assert!(!result.timed_out);
    assert_eq!(result.response.as_deref(), Some(&b"hello loopback"[..]));
    let status = result.status.unwrap();
    assert!(status.is_ok());
    assert!(result.initial_metadata.is_some());

    let outcomes = server.join().unwrap();
    assert_eq!(outcomes.len(), 1);
    assert!(!outcomes[0].cancelled);
    assert_eq!(outcomes[0].method, "/test.Echo/Ping");
}

#[test]
fn empty_payload_roundtrip() {
    let (port, server) = serve(vec![Behavior::Echo]);
    let result = unary(port, "/test.Echo/Ping", b"", Metadata::new(), Duration::from_secs(5));

    assert!(result.success);
    // An empty message is still a message: the echo comes back empty.
    assert_eq!(result.response.as_deref(), Some(&b""[..]));
    assert!(result.status.unwrap().is_ok());
    server.join().unwrap();
}

#[test]
fn ok_without_message_yields_no_payload() {
    let (port, server) = serve(vec![Behavior::OkEmpty]);
    let result = unary(port, "/test.Echo/Void", b"request", Metadata::new(), Duration::from_secs(5));

    assert!(result.success);
    assert!(result.response.is_none(), "OK with no message leaves the slot empty");
    assert!(result.status.unwrap().is_ok());
    server.join().unwrap();
}

#[test]
fn non_ok_status_carries_details() {
    let (port, server) = serve(vec![Behavior::Fail(Code::NotFound)]);
    let result = unary(port, "/test.Echo/Missing", b"x", Metadata::new(), Duration::from_secs(5));

    assert!(result.success, "batch itself completes when server sends a status");
    assert!(result.response.is_none());
    let status = result.status.unwrap();
    assert_eq!(status.code(), Code::NotFound);
    assert_eq!(status.details(), "scripted failure");
    server.join().unwrap();
}

#[test]
fn metadata_reaches_server_in_order() {
    let (port, server) = serve(vec![Behavior::EchoTraceMetadata]);
    let metadata = Metadata::from_flat(&["x-trace", "abc-123", "x-other", "zzz"]).unwrap();
    let result = unary(port, "/test.Echo/Trace", b"", metadata, Duration::from_secs(5));

    assert!(result.success);
    assert_eq!(result.response.as_deref(), Some(&b"abc-123"[..]));
    server.join().unwrap();
}

#[test]
fn deadline_cancels_and_server_observes_it() {
    let (port, server) = serve(vec![Behavior::SlowEcho(Duration::from_millis(1500))]);
    let result = unary(
        port,
        "/test.Echo/Slow",
        b"take your time",
        Metadata::new(),
        Duration::from_millis(200),
    );

    assert!(result.timed_out);
    assert!(!result.success);
    let status = result.status.unwrap();
    assert_eq!(status.code(), Code::Cancelled);

    let outcomes = server.join().unwrap();
    assert!(outcomes[0].cancelled, "server should see the client cancellation");
}

#[test]
fn consecutive_calls_share_the_connection() {
    let (port, server) = serve(vec![Behavior::Echo, Behavior::Echo, Behavior::Echo]);
    for i in 0..3u8 {
        let payload = vec![i; 4];
        let result = unary(port, "/test.Echo/Ping", &payload, Metadata::new(), Duration::from_secs(5));
        assert!(result.success);
        assert_eq!(result.response.as_deref(), Some(&payload[..]));
    }
    let outcomes = server.join().unwrap();
    assert_eq!(outcomes.len(), 3);
    assert!(outcomes.iter().all(|o| !o.cancelled));
}
