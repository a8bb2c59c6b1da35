//! rpc-core - embedded gRPC runtime for blocking hosts.
//!
//! This crate provides the runtime layer a host embedding drives through
//! completion queues: a reference-counted runtime handle, client channels
//! and calls, server primitives, and the gRPC framing/status/metadata
//! types shared by both sides.
//!
//! # Architecture
//!
//! All I/O runs on a tokio runtime owned by the [`Runtime`] handle; the
//! surface exposed here is blocking. Work is submitted as *batches* of
//! send/receive operations tagged with a caller-chosen integer, and the
//! outcome of each batch is reported as a single event on a
//! [`CompletionQueue`]. Received payloads and status are delivered through
//! shared slots filled by the batch before its completion event is posted.
//!
//! The wire format is gRPC over HTTP/2 (`h2`): length-prefixed messages,
//! `grpc-status`/`grpc-message` trailers, and `grpc-timeout` deadline
//! propagation. Only unary calls are composed here.

mod client;
mod error;
mod frame;
mod http2;
mod metadata;
mod queue;
mod runtime;
mod server;
mod status;

pub use client::{Call, Channel, ClientOp};
pub use error::CoreError;
pub use frame::{FrameDecoder, FrameError, encode_frame, DEFAULT_MAX_MESSAGE, FRAME_HEADER_LEN};
pub use metadata::{Metadata, Timeout};
pub use queue::{CompletionQueue, CompletionSender, Event, Tag};
pub use runtime::Runtime;
pub use server::{AcceptSlot, CallDetails, Server, ServerCall, ServerOp};
pub use status::{Code, Status};

use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::Arc;

/// Slot filled with the received message bytes, if any.
pub type MessageSlot = Arc<Mutex<Option<Bytes>>>;
/// Slot filled with received metadata.
pub type MetadataSlot = Arc<Mutex<Option<Metadata>>>;
/// Slot filled with the final status of a call.
pub type StatusSlot = Arc<Mutex<Option<Status>>>;
/// Slot filled with the client-cancellation flag on the server side.
pub type CancelSlot = Arc<Mutex<Option<bool>>>;

/// Create an empty slot.
pub fn slot<T>() -> Arc<Mutex<Option<T>>> {
    Arc::new(Mutex::new(None))
}
