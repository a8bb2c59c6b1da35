//! Host-side error taxonomy.

use rpc_core::{CoreError, Status};
use rpc_proto::CodecError;
use std::time::Duration;

/// An error raised by a host handler. The message becomes the status
/// details the client sees under `INTERNAL`.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{0}")]
pub struct HandlerError(pub String);

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        HandlerError(message.into())
    }
}

impl From<CodecError> for HandlerError {
    fn from(e: CodecError) -> Self {
        HandlerError(e.to_string())
    }
}

/// Failures of a single client call.
#[derive(Debug, thiserror::Error)]
pub enum CallError {
    /// Invalid call setup (odd metadata list, bad method name).
    #[error("invalid call configuration: {0}")]
    Config(String),

    /// The message handed to a stub is not of the method's request type.
    /// Detected before any network I/O.
    #[error("wrong request type for {method}: expected {expected}, got {got}")]
    WrongRequestType {
        method: String,
        expected: String,
        got: String,
    },

    /// Message encoding or decoding failed.
    #[error(transparent)]
    Codec(#[from] CodecError),

    /// The runtime rejected the operation batch outright.
    #[error("failed to start call batch: {0}")]
    BatchStartFailed(#[source] CoreError),

    /// Client-side setup failure (runtime start, channel).
    #[error("transport failure: {0}")]
    Transport(#[from] CoreError),

    /// The per-call deadline elapsed; the call was cancelled with
    /// CANCELLED.
    #[error("deadline of {0:?} exceeded, call cancelled")]
    Deadline(Duration),

    /// The server answered with a non-OK status.
    #[error("server returned {status}")]
    ServerStatus { status: Status },

    /// The batch failed at the transport level.
    #[error(
        "call batch failed{}",
        .status.as_ref().map(|s| format!(" ({})", s)).unwrap_or_default()
    )]
    BatchFailed { status: Option<Status> },
}

/// Failures of the server loop.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    /// Bad dispatch-table or server setup.
    #[error("server configuration: {0}")]
    Config(String),

    /// The bind address could not be claimed.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: CoreError,
    },

    /// Runtime or accept machinery failure.
    #[error("transport failure: {0}")]
    Transport(#[from] CoreError),
}
