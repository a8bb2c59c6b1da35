//! Error type for runtime operations.

use std::fmt;
use std::io;

/// Errors surfaced by the runtime facade itself.
///
/// Transport failures inside a running batch are not reported here; they
/// complete the batch with `success == false` and a best-effort status in
/// the status slot, mirroring how the completion-queue model reports
/// failures.
#[derive(Debug)]
pub enum CoreError {
    /// Socket-level failure (bind, listen).
    Io(io::Error),
    /// The runtime could not be started.
    Runtime(io::Error),
    /// Malformed metadata supplied by the host.
    Metadata(String),
    /// The operation batch was rejected before starting.
    BatchRejected(&'static str),
    /// A server primitive was used in the wrong state.
    ServerState(&'static str),
}

impl fmt::Display for CoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CoreError::Io(e) => write!(f, "i/o error: {}", e),
            CoreError::Runtime(e) => write!(f, "runtime start failed: {}", e),
            CoreError::Metadata(msg) => write!(f, "invalid metadata: {}", msg),
            CoreError::BatchRejected(msg) => write!(f, "batch rejected: {}", msg),
            CoreError::ServerState(msg) => write!(f, "invalid server state: {}", msg),
        }
    }
}

impl std::error::Error for CoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CoreError::Io(e) | CoreError::Runtime(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for CoreError {
    fn from(e: io::Error) -> Self {
        CoreError::Io(e)
    }
}
