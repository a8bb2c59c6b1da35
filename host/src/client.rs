//! The unary client call.
//!
//! One function drives a complete RPC: acquire the runtime, intern the
//! channel, compose the six-op batch, wait out the deadline on a
//! per-call completion queue, and map the completion onto a payload or a
//! typed failure. Every exit path releases its resources; the queue is
//! shut down before returning so late completions go nowhere.

use crate::error::CallError;

use bytes::Bytes;
use rpc_core::{
    slot, Channel, ClientOp, Code, CompletionQueue, Event, Metadata, Runtime, Status,
};
use std::time::{Duration, Instant};

/// Default per-call deadline.
pub const DEFAULT_DEADLINE: Duration = Duration::from_secs(15);

const CALL_TAG: u64 = 1;

/// Per-call options.
#[derive(Debug, Clone)]
pub struct CallOptions {
    /// Ordered metadata sent with the request.
    pub metadata: Metadata,
    /// Wall-clock budget for the whole call.
    pub deadline: Duration,
}

impl Default for CallOptions {
    fn default() -> Self {
        Self {
            metadata: Metadata::new(),
            deadline: DEFAULT_DEADLINE,
        }
    }
}

impl CallOptions {
    /// Options with metadata given as a flat `[key, value, ...]` list, the
    /// shape scripting hosts pass. Odd-length lists are a configuration
    /// error.
    pub fn with_flat_metadata<S: AsRef<str>>(flat: &[S]) -> Result<Self, CallError> {
        let metadata = Metadata::from_flat(flat).map_err(|e| CallError::Config(e.to_string()))?;
        Ok(Self {
            metadata,
            ..Self::default()
        })
    }
}

/// Execute one unary RPC against `target`.
///
/// An empty `Ok` payload means the server replied OK without a message.
pub fn unary(
    target: &str,
    full_path: &str,
    request: &[u8],
    options: CallOptions,
) -> Result<Bytes, CallError> {
    let runtime = Runtime::acquire()?;
    let channel = Channel::insecure(&runtime, target);
    unary_on(&channel, full_path, request, options)
}

/// Execute one unary RPC on an existing channel.
pub fn unary_on(
    channel: &Channel,
    full_path: &str,
    request: &[u8],
    options: CallOptions,
) -> Result<Bytes, CallError> {
    if !full_path.starts_with('/') {
        return Err(CallError::Config(format!(
            "method path must start with '/': {}",
            full_path
        )));
    }

    let mut cq = CompletionQueue::new();
    let deadline = Instant::now() + options.deadline;
    let mut call = channel.create_call(&cq, full_path, deadline);

    let initial_metadata = slot();
    let response = slot();
    let status = slot();
    call.start_batch(
        vec![
            ClientOp::SendInitialMetadata(options.metadata),
            ClientOp::SendMessage(Bytes::copy_from_slice(request)),
            ClientOp::SendCloseFromClient,
            ClientOp::RecvInitialMetadata(initial_metadata),
            ClientOp::RecvMessage(response.clone()),
            ClientOp::RecvStatusOnClient(status.clone()),
        ],
        CALL_TAG,
    )
    .map_err(CallError::BatchStartFailed)?;
    tracing::trace!(target = %channel.target(), path = %full_path, "unary batch started");

    let outcome = match cq.next_before(deadline) {
        Event::Op {
            tag: CALL_TAG,
            success: true,
        } => {
            let status = status
                .lock()
                .take()
                .unwrap_or_else(|| Status::unknown("batch completed without a status"));
            if status.is_ok() {
                Ok(response.lock().take().unwrap_or_default())
            } else {
                Err(CallError::ServerStatus { status })
            }
        }
        Event::Op { .. } => Err(CallError::BatchFailed {
            status: status.lock().take(),
        }),
        Event::Timeout => {
            call.cancel_with_status(Code::Cancelled, "client cancelled due to timeout");
            Err(CallError::Deadline(options.deadline))
        }
        Event::Shutdown => Err(CallError::BatchFailed { status: None }),
    };

    // Late completions after a timeout have nowhere to go.
    cq.shutdown();
    if let Err(error) = &outcome {
        tracing::debug!(path = %full_path, %error, "unary call failed");
    }
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_deadline_is_fifteen_seconds() {
        assert_eq!(CallOptions::default().deadline, Duration::from_secs(15));
    }

    #[test]
    fn flat_metadata_options() {
        let options = CallOptions::with_flat_metadata(&["x-a", "1", "x-b", "2"]).unwrap();
        assert_eq!(options.metadata.len(), 2);

        let err = CallOptions::with_flat_metadata(&["x-a"]).unwrap_err();
        assert!(matches!(err, CallError::Config(_)));
    }

    #[test]
    fn relative_path_rejected_without_io() {
        let runtime = Runtime::acquire().unwrap();
        let channel = Channel::insecure(&runtime, "127.0.0.1:1");
        let err = unary_on(&channel, "no-slash", b"", CallOptions::default()).unwrap_err();
        assert!(matches!(err, CallError::Config(_)));
    }

    #[test]
    fn refused_connection_is_batch_failed() {
        let mut options = CallOptions::default();
        options.deadline = Duration::from_secs(5);
        let err = unary("127.0.0.1:9", "/svc/Method", b"payload", options).unwrap_err();
        match err {
            CallError::BatchFailed { status } => {
                let status = status.expect("connect failures carry a status");
                assert_eq!(status.code(), Code::Unavailable);
            }
            other => panic!("expected BatchFailed, got {}", other),
        }
    }
}
