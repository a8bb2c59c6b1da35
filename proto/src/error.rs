//! Parser error types.

use crate::codec::CodecError;
use std::path::PathBuf;

/// Errors building a method table from a `.proto` file.
#[derive(Debug, thiserror::Error)]
pub enum ProtoError {
    /// The file could not be read.
    #[error("cannot read proto file {}: {source}", .path.display())]
    FileNotFound {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The codec's compile pass rejected the file.
    #[error("proto compilation failed: {0}")]
    CompileFailed(#[from] CodecError),

    /// Malformed service or rpc syntax.
    #[error(
        "parse error{}: {reason}",
        .rpc_name.as_deref().map(|n| format!(" in rpc {}", n)).unwrap_or_default()
    )]
    ParseError {
        reason: String,
        rpc_name: Option<String>,
    },

    /// A referenced message type did not resolve after compilation.
    #[error("message type {fq_name} not found after compilation")]
    DescriptorMissing { fq_name: String },
}

impl ProtoError {
    pub(crate) fn parse(reason: impl Into<String>) -> Self {
        ProtoError::ParseError {
            reason: reason.into(),
            rpc_name: None,
        }
    }

    pub(crate) fn parse_in_rpc(reason: impl Into<String>, rpc: impl Into<String>) -> Self {
        ProtoError::ParseError {
            reason: reason.into(),
            rpc_name: Some(rpc.into()),
        }
    }
}
