//! gRPC status codes and the per-call status.

use http::header::{HeaderMap, HeaderName, HeaderValue};
use std::fmt;

const GRPC_STATUS: &str = "grpc-status";
const GRPC_MESSAGE: &str = "grpc-message";

/// The canonical gRPC status codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Code {
    /// Success.
    Ok = 0,
    /// The operation was cancelled, typically by the caller.
    Cancelled = 1,
    /// Unknown error.
    Unknown = 2,
    /// The client specified an invalid argument.
    InvalidArgument = 3,
    /// The deadline expired before the operation could complete.
    DeadlineExceeded = 4,
    /// A requested entity was not found.
    NotFound = 5,
    /// The entity already exists.
    AlreadyExists = 6,
    /// The caller lacks permission.
    PermissionDenied = 7,
    /// A resource has been exhausted.
    ResourceExhausted = 8,
    /// The system is not in a state required for the operation.
    FailedPrecondition = 9,
    /// The operation was aborted.
    Aborted = 10,
    /// The operation was attempted past the valid range.
    OutOfRange = 11,
    /// The method is not implemented by the server.
    Unimplemented = 12,
    /// Internal error.
    Internal = 13,
    /// The service is currently unavailable.
    Unavailable = 14,
    /// Unrecoverable data loss or corruption.
    DataLoss = 15,
    /// Missing or invalid authentication credentials.
    Unauthenticated = 16,
}

impl Code {
    /// Map a numeric wire value to a code. Out-of-range values become
    /// [`Code::Unknown`].
    pub fn from_u32(value: u32) -> Self {
        use Code::*;
        const TABLE: [Code; 17] = [
            Ok,
            Cancelled,
            Unknown,
            InvalidArgument,
            DeadlineExceeded,
            NotFound,
            AlreadyExists,
            PermissionDenied,
            ResourceExhausted,
            FailedPrecondition,
            Aborted,
            OutOfRange,
            Unimplemented,
            Internal,
            Unavailable,
            DataLoss,
            Unauthenticated,
        ];
        TABLE.get(value as usize).copied().unwrap_or(Unknown)
    }

    /// The numeric wire value.
    pub fn as_u32(self) -> u32 {
        self as u32
    }

    /// The SHOUTING_SNAKE name used in logs and error text.
    pub fn as_str(self) -> &'static str {
        match self {
            Code::Ok => "OK",
            Code::Cancelled => "CANCELLED",
            Code::Unknown => "UNKNOWN",
            Code::InvalidArgument => "INVALID_ARGUMENT",
            Code::DeadlineExceeded => "DEADLINE_EXCEEDED",
            Code::NotFound => "NOT_FOUND",
            Code::AlreadyExists => "ALREADY_EXISTS",
            Code::PermissionDenied => "PERMISSION_DENIED",
            Code::ResourceExhausted => "RESOURCE_EXHAUSTED",
            Code::FailedPrecondition => "FAILED_PRECONDITION",
            Code::Aborted => "ABORTED",
            Code::OutOfRange => "OUT_OF_RANGE",
            Code::Unimplemented => "UNIMPLEMENTED",
            Code::Internal => "INTERNAL",
            Code::Unavailable => "UNAVAILABLE",
            Code::DataLoss => "DATA_LOSS",
            Code::Unauthenticated => "UNAUTHENTICATED",
        }
    }

    /// True for [`Code::Ok`].
    pub fn is_ok(self) -> bool {
        self == Code::Ok
    }
}

impl fmt::Display for Code {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The final status of an RPC: a code plus a details string.
///
/// The details string is empty rather than absent when the peer supplied
/// none; only non-empty details are written to the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Status {
    code: Code,
    details: String,
}

impl Status {
    /// Create a status with details.
    pub fn new(code: Code, details: impl Into<String>) -> Self {
        Self {
            code,
            details: details.into(),
        }
    }

    /// OK with no details.
    pub fn ok() -> Self {
        Self::from_code(Code::Ok)
    }

    /// A status with empty details.
    pub fn from_code(code: Code) -> Self {
        Self {
            code,
            details: String::new(),
        }
    }

    pub fn cancelled(details: impl Into<String>) -> Self {
        Self::new(Code::Cancelled, details)
    }

    pub fn unknown(details: impl Into<String>) -> Self {
        Self::new(Code::Unknown, details)
    }

    pub fn invalid_argument(details: impl Into<String>) -> Self {
        Self::new(Code::InvalidArgument, details)
    }

    pub fn deadline_exceeded(details: impl Into<String>) -> Self {
        Self::new(Code::DeadlineExceeded, details)
    }

    pub fn unimplemented(details: impl Into<String>) -> Self {
        Self::new(Code::Unimplemented, details)
    }

    pub fn internal(details: impl Into<String>) -> Self {
        Self::new(Code::Internal, details)
    }

    pub fn unavailable(details: impl Into<String>) -> Self {
        Self::new(Code::Unavailable, details)
    }

    /// The status code.
    pub fn code(&self) -> Code {
        self.code
    }

    /// The details string; empty when the peer supplied none.
    pub fn details(&self) -> &str {
        &self.details
    }

    /// True for an OK status.
    pub fn is_ok(&self) -> bool {
        self.code.is_ok()
    }

    /// Render this status as gRPC trailers.
    ///
    /// Details that are not valid header values are dropped rather than
    /// poisoning the trailer frame.
    pub fn to_trailers(&self) -> HeaderMap {
        let mut trailers = HeaderMap::new();
        trailers.insert(
            HeaderName::from_static(GRPC_STATUS),
            HeaderValue::from_str(&self.code.as_u32().to_string())
                .unwrap_or(HeaderValue::from_static("2")),
        );
        if !self.details.is_empty() {
            if let Ok(value) = HeaderValue::from_str(&self.details) {
                trailers.insert(HeaderName::from_static(GRPC_MESSAGE), value);
            }
        }
        trailers
    }

    /// Extract a status from a trailer (or trailers-only header) block.
    ///
    /// Returns `None` when no `grpc-status` is present; an unparsable value
    /// maps to [`Code::Unknown`].
    pub fn from_trailers(trailers: &HeaderMap) -> Option<Status> {
        let raw = trailers.get(GRPC_STATUS)?;
        let code = raw
            .to_str()
            .ok()
            .and_then(|s| s.parse::<u32>().ok())
            .map(Code::from_u32)
            .unwrap_or(Code::Unknown);
        let details = trailers
            .get(GRPC_MESSAGE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();
        Some(Status { code, details })
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.details.is_empty() {
            write!(f, "{}", self.code)
        } else {
            write!(f, "{}: {}", self.code, self.details)
        }
    }
}

impl std::error::Error for Status {}
