//! HTTP/2 helpers shared by the client and server halves of the runtime.

use crate::metadata::Metadata;
use crate::status::{Code, Status};

use bytes::Bytes;
use h2::{Reason, SendStream};
use http::header::{HeaderMap, HeaderName, HeaderValue};
use std::future::poll_fn;
use std::task::Poll;

/// Headers that belong to the transport, not to call metadata.
const RESERVED: [&str; 5] = ["content-type", "te", "user-agent", "grpc-timeout", "grpc-encoding"];

/// Append ordered metadata entries to an outgoing header block.
///
/// Entries with keys that are reserved, pseudo-header shaped, or not valid
/// HTTP field names are reported as an error so the batch can fail before
/// anything is written to the stream.
pub(crate) fn metadata_into_headers(
    metadata: &Metadata,
    headers: &mut HeaderMap,
) -> Result<(), Status> {
    for (key, value) in metadata.iter() {
        if key.starts_with(':') || RESERVED.contains(&key) || key.starts_with("grpc-") {
            continue;
        }
        let name = HeaderName::from_bytes(key.as_bytes())
            .map_err(|_| Status::internal(format!("invalid metadata key: {}", key)))?;
        let value = HeaderValue::from_str(value)
            .map_err(|_| Status::internal(format!("invalid metadata value for key: {}", key)))?;
        headers.append(name, value);
    }
    Ok(())
}

/// Collect call metadata from a received header block, skipping
/// pseudo-headers and transport fields.
pub(crate) fn metadata_from_headers(headers: &HeaderMap) -> Metadata {
    let mut metadata = Metadata::new();
    for (name, value) in headers.iter() {
        let key = name.as_str();
        if key.starts_with(':') || RESERVED.contains(&key) || key.starts_with("grpc-") {
            continue;
        }
        if let Ok(value) = value.to_str() {
            metadata.insert(key, value);
        }
    }
    metadata
}

/// Map an HTTP/2 reset reason onto a status code.
pub(crate) fn reason_to_code(reason: Reason) -> Code {
    match reason {
        Reason::CANCEL => Code::Cancelled,
        Reason::ENHANCE_YOUR_CALM => Code::ResourceExhausted,
        Reason::REFUSED_STREAM => Code::Unavailable,
        _ => Code::Unknown,
    }
}

/// Map an `h2` error onto a best-effort status.
pub(crate) fn h2_error_to_status(err: &h2::Error) -> Status {
    if let Some(reason) = err.reason() {
        Status::new(reason_to_code(reason), format!("stream reset: {}", err))
    } else if err.is_io() {
        Status::unavailable(format!("transport error: {}", err))
    } else {
        Status::internal(format!("http/2 error: {}", err))
    }
}

/// True when the error means the peer reset or abandoned the stream.
pub(crate) fn is_stream_reset(err: &h2::Error) -> bool {
    err.is_reset() || err.reason().is_some()
}

/// Send a full payload on a stream, respecting flow-control capacity.
pub(crate) async fn send_all(
    stream: &mut SendStream<Bytes>,
    mut data: Bytes,
    end_of_stream: bool,
) -> Result<(), h2::Error> {
    if data.is_empty() {
        return stream.send_data(data, end_of_stream);
    }
    while !data.is_empty() {
        stream.reserve_capacity(data.len());
        let granted = match poll_fn(|cx| stream.poll_capacity(cx)).await {
            Some(Ok(n)) => n,
            Some(Err(e)) => return Err(e),
            // Stream no longer exists: surface as a reset.
            None => return Err(h2::Error::from(Reason::CANCEL)),
        };
        if granted == 0 {
            continue;
        }
        let chunk = data.split_to(granted.min(data.len()));
        let end = end_of_stream && data.is_empty();
        stream.send_data(chunk, end)?;
    }
    Ok(())
}

/// Non-blocking probe for a stream reset on the send side.
pub(crate) async fn probe_reset(stream: &mut SendStream<Bytes>) -> Option<Reason> {
    poll_fn(|cx| match stream.poll_reset(cx) {
        Poll::Ready(Ok(reason)) => Poll::Ready(Some(reason)),
        Poll::Ready(Err(_)) => Poll::Ready(None),
        Poll::Pending => Poll::Ready(None),
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metadata_header_roundtrip_preserves_order_per_key() {
        let mut md = Metadata::new();
        md.insert("x-trace", "abc");
        md.insert("x-trace", "def");
        md.insert("x-tenant", "t1");

        let mut headers = HeaderMap::new();
        metadata_into_headers(&md, &mut headers).unwrap();
        let back = metadata_from_headers(&headers);

        assert_eq!(back.get_all("x-trace"), vec!["abc", "def"]);
        assert_eq!(back.get("x-tenant"), Some("t1"));
    }

    #[test]
    fn reserved_keys_skipped_on_send() {
        let mut md = Metadata::new();
        md.insert("content-type", "application/json");
        md.insert("grpc-timeout", "1S");
        md.insert("x-ok", "yes");

        let mut headers = HeaderMap::new();
        metadata_into_headers(&md, &mut headers).unwrap();
        assert!(headers.get("content-type").is_none());
        assert!(headers.get("grpc-timeout").is_none());
        assert_eq!(headers.get("x-ok").unwrap(), "yes");
    }

    #[test]
    fn invalid_key_is_an_error() {
        let mut md = Metadata::new();
        md.insert("bad key with spaces", "v");
        let mut headers = HeaderMap::new();
        let status = metadata_into_headers(&md, &mut headers).unwrap_err();
        assert_eq!(status.code(), Code::Internal);
    }

    #[test]
    fn transport_headers_not_read_back() {
        let mut headers = HeaderMap::new();
        headers.insert("content-type", HeaderValue::from_static("application/grpc"));
        headers.insert("grpc-status", HeaderValue::from_static("0"));
        headers.insert("x-trace", HeaderValue::from_static("abc"));

        let md = metadata_from_headers(&headers);
        assert_eq!(md.len(), 1);
        assert_eq!(md.get("x-trace"), Some("abc"));
    }

    #[test]
    fn reason_mapping() {
        assert_eq!(reason_to_code(Reason::CANCEL), Code::Cancelled);
        assert_eq!(reason_to_code(Reason::REFUSED_STREAM), Code::Unavailable);
        assert_eq!(reason_to_code(Reason::PROTOCOL_ERROR), Code::Unknown);
    }
}
