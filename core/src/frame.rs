//! gRPC length-prefixed message framing.
//!
//! Each message on an HTTP/2 data stream is framed as a 1-byte compressed
//! flag, a 4-byte big-endian length, and the payload. Compression is not
//! negotiated by this runtime, so the flag is always written as 0 and
//! rejected when set on receive.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::fmt;

/// Flag byte plus length word.
pub const FRAME_HEADER_LEN: usize = 5;

/// Default receive limit, matching the gRPC default of 4 MiB.
pub const DEFAULT_MAX_MESSAGE: usize = 4 * 1024 * 1024;

/// Framing violations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    /// Declared length exceeds the receive limit.
    Oversize { len: usize, max: usize },
    /// The peer sent a compressed message, which is not negotiated.
    Compressed,
}

impl fmt::Display for FrameError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FrameError::Oversize { len, max } => {
                write!(f, "message of {} bytes exceeds limit of {}", len, max)
            }
            FrameError::Compressed => write!(f, "compressed message not supported"),
        }
    }
}

impl std::error::Error for FrameError {}

/// Frame a payload for the wire.
pub fn encode_frame(payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(FRAME_HEADER_LEN + payload.len());
    buf.put_u8(0);
    buf.put_u32(payload.len() as u32);
    buf.put_slice(payload);
    buf.freeze()
}

/// Incremental decoder over a stream of data chunks.
#[derive(Debug)]
pub struct FrameDecoder {
    buf: BytesMut,
    max_message: usize,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameDecoder {
    /// Decoder with the default message limit.
    pub fn new() -> Self {
        Self::with_max_message(DEFAULT_MAX_MESSAGE)
    }

    /// Decoder with an explicit message limit.
    pub fn with_max_message(max_message: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(4096),
            max_message,
        }
    }

    /// Append received bytes.
    pub fn push(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Take the next complete message, if one is buffered.
    pub fn next(&mut self) -> Result<Option<Bytes>, FrameError> {
        if self.buf.len() < FRAME_HEADER_LEN {
            return Ok(None);
        }
        if self.buf[0] != 0 {
            return Err(FrameError::Compressed);
        }
        let len = u32::from_be_bytes([self.buf[1], self.buf[2], self.buf[3], self.buf[4]]) as usize;
        if len > self.max_message {
            return Err(FrameError::Oversize {
                len,
                max: self.max_message,
            });
        }
        if self.buf.len() < FRAME_HEADER_LEN + len {
            return Ok(None);
        }
        self.buf.advance(FRAME_HEADER_LEN);
        Ok(Some(self.buf.split_to(len).freeze()))
    }

    /// Bytes buffered but not yet decoded.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }
}
