//! # Framing
//!
//! Each message travels as one frame:
//!
//! ```text
//! [len: u32 BE][body: len bytes of UTF-8 JSON]
//! ```
//!
//! ## Invariants
//! - **Whole Frames**: `encode_frame` produces a complete frame or an error, never a prefix.
//! - **Arbitrary Fragmentation**: `FrameBuffer` yields the same frames no matter how the
//!   input bytes were split across `push` calls, including a split inside the header.
//! - **Bounded**: frames longer than the configured maximum are rejected on both sides.

use bytes::Buf;
use bytes::BytesMut;

use crate::error::Error;
use crate::error::Result;
use crate::message::Message;

/// Size of the length prefix.
pub const HEADER_LEN: usize = 4;

/// Default upper bound for a frame body.
pub const DEFAULT_MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

/// Encodes a message into a single frame using the default size limit.
pub fn encode_frame(msg: &Message) -> Result<Vec<u8>> {
    encode_frame_with_limit(msg, DEFAULT_MAX_FRAME_LEN)
}

/// Encodes a message into a single frame, rejecting bodies over `max_len`.
pub fn encode_frame_with_limit(msg: &Message, max_len: usize) -> Result<Vec<u8>> {
    let body = serde_json::to_vec(msg)?;
    let max = max_len.min(u32::MAX as usize);
    if body.len() > max {
        return Err(Error::FrameTooLarge { len: body.len(), max });
    }

    let mut frame = Vec::with_capacity(HEADER_LEN + body.len());
    frame.extend_from_slice(&(body.len() as u32).to_be_bytes());
    frame.extend_from_slice(&body);
    Ok(frame)
}

/// Decodes a frame body (without its length prefix).
pub fn decode_body(body: &[u8]) -> Result<Message> {
    Ok(serde_json::from_slice(body)?)
}

/// Accumulates raw reads and slices complete frames out of them.
#[derive(Debug)]
pub struct FrameBuffer {
    buf: BytesMut,
    max_len: usize,
}

impl Default for FrameBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameBuffer {
    pub fn new() -> Self {
        Self::with_max_len(DEFAULT_MAX_FRAME_LEN)
    }

    pub fn with_max_len(max_len: usize) -> Self {
        Self { buf: BytesMut::new(), max_len }
    }

    /// Appends bytes from one underlying read.
    pub fn push(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Number of bytes held that do not yet form a complete frame.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Discards any partial frame.
    pub fn clear(&mut self) {
        self.buf.clear();
    }

    /// Slices out the next complete frame body, if one is buffered.
    ///
    /// A declared length over the limit is an error the buffer cannot recover
    /// from, since the stream position of the next header is unknown.
    pub fn next_body(&mut self) -> Result<Option<BytesMut>> {
        if self.buf.len() < HEADER_LEN {
            return Ok(None);
        }

        let mut header = [0u8; HEADER_LEN];
        header.copy_from_slice(&self.buf[..HEADER_LEN]);
        let len = u32::from_be_bytes(header) as usize;
        if len > self.max_len {
            return Err(Error::FrameTooLarge { len, max: self.max_len });
        }

        if self.buf.len() < HEADER_LEN + len {
            return Ok(None);
        }

        self.buf.advance(HEADER_LEN);
        Ok(Some(self.buf.split_to(len)))
    }

    /// Slices out and decodes the next complete frame.
    ///
    /// A frame whose body fails to decode is still consumed, so the caller can
    /// report it and keep reading.
    pub fn next_message(&mut self) -> Result<Option<Message>> {
        match self.next_body()? {
            Some(body) => decode_body(&body).map(Some),
            None => Ok(None),
        }
    }
}
