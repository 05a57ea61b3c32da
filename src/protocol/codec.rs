//! Protocol codec for framing messages
//!
//! Messages travel as UTF-8 text, each terminated by a single NUL byte.
//! The decoder keeps a trailing partial frame buffered until the rest of it
//! arrives.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

use super::{Message, ParseError, FRAME_DELIMITER, MAX_FRAME_SIZE};

/// Codec errors
#[derive(Error, Debug)]
pub enum CodecError {
    #[error("Frame too large: {0} bytes without delimiter (max: {1})")]
    FrameTooLarge(usize, usize),

    #[error("Frame is not valid UTF-8")]
    InvalidUtf8(#[from] std::str::Utf8Error),

    #[error("Malformed message: {0}")]
    Parse(#[from] ParseError),
}

/// Encode a message into a NUL-terminated frame
pub fn encode_message(message: &Message, buf: &mut BytesMut) {
    let text = message.to_string();
    buf.reserve(text.len() + 1);
    buf.put_slice(text.as_bytes());
    buf.put_u8(FRAME_DELIMITER);
}

/// Encode a message into a standalone frame
pub fn encode_frame(message: &Message) -> Bytes {
    let mut buf = BytesMut::new();
    encode_message(message, &mut buf);
    buf.freeze()
}

/// Decode a single frame body into a message
pub fn decode_frame(frame: &[u8]) -> Result<Message, CodecError> {
    let text = std::str::from_utf8(frame)?;
    Ok(text.parse()?)
}

/// Splits an ordered byte stream into frames
#[derive(Debug)]
pub struct FrameDecoder {
    buf: BytesMut,
    max_frame_size: usize,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::with_max_frame_size(MAX_FRAME_SIZE)
    }

    pub fn with_max_frame_size(max_frame_size: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(4096),
            max_frame_size,
        }
    }

    /// Append raw bytes received from the peer
    pub fn extend(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Number of bytes held for a frame that is not yet complete
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Take the next complete frame body out of the buffer
    ///
    /// Returns Ok(None) when more data is needed. An oversized partial frame is
    /// dropped and reported as an error; the decoder stays usable afterwards.
    pub fn next_frame(&mut self) -> Result<Option<Bytes>, CodecError> {
        loop {
            match self.buf.iter().position(|b| *b == FRAME_DELIMITER) {
                Some(0) => {
                    // Empty frame
                    self.buf.advance(1);
                }
                Some(pos) => {
                    let frame = self.buf.split_to(pos).freeze();
                    self.buf.advance(1);
                    if frame.len() > self.max_frame_size {
                        return Err(CodecError::FrameTooLarge(frame.len(), self.max_frame_size));
                    }
                    return Ok(Some(frame));
                }
                None => {
                    if self.buf.len() > self.max_frame_size {
                        let len = self.buf.len();
                        self.buf.clear();
                        return Err(CodecError::FrameTooLarge(len, self.max_frame_size));
                    }
                    return Ok(None);
                }
            }
        }
    }
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}
