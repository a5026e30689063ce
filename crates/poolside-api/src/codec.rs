//! CRLF-delimited JSON framing.
//!
//! The decoder buffers partial reads until a terminator arrives and yields
//! each complete line as a JSON object. Lines that fail to parse are logged
//! and skipped; a buffer that outgrows the frame cap or a line that is not
//! UTF-8 is a protocol violation and ends the stream.

use bytes::{Bytes, BytesMut};
use serde_json::Value;
use tokio_util::codec::{Decoder, Encoder};

use crate::error::Error;
use crate::message::Params;

/// Line terminator used in both directions.
pub const TERMINATOR: &[u8] = b"\r\n";

/// Hard cap on buffered, unterminated input.
pub const DEFAULT_MAX_FRAME_SIZE: usize = 1_000_000;

#[derive(Debug, Clone)]
pub struct MessageCodec {
    max_frame_size: usize,
    /// Offset already scanned for a terminator, so large partial frames
    /// are not rescanned on every read.
    scanned: usize,
}

impl MessageCodec {
    pub fn new() -> Self {
        Self::with_max_frame_size(DEFAULT_MAX_FRAME_SIZE)
    }

    pub fn with_max_frame_size(max_frame_size: usize) -> Self {
        Self {
            max_frame_size,
            scanned: 0,
        }
    }

    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }
}

impl Default for MessageCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for MessageCodec {
    type Item = Params;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Params>, Error> {
        loop {
            // Back up one byte in case the previous read ended between \r and \n.
            let start = self.scanned.saturating_sub(1);
            let Some(offset) = find_terminator(&src[start..]) else {
                if src.len() > self.max_frame_size {
                    return Err(Error::FrameTooLarge {
                        size: src.len(),
                        max: self.max_frame_size,
                    });
                }
                self.scanned = src.len();
                return Ok(None);
            };

            let line_len = start + offset;
            self.scanned = 0;
            if line_len > self.max_frame_size {
                return Err(Error::FrameTooLarge {
                    size: line_len,
                    max: self.max_frame_size,
                });
            }

            let frame = src.split_to(line_len + TERMINATOR.len());
            let line = &frame[..line_len];
            if line.iter().all(u8::is_ascii_whitespace) {
                continue;
            }

            let text = std::str::from_utf8(line).map_err(|_| Error::InvalidUtf8)?;
            match serde_json::from_str::<Value>(text) {
                Ok(Value::Object(map)) => return Ok(Some(map)),
                Ok(other) => {
                    tracing::warn!(kind = json_kind(&other), "dropping non-object JSON line");
                }
                Err(e) => {
                    tracing::warn!(error = %e, len = line_len, "dropping invalid JSON line");
                }
            }
        }
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<Params>, Error> {
        if let Some(msg) = self.decode(buf)? {
            return Ok(Some(msg));
        }
        if !buf.is_empty() {
            tracing::debug!(len = buf.len(), "discarding unterminated data at end of stream");
            buf.clear();
            self.scanned = 0;
        }
        Ok(None)
    }
}

impl Encoder<Bytes> for MessageCodec {
    type Error = Error;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> Result<(), Error> {
        dst.reserve(item.len() + TERMINATOR.len());
        dst.extend_from_slice(&item);
        dst.extend_from_slice(TERMINATOR);
        Ok(())
    }
}

fn find_terminator(buf: &[u8]) -> Option<usize> {
    buf.windows(TERMINATOR.len()).position(|w| w == TERMINATOR)
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
