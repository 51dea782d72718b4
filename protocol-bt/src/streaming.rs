//! Incremental frame reassembly.
//!
//! [`FrameAccumulator`] is the receive-side state machine for the
//! `<decimal-length> ":" <payload>` framing. It is push-based: the transport
//! feeds whatever bytes arrive, in whatever chunk sizes, and gets back the
//! complete payloads that ended inside those bytes. Chunk boundaries never
//! affect the result.

use bytes::{Bytes, BytesMut};
use memchr::memchr;

use crate::error::FrameError;
use crate::frame::{MAX_REQ_LEN, MAX_REQ_LEN_ENCODED};

/// Two-state incremental consumer for length-prefixed payloads.
///
/// State 1 accumulates the decimal length prefix until a `:` appears; state 2
/// accumulates exactly that many payload bytes. Any violation of the framing
/// rules is a [`FrameError`], after which the accumulator must be discarded
/// along with its stream.
pub struct FrameAccumulator {
    /// Partial decimal prefix carried across chunks. Empty in body state.
    size_buf: Vec<u8>,
    /// Partial payload. Only non-empty in body state.
    buf: BytesMut,
    /// Expected payload length; 0 means we are parsing the prefix.
    expected: usize,
    max_len: usize,
}

impl FrameAccumulator {
    pub fn new() -> Self {
        Self::with_max_len(MAX_REQ_LEN)
    }

    /// Accumulator with a non-default size cap (used by tests and by
    /// transports negotiating a smaller limit).
    pub fn with_max_len(max_len: usize) -> Self {
        FrameAccumulator {
            size_buf: Vec::with_capacity(MAX_REQ_LEN_ENCODED),
            buf: BytesMut::new(),
            expected: 0,
            max_len,
        }
    }

    /// Feed a chunk of received bytes, returning every payload completed by
    /// it. On error the stream is unrecoverable.
    pub fn push(&mut self, mut chunk: &[u8]) -> Result<Vec<Bytes>, FrameError> {
        let mut complete = Vec::new();

        while !chunk.is_empty() {
            if self.expected == 0 {
                chunk = self.push_prefix(chunk)?;
                continue;
            }

            let need = self.expected - self.buf.len();
            if chunk.len() < need {
                self.buf.extend_from_slice(chunk);
                break;
            }

            self.buf.extend_from_slice(&chunk[..need]);
            chunk = &chunk[need..];
            complete.push(std::mem::take(&mut self.buf).freeze());
            self.expected = 0;
        }

        Ok(complete)
    }

    /// Consume length-prefix bytes from the front of `chunk`. Returns the
    /// remainder once a complete prefix has been read, or an empty slice if
    /// the prefix is still incomplete.
    fn push_prefix<'c>(&mut self, chunk: &'c [u8]) -> Result<&'c [u8], FrameError> {
        match memchr(b':', chunk) {
            Some(pos) => {
                if self.size_buf.len() + pos + 1 > MAX_REQ_LEN_ENCODED {
                    return Err(FrameError::LengthOverflow(MAX_REQ_LEN_ENCODED));
                }
                self.size_buf.extend_from_slice(&chunk[..pos]);
                self.expected = self.parse_length()?;
                self.size_buf.clear();
                self.buf.reserve(self.expected);
                Ok(&chunk[pos + 1..])
            }
            None => {
                if self.size_buf.len() + chunk.len() >= MAX_REQ_LEN_ENCODED {
                    return Err(FrameError::LengthOverflow(MAX_REQ_LEN_ENCODED));
                }
                self.size_buf.extend_from_slice(chunk);
                Ok(&[])
            }
        }
    }

    fn parse_length(&self) -> Result<usize, FrameError> {
        if self.size_buf.is_empty() {
            return Err(FrameError::InvalidLength);
        }
        let mut len: usize = 0;
        for &b in &self.size_buf {
            if !b.is_ascii_digit() {
                return Err(FrameError::InvalidLength);
            }
            len = len
                .checked_mul(10)
                .and_then(|v| v.checked_add((b - b'0') as usize))
                .ok_or(FrameError::InvalidLength)?;
        }
        if len == 0 {
            return Err(FrameError::EmptyMessage);
        }
        if len > self.max_len {
            return Err(FrameError::Oversize(len));
        }
        Ok(len)
    }
}

impl Default for FrameAccumulator {
    fn default() -> Self {
        Self::new()
    }
}
