//! Length-prefixed framing for byte transports.
//!
//! The in-process hub routes structured messages directly; socket-based
//! transports carry bincode-encoded messages delimited by these frames.

use bytes::{Buf, BufMut, BytesMut};
use std::io;
use thiserror::Error;

/// Maximum frame size for bus messages (128KB).
pub const MAX_FRAME_SIZE: usize = 128 * 1024;

/// Framing error
#[derive(Debug, Error)]
pub enum FramingError {
    #[error("frame too large: {0} bytes (max: {1})")]
    TooLarge(usize, usize),

    #[error("incomplete frame: need {0} more bytes")]
    Incomplete(usize),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Length-prefixed frame codec
pub struct FrameCodec {
    max_frame_size: usize,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(MAX_FRAME_SIZE)
    }
}

impl FrameCodec {
    /// Create a new codec with the specified maximum frame size
    pub fn new(max_frame_size: usize) -> Self {
        Self { max_frame_size }
    }

    /// Encode data with length prefix.
    /// Format: length (4 bytes BE) || data
    pub fn encode(&self, data: &[u8]) -> Result<Vec<u8>, FramingError> {
        if data.len() > self.max_frame_size {
            return Err(FramingError::TooLarge(data.len(), self.max_frame_size));
        }

        let mut encoded = Vec::with_capacity(4 + data.len());
        encoded.put_u32(data.len() as u32);
        encoded.extend_from_slice(data);
        Ok(encoded)
    }

    /// Decode one complete framed payload.
    pub fn decode(&self, framed: &[u8]) -> Result<Vec<u8>, FramingError> {
        if framed.len() < 4 {
            return Err(FramingError::Incomplete(4 - framed.len()));
        }

        let mut buf = framed;
        let len = buf.get_u32() as usize;

        if len > self.max_frame_size {
            return Err(FramingError::TooLarge(len, self.max_frame_size));
        }

        if buf.remaining() < len {
            return Err(FramingError::Incomplete(len - buf.remaining()));
        }

        Ok(buf[..len].to_vec())
    }

    /// Streaming decoder for partial reads.
    /// Returns Some(data) when a complete frame is available, None if more
    /// data is needed.
    pub fn decode_stream(&self, buf: &mut BytesMut) -> Result<Option<Vec<u8>>, FramingError> {
        if buf.len() < 4 {
            return Ok(None);
        }

        let len = {
            let mut len_buf = &buf[..4];
            len_buf.get_u32() as usize
        };

        if len > self.max_frame_size {
            return Err(FramingError::TooLarge(len, self.max_frame_size));
        }

        if buf.len() < 4 + len {
            return Ok(None);
        }

        buf.advance(4);
        let frame = buf.split_to(len).to_vec();
        Ok(Some(frame))
    }
}
