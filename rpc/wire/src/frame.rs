//! Length-prefixed message framing.
//!
//! Each message travels as `[flag:1][len:4 big-endian][payload:len]` where
//! flag 0 means identity encoding. Frames concatenate within a stream.

use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Size of the message frame prefix (1 byte flag + 4 bytes length).
pub const FRAME_PREFIX_SIZE: usize = 5;

/// Default maximum message size (4MB).
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 4 * 1024 * 1024;

/// Framing protocol error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    #[error("message of {length} bytes exceeds limit of {limit}")]
    MessageTooLarge { length: usize, limit: usize },
    #[error("invalid compression flag: {0}")]
    InvalidCompressionFlag(u8),
}

/// Encode a message with the identity compression flag.
pub fn encode_message(payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(FRAME_PREFIX_SIZE + payload.len());
    buf.put_u8(0);
    buf.put_u32(payload.len() as u32);
    buf.put_slice(payload);
    buf.freeze()
}

/// Stateful decoder: accepts arbitrary byte chunks and yields complete
/// messages in order, buffering a partial trailing frame.
#[derive(Debug)]
pub struct MessageDecoder {
    buffer: BytesMut,
    limit: usize,
}

impl Default for MessageDecoder {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_MESSAGE_SIZE)
    }
}

impl MessageDecoder {
    /// Create a decoder enforcing the given maximum message size.
    pub fn new(limit: usize) -> Self {
        Self {
            buffer: BytesMut::with_capacity(4096),
            limit,
        }
    }

    /// Feed a chunk of stream data into the decoder.
    pub fn feed(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Try to decode the next complete message.
    ///
    /// Returns `Ok(Some(payload))` when a whole frame is buffered,
    /// `Ok(None)` when more data is needed.
    pub fn next_message(&mut self) -> Result<Option<Bytes>, FrameError> {
        if self.buffer.len() < FRAME_PREFIX_SIZE {
            return Ok(None);
        }

        let flag = self.buffer[0];
        if flag > 1 {
            return Err(FrameError::InvalidCompressionFlag(flag));
        }
        let length = u32::from_be_bytes([
            self.buffer[1],
            self.buffer[2],
            self.buffer[3],
            self.buffer[4],
        ]) as usize;

        if length > self.limit {
            return Err(FrameError::MessageTooLarge {
                length,
                limit: self.limit,
            });
        }
        if self.buffer.len() < FRAME_PREFIX_SIZE + length {
            return Ok(None);
        }

        self.buffer.advance(FRAME_PREFIX_SIZE);
        Ok(Some(self.buffer.split_to(length).freeze()))
    }

    /// Check whether any undecoded bytes remain buffered.
    pub fn has_partial_frame(&self) -> bool {
        !self.buffer.is_empty()
    }
}
