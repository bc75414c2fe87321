//! Length-prefixed frame codec.
//!
//! Every message on the wire is a single frame:
//!
//! ```text
//! +----------------------+---------------------------+
//! | length: u32 (BE)     | payload: `length` bytes   |
//! +----------------------+---------------------------+
//! ```
//!
//! There is no magic number and no version field. The only validation a
//! receiver can perform is the size bound, so every decoder is given the
//! configured maximum payload size.

use bytes::{BufMut, Bytes, BytesMut};

/// Size of the length prefix in bytes.
pub const HEADER_LEN: usize = 4;

/// Largest payload the wire format can describe.
pub const MAX_FRAME_PAYLOAD: usize = u32::MAX as usize;

/// Frame errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    /// Declared or actual payload length exceeds the allowed maximum
    Oversized { length: usize, max: usize },
    /// Peer closed the connection part-way through a frame
    Truncated { expected: usize, received: usize },
}

impl std::fmt::Display for FrameError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FrameError::Oversized { length, max } => {
                write!(f, "Frame of {} bytes exceeds maximum of {} bytes", length, max)
            }
            FrameError::Truncated { expected, received } => write!(
                f,
                "Frame truncated: expected {} bytes, received {}",
                expected, received
            ),
        }
    }
}

impl std::error::Error for FrameError {}

/// Decode a length prefix, rejecting lengths above `max`.
pub fn decode_length(header: [u8; HEADER_LEN], max: usize) -> Result<usize, FrameError> {
    let length = u32::from_be_bytes(header) as usize;
    if length > max {
        return Err(FrameError::Oversized { length, max });
    }
    Ok(length)
}

/// Encode a length prefix for `length` payload bytes.
pub fn encode_length(length: usize) -> Result<[u8; HEADER_LEN], FrameError> {
    let length = u32::try_from(length).map_err(|_| FrameError::Oversized {
        length,
        max: MAX_FRAME_PAYLOAD,
    })?;
    Ok(length.to_be_bytes())
}

/// Encode a complete frame (prefix followed by payload) into one buffer,
/// so it can be handed to a single `write_all`.
pub fn encode(payload: &[u8]) -> Result<Bytes, FrameError> {
    let header = encode_length(payload.len())?;
    let mut frame = BytesMut::with_capacity(HEADER_LEN + payload.len());
    frame.put_slice(&header);
    frame.put_slice(payload);
    Ok(frame.freeze())
}
