//! Wire framing for consensus messages.
//!
//! # Wire Format
//!
//! ```text
//! [length: u32 little-endian][payload: SBOR-encoded ConsensusMessage]
//! ```
//!
//! The length prefix counts payload bytes only. Its size is the compile-time
//! constant [`MESSAGE_HEADER_SIZE`].

use basalt_messages::ConsensusMessage;
use thiserror::Error;

/// Size of the length prefix in bytes.
pub const MESSAGE_HEADER_SIZE: usize = 4;

/// Upper bound on a single framed payload: 16 MiB.
pub const MAX_PAYLOAD_BYTES: usize = 16 * 1024 * 1024;

/// Errors from framing and unframing messages.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("payload of {0} bytes exceeds the frame limit")]
    PayloadTooLarge(usize),

    #[error("frame is truncated: need {need} bytes, have {have}")]
    Truncated { need: usize, have: usize },

    #[error("encode error: {0}")]
    Encode(String),

    #[error("decode error: {0}")]
    Decode(String),
}

/// Encode a message into a length-prefixed frame.
pub fn encode_frame(msg: &ConsensusMessage) -> Result<Vec<u8>, CodecError> {
    let payload = sbor::basic_encode(msg).map_err(|e| CodecError::Encode(format!("{e:?}")))?;
    if payload.len() > MAX_PAYLOAD_BYTES {
        return Err(CodecError::PayloadTooLarge(payload.len()));
    }
    let mut frame = Vec::with_capacity(MESSAGE_HEADER_SIZE + payload.len());
    frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    frame.extend_from_slice(&payload);
    Ok(frame)
}

/// Total frame length (header + payload) announced by a buffer, if the
/// header is complete.
pub fn frame_len(buf: &[u8]) -> Option<usize> {
    if buf.len() < MESSAGE_HEADER_SIZE {
        return None;
    }
    let mut header = [0u8; MESSAGE_HEADER_SIZE];
    header.copy_from_slice(&buf[..MESSAGE_HEADER_SIZE]);
    Some(MESSAGE_HEADER_SIZE + u32::from_le_bytes(header) as usize)
}

/// Decode one frame from the front of `buf`.
///
/// Returns the message and the number of bytes consumed, so callers can
/// decode back-to-back frames out of a stream buffer.
pub fn decode_frame(buf: &[u8]) -> Result<(ConsensusMessage, usize), CodecError> {
    let total = frame_len(buf).ok_or(CodecError::Truncated {
        need: MESSAGE_HEADER_SIZE,
        have: buf.len(),
    })?;
    let payload_len = total - MESSAGE_HEADER_SIZE;
    if payload_len > MAX_PAYLOAD_BYTES {
        return Err(CodecError::PayloadTooLarge(payload_len));
    }
    if buf.len() < total {
        return Err(CodecError::Truncated {
            need: total,
            have: buf.len(),
        });
    }
    let payload = &buf[MESSAGE_HEADER_SIZE..total];
    let msg = sbor::basic_decode(payload).map_err(|e| CodecError::Decode(format!("{e:?}")))?;
    Ok((msg, total))
}
