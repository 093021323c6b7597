//! Frame codec for length-prefixed framing.
//!
//! # Frame Format
//!
//! Each frame consists of:
//! - 4 bytes: magic bytes "SMUX"
//! - 4 bytes: payload length (big-endian)
//! - N bytes: payload (a MessagePack-encoded [`Envelope`](crate::Envelope))
//!
//! The codec is stateless; [`FrameCodec::try_decode`] supports streaming
//! transports that deliver partial frames.

use crate::error::{ProtocolError, Result};

/// Magic bytes identifying a ShellMux frame.
pub const FRAME_MAGIC: [u8; 4] = *b"SMUX";

/// Maximum frame size (4 MB). Session output chunks are small; anything
/// near this limit indicates a corrupt or hostile peer.
pub const MAX_FRAME_SIZE: usize = 4 * 1024 * 1024;

/// Frame header size: 4 (magic) + 4 (length) = 8 bytes.
pub const FRAME_HEADER_SIZE: usize = 8;

/// A frame containing an opaque payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// The payload data.
    pub payload: Vec<u8>,
}

impl Frame {
    /// Create a new frame with the given payload.
    pub fn new(payload: Vec<u8>) -> Self {
        Self { payload }
    }
}

/// Encoder and decoder for frames.
#[derive(Debug, Clone, Copy, Default)]
pub struct FrameCodec;

impl FrameCodec {
    /// Create a new frame codec.
    pub fn new() -> Self {
        Self
    }

    /// Encode a frame into bytes.
    pub fn encode(&self, frame: &Frame) -> Result<Vec<u8>> {
        let payload = &frame.payload;

        if payload.len() > MAX_FRAME_SIZE - FRAME_HEADER_SIZE {
            return Err(ProtocolError::FrameTooLarge {
                size: payload.len() + FRAME_HEADER_SIZE,
                max: MAX_FRAME_SIZE,
            });
        }

        let mut output = Vec::with_capacity(FRAME_HEADER_SIZE + payload.len());
        output.extend_from_slice(&FRAME_MAGIC);
        output.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        output.extend_from_slice(payload);

        Ok(output)
    }

    /// Decode a frame from bytes.
    ///
    /// Returns the decoded frame and the number of bytes consumed.
    pub fn decode(&self, data: &[u8]) -> Result<(Frame, usize)> {
        if data.len() < FRAME_HEADER_SIZE {
            return Err(ProtocolError::Deserialization(format!(
                "insufficient data for frame header: need {} bytes, have {}",
                FRAME_HEADER_SIZE,
                data.len()
            )));
        }

        let magic = &data[0..4];
        if magic != FRAME_MAGIC {
            return Err(ProtocolError::InvalidFrameMagic {
                expected: u32::from_be_bytes(FRAME_MAGIC),
                got: u32::from_be_bytes([magic[0], magic[1], magic[2], magic[3]]),
            });
        }

        let length_bytes: [u8; 4] = data[4..8].try_into().expect("slice length checked");
        let payload_len = u32::from_be_bytes(length_bytes) as usize;

        let total_frame_size = FRAME_HEADER_SIZE + payload_len;
        if total_frame_size > MAX_FRAME_SIZE {
            return Err(ProtocolError::FrameTooLarge {
                size: total_frame_size,
                max: MAX_FRAME_SIZE,
            });
        }

        if data.len() < total_frame_size {
            return Err(ProtocolError::Deserialization(format!(
                "insufficient data for frame: need {} bytes, have {}",
                total_frame_size,
                data.len()
            )));
        }

        let payload = data[FRAME_HEADER_SIZE..total_frame_size].to_vec();

        Ok((Frame { payload }, total_frame_size))
    }

    /// Try to decode a frame from bytes, returning `None` if there isn't
    /// enough data yet.
    ///
    /// Invalid magic and oversized length fields are reported as errors
    /// immediately; waiting for more bytes cannot repair them.
    pub fn try_decode(&self, data: &[u8]) -> Result<Option<(Frame, usize)>> {
        if data.len() < FRAME_HEADER_SIZE {
            return Ok(None);
        }

        let magic = &data[0..4];
        if magic != FRAME_MAGIC {
            return Err(ProtocolError::InvalidFrameMagic {
                expected: u32::from_be_bytes(FRAME_MAGIC),
                got: u32::from_be_bytes([magic[0], magic[1], magic[2], magic[3]]),
            });
        }

        let length_bytes: [u8; 4] = data[4..8].try_into().expect("slice length checked");
        let payload_len = u32::from_be_bytes(length_bytes) as usize;

        let total_frame_size = FRAME_HEADER_SIZE + payload_len;
        if total_frame_size > MAX_FRAME_SIZE {
            return Err(ProtocolError::FrameTooLarge {
                size: total_frame_size,
                max: MAX_FRAME_SIZE,
            });
        }

        if data.len() < total_frame_size {
            return Ok(None);
        }

        self.decode(data).map(Some)
    }
}
