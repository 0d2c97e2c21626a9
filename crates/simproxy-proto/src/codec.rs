//! Length-prefixed frame encoding and header parsing

use crate::{HEADER_SIZE, MAX_FRAME_SIZE};
use bytes::{Bytes, BytesMut};
use thiserror::Error;

/// Codec errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("Frame too large: {0} bytes")]
    FrameTooLarge(usize),

    #[error("Invalid frame length header: {0:#010x}")]
    InvalidLength(u32),
}

/// Frame codec
///
/// Format: [length: u32 big-endian][payload: length bytes]
pub struct FrameCodec;

impl FrameCodec {
    /// Encode a payload into a single frame
    pub fn encode(payload: &[u8]) -> Result<Bytes, CodecError> {
        if payload.len() > MAX_FRAME_SIZE {
            return Err(CodecError::FrameTooLarge(payload.len()));
        }

        let mut buf = BytesMut::with_capacity(HEADER_SIZE + payload.len());
        buf.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        buf.extend_from_slice(payload);

        Ok(buf.freeze())
    }

    /// Interpret a length header
    ///
    /// A header with the top bit set would be negative as a signed 32-bit
    /// length, which peers only produce when the stream broke mid-frame.
    pub fn parse_header(header: [u8; HEADER_SIZE]) -> Result<usize, CodecError> {
        let length = u32::from_be_bytes(header);
        if length as usize > MAX_FRAME_SIZE {
            return Err(CodecError::InvalidLength(length));
        }
        Ok(length as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_layout() {
        let encoded = FrameCodec::encode(b"(init)").unwrap();
        assert_eq!(&encoded[..4], &[0, 0, 0, 6]);
        assert_eq!(&encoded[4..], b"(init)");
    }

    #[test]
    fn test_zero_length_frame() {
        let encoded = FrameCodec::encode(b"").unwrap();
        assert_eq!(&encoded[..], &[0, 0, 0, 0]);
        assert_eq!(FrameCodec::parse_header([0, 0, 0, 0]), Ok(0));
    }

    #[test]
    fn test_negative_length_rejected() {
        let header = [0xFF, 0xFF, 0xFF, 0xFF];
        assert_eq!(
            FrameCodec::parse_header(header),
            Err(CodecError::InvalidLength(u32::MAX))
        );
        assert_eq!(
            FrameCodec::parse_header([0x80, 0, 0, 0]),
            Err(CodecError::InvalidLength(0x8000_0000))
        );
    }

    #[test]
    fn test_largest_valid_header() {
        let header = (i32::MAX as u32).to_be_bytes();
        assert_eq!(FrameCodec::parse_header(header), Ok(MAX_FRAME_SIZE));
    }
}
