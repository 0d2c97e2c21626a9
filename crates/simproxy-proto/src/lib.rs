//! Simulation Relay Protocol Definitions
//!
//! Wire framing shared by both directions of the relay, plus the few byte
//! patterns the relay interprets inside otherwise opaque payloads.

pub mod codec;

pub use codec::{CodecError, FrameCodec};

/// Sync token an agent sends to signal it is ready for the next simulation step
pub const SYNC_TOKEN: &[u8] = b"(syn)";

/// Marker opening a say sub-command in an agent action
pub const SAY_MARKER: &[u8] = b"(say";

/// Size of the big-endian length header in front of every frame
pub const HEADER_SIZE: usize = 4;

/// Largest payload a frame can announce (the length must fit a signed 32-bit value)
pub const MAX_FRAME_SIZE: usize = i32::MAX as usize;

/// Returns true if `needle` occurs anywhere in `haystack`
pub fn contains_token(haystack: &[u8], needle: &[u8]) -> bool {
    if needle.is_empty() {
        return true;
    }
    haystack.windows(needle.len()).any(|window| window == needle)
}

/// Prefix `payload` with a single sync token
pub fn prepend_sync(payload: &[u8]) -> Vec<u8> {
    let mut result = Vec::with_capacity(SYNC_TOKEN.len() + payload.len());
    result.extend_from_slice(SYNC_TOKEN);
    result.extend_from_slice(payload);
    result
}
