//! Control-channel protocol for the edgetun tunnel system
//!
//! Frames are JSON objects of the shape `{action, data}` exchanged between
//! the edge and the agent over a full-duplex channel. The channel enforces
//! a per-frame ceiling, so senders apply the chunking rules in [`chunk`].

pub mod chunk;
pub mod frame;

pub use chunk::{effective_chunk_size, split_utf8_chunks, FRAME_MAX, REQUEST_CHUNK_SIZE, STAGE_THRESHOLD};
pub use frame::{BodyChunk, Frame, Headers, ProxyRequest, ProxyResponse, StreamEnd, StreamStart};

use rand::RngCore;

/// Generate a new request correlation id: 16 random bytes, hex-encoded.
pub fn generate_request_id() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_id_format() {
        let id = generate_request_id();
        assert_eq!(id.len(), 32);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_request_ids_are_unique() {
        let a = generate_request_id();
        let b = generate_request_id();
        assert_ne!(a, b);
    }
}
