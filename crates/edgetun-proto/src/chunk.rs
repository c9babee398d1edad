//! Body chunking rules
//!
//! The channel rejects frames above [`FRAME_MAX`]. Request bodies above
//! [`REQUEST_CHUNK_SIZE`] are split into `proxy_chunk` frames; response
//! bodies whose serialized terminal frame would exceed the ceiling are
//! either staged in the object store or split into `proxy_response_chunk`
//! frames sized by [`effective_chunk_size`].

/// Hard per-frame ceiling enforced by the channel.
pub const FRAME_MAX: usize = 128 * 1024;

/// Chunk size for request bodies pushed from the edge. Leaves headroom
/// under [`FRAME_MAX`] for the JSON envelope.
pub const REQUEST_CHUNK_SIZE: usize = 90 * 1024;

/// Response body size above which the agent stages the body in the object
/// store instead of chunking it over the channel.
pub const STAGE_THRESHOLD: usize = 256 * 1024;

/// Budget for a chunked response frame including its JSON envelope.
const RESPONSE_FRAME_BUDGET: usize = 120 * 1024;

/// Split `body` into chunks of at most `chunk_size` bytes, never breaking
/// a UTF-8 code point. Returns an empty vector for an empty body.
pub fn split_utf8_chunks(body: &str, chunk_size: usize) -> Vec<&str> {
    assert!(chunk_size > 0, "chunk_size must be positive");

    let mut chunks = Vec::new();
    let mut rest = body;
    while rest.len() > chunk_size {
        let mut split = chunk_size;
        while !rest.is_char_boundary(split) {
            split -= 1;
        }
        let (head, tail) = rest.split_at(split);
        chunks.push(head);
        rest = tail;
    }
    if !rest.is_empty() {
        chunks.push(rest);
    }
    chunks
}

/// Effective chunk size for a response body, accounting for the JSON
/// envelope overhead of the terminal frame.
///
/// `serialized_len` is the length of the terminal `proxy_response` frame
/// with the full body inline; `body_len` is the raw body length. The
/// difference approximates the envelope overhead, which is subtracted
/// from the frame budget. Falls back to [`REQUEST_CHUNK_SIZE`] when the
/// overhead alone exhausts the budget.
pub fn effective_chunk_size(serialized_len: usize, body_len: usize) -> usize {
    let overhead = serialized_len.saturating_sub(body_len);
    let effective = RESPONSE_FRAME_BUDGET.saturating_sub(overhead);
    if effective == 0 || effective > REQUEST_CHUNK_SIZE {
        REQUEST_CHUNK_SIZE
    } else {
        effective
    }
}
