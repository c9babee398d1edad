//! Per-request chunk reassembly buffers
//!
//! `proxy_chunk` frames arrive before their `proxy` envelope; chunks are
//! buffered per request id and drained when the envelope names the total.
//! Buffers are ephemeral: connection teardown clears them all.

use dashmap::DashMap;
use std::collections::BTreeMap;
use tracing::warn;

#[derive(Debug, Default)]
pub struct ReassemblyBuffers {
    buffers: DashMap<String, BTreeMap<u32, String>>,
}

impl ReassemblyBuffers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, request_id: &str, chunk_index: u32, data: String) {
        self.buffers
            .entry(request_id.to_string())
            .or_default()
            .insert(chunk_index, data);
    }

    /// Remove and assemble the buffered chunks for a request, in index
    /// order. Missing indices are logged and skipped.
    pub fn take(&self, request_id: &str, total_chunks: u32) -> String {
        let chunks = self
            .buffers
            .remove(request_id)
            .map(|(_, chunks)| chunks)
            .unwrap_or_default();

        let mut body = String::new();
        for index in 0..total_chunks {
            match chunks.get(&index) {
                Some(chunk) => body.push_str(chunk),
                None => warn!(
                    request_id = %request_id,
                    chunk_index = index,
                    "Missing chunk during reassembly"
                ),
            }
        }
        body
    }

    /// Drop every buffer (connection teardown).
    pub fn clear(&self) {
        self.buffers.clear();
    }

    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_out_of_order_reassembly() {
        let buffers = ReassemblyBuffers::new();
        buffers.insert("r1", 2, "cc".to_string());
        buffers.insert("r1", 0, "aa".to_string());
        buffers.insert("r1", 1, "bb".to_string());

        assert_eq!(buffers.take("r1", 3), "aabbcc");
        // Taking removes the buffer
        assert!(buffers.is_empty());
    }

    #[test]
    fn test_buffers_are_independent_per_request() {
        let buffers = ReassemblyBuffers::new();
        buffers.insert("r1", 0, "one".to_string());
        buffers.insert("r2", 0, "two".to_string());

        assert_eq!(buffers.take("r1", 1), "one");
        assert_eq!(buffers.take("r2", 1), "two");
    }

    #[test]
    fn test_missing_chunk_is_skipped() {
        let buffers = ReassemblyBuffers::new();
        buffers.insert("r1", 0, "aa".to_string());
        buffers.insert("r1", 2, "cc".to_string());

        assert_eq!(buffers.take("r1", 3), "aacc");
    }

    #[test]
    fn test_clear_on_teardown() {
        let buffers = ReassemblyBuffers::new();
        buffers.insert("r1", 0, "x".to_string());
        buffers.insert("r2", 0, "y".to_string());
        buffers.clear();
        assert!(buffers.is_empty());
        assert_eq!(buffers.take("r1", 1), "");
    }
}
