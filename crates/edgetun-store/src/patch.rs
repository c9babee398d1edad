//! Attribute-level record patches

use crate::record::{PendingRequest, RequestStatus};
use edgetun_proto::Headers;
use tracing::warn;

/// One attribute assignment within a patch.
#[derive(Debug, Clone, PartialEq)]
pub enum Attr {
    Status(RequestStatus),
    ResponseStatus(u16),
    ResponseHeaders(Headers),
    ResponseBody(String),
    TotalChunks(u32),
    IsStreaming(bool),
    StreamStatus(u16),
    StreamHeaders(Headers),
    StreamChunk(u32, String),
    StreamDone(bool),
    S3RequestKey(String),
    S3ResponseKey(String),
    S3ResponsePutUrl(String),
    S3ResponseReady(bool),
}

/// An atomic multi-attribute update: a set of assignments plus a set of
/// chunk-attribute removals, applied in one step under the record's lock.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Patch {
    set: Vec<Attr>,
    remove_chunks: Vec<u32>,
}

impl Patch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.set.is_empty() && self.remove_chunks.is_empty()
    }

    pub fn status(mut self, status: RequestStatus) -> Self {
        self.set.push(Attr::Status(status));
        self
    }

    pub fn response_status(mut self, status: u16) -> Self {
        self.set.push(Attr::ResponseStatus(status));
        self
    }

    pub fn response_headers(mut self, headers: Headers) -> Self {
        self.set.push(Attr::ResponseHeaders(headers));
        self
    }

    pub fn response_body(mut self, body: impl Into<String>) -> Self {
        self.set.push(Attr::ResponseBody(body.into()));
        self
    }

    pub fn total_chunks(mut self, total: u32) -> Self {
        self.set.push(Attr::TotalChunks(total));
        self
    }

    pub fn is_streaming(mut self, streaming: bool) -> Self {
        self.set.push(Attr::IsStreaming(streaming));
        self
    }

    pub fn stream_status(mut self, status: u16) -> Self {
        self.set.push(Attr::StreamStatus(status));
        self
    }

    pub fn stream_headers(mut self, headers: Headers) -> Self {
        self.set.push(Attr::StreamHeaders(headers));
        self
    }

    pub fn stream_chunk(mut self, index: u32, data: impl Into<String>) -> Self {
        self.set.push(Attr::StreamChunk(index, data.into()));
        self
    }

    pub fn stream_done(mut self) -> Self {
        self.set.push(Attr::StreamDone(true));
        self
    }

    pub fn s3_request_key(mut self, key: impl Into<String>) -> Self {
        self.set.push(Attr::S3RequestKey(key.into()));
        self
    }

    pub fn s3_response_key(mut self, key: impl Into<String>) -> Self {
        self.set.push(Attr::S3ResponseKey(key.into()));
        self
    }

    pub fn s3_response_put_url(mut self, url: impl Into<String>) -> Self {
        self.set.push(Attr::S3ResponsePutUrl(url.into()));
        self
    }

    pub fn s3_response_ready(mut self) -> Self {
        self.set.push(Attr::S3ResponseReady(true));
        self
    }

    /// Remove a consumed chunk attribute. The edge batches one removal
    /// patch per poll tick while draining a stream.
    pub fn remove_stream_chunk(mut self, index: u32) -> Self {
        self.remove_chunks.push(index);
        self
    }

    /// Apply the patch to a record. Assignments are applied first, then
    /// removals. A status assignment that would demote a terminal state
    /// is skipped: terminal records are read-only until TTL expiry.
    pub(crate) fn apply(&self, record: &mut PendingRequest) {
        for attr in &self.set {
            match attr {
                Attr::Status(status) => {
                    if record.status.is_terminal() && !status.is_terminal() {
                        warn!(
                            request_id = %record.request_id,
                            current = record.status.as_str(),
                            attempted = status.as_str(),
                            "Ignoring status demotion of terminal record"
                        );
                        continue;
                    }
                    record.status = *status;
                }
                Attr::ResponseStatus(s) => record.response_status = Some(*s),
                Attr::ResponseHeaders(h) => record.response_headers = Some(h.clone()),
                Attr::ResponseBody(b) => record.response_body = Some(b.clone()),
                Attr::TotalChunks(n) => record.total_chunks = Some(*n),
                Attr::IsStreaming(v) => record.is_streaming = *v,
                Attr::StreamStatus(s) => record.stream_status = Some(*s),
                Attr::StreamHeaders(h) => record.stream_headers = Some(h.clone()),
                Attr::StreamChunk(i, data) => {
                    record.stream_chunks.insert(*i, data.clone());
                }
                Attr::StreamDone(v) => record.stream_done = *v,
                Attr::S3RequestKey(k) => record.s3_request_key = Some(k.clone()),
                Attr::S3ResponseKey(k) => record.s3_response_key = Some(k.clone()),
                Attr::S3ResponsePutUrl(u) => record.s3_response_put_url = Some(u.clone()),
                Attr::S3ResponseReady(v) => record.s3_response_ready = *v,
            }
        }
        for index in &self.remove_chunks {
            record.stream_chunks.remove(index);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn record() -> PendingRequest {
        PendingRequest::new(
            "r1",
            "t1",
            "GET",
            "/",
            Headers::new(),
            "",
            RequestStatus::Pending,
            Duration::minutes(5),
        )
    }

    #[test]
    fn test_completion_patch() {
        let mut rec = record();
        Patch::new()
            .status(RequestStatus::Completed)
            .response_status(200)
            .response_body("ok")
            .apply(&mut rec);

        assert_eq!(rec.status, RequestStatus::Completed);
        assert_eq!(rec.response_status, Some(200));
        assert_eq!(rec.response_body.as_deref(), Some("ok"));
    }

    #[test]
    fn test_chunk_set_and_remove() {
        let mut rec = record();
        Patch::new()
            .stream_chunk(0, "a")
            .stream_chunk(1, "b")
            .apply(&mut rec);
        assert_eq!(rec.stream_chunks.len(), 2);

        Patch::new()
            .remove_stream_chunk(0)
            .remove_stream_chunk(1)
            .apply(&mut rec);
        assert!(rec.stream_chunks.is_empty());
    }

    #[test]
    fn test_terminal_state_is_never_demoted() {
        let mut rec = record();
        Patch::new().status(RequestStatus::Completed).apply(&mut rec);

        Patch::new().status(RequestStatus::Pending).apply(&mut rec);
        assert_eq!(rec.status, RequestStatus::Completed);

        // Terminal-to-terminal rewrites stay last-writer-wins
        Patch::new().status(RequestStatus::Failed).apply(&mut rec);
        assert_eq!(rec.status, RequestStatus::Failed);
    }

    #[test]
    fn test_removing_absent_chunk_is_harmless() {
        let mut rec = record();
        Patch::new().remove_stream_chunk(7).apply(&mut rec);
        assert!(rec.stream_chunks.is_empty());
    }

    #[test]
    fn test_empty_patch() {
        assert!(Patch::new().is_empty());
        assert!(!Patch::new().stream_done().is_empty());
    }
}
