//! Pending-request record model

use chrono::{DateTime, Duration, Utc};
use edgetun_proto::Headers;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Lifecycle status of a pending request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    /// Created via the upload-URL path; body has not arrived yet.
    WaitingUpload,
    /// Pushed (or about to be pushed) to the agent; awaiting a response.
    Pending,
    /// The agent opened an SSE stream for this request.
    Streaming,
    /// Terminal: a response is recorded.
    Completed,
    /// Terminal: the request could not be delivered.
    Failed,
}

impl RequestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestStatus::WaitingUpload => "waiting_upload",
            RequestStatus::Pending => "pending",
            RequestStatus::Streaming => "streaming",
            RequestStatus::Completed => "completed",
            RequestStatus::Failed => "failed",
        }
    }

    /// Terminal states are read-only until TTL expiry.
    pub fn is_terminal(&self) -> bool {
        matches!(self, RequestStatus::Completed | RequestStatus::Failed)
    }
}

/// One in-flight tunneled request, as persisted in the store.
///
/// The response view is persisted as sparse attributes on the same record;
/// [`response_view`](PendingRequest::response_view) derives the tagged
/// variant from whichever attributes are populated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingRequest {
    pub request_id: String,
    pub tunnel_id: String,
    pub method: String,
    /// Path with query string, as received at the edge.
    pub path: String,
    pub headers: Headers,
    /// Inline request body; empty when the body is staged out-of-band.
    pub body: String,
    pub status: RequestStatus,
    pub created_at: DateTime<Utc>,
    /// Absolute expiry; the store drops the record past this instant.
    pub expires_at: DateTime<Utc>,

    // Response attributes, populated by the dispatcher.
    pub response_status: Option<u16>,
    pub response_headers: Option<Headers>,
    pub response_body: Option<String>,
    /// Chunk count of a chunked buffered response; the edge reassembles
    /// the body from the accumulated `stream_chunks`.
    pub total_chunks: Option<u32>,

    // Streaming attributes.
    pub is_streaming: bool,
    pub stream_status: Option<u16>,
    pub stream_headers: Option<Headers>,
    /// Dense-from-zero chunk attributes; the edge removes entries as it
    /// consumes them, so a missing low index means already-consumed.
    pub stream_chunks: BTreeMap<u32, String>,
    pub stream_done: bool,

    // Object-store staging attributes.
    pub s3_request_key: Option<String>,
    pub s3_response_key: Option<String>,
    pub s3_response_put_url: Option<String>,
    pub s3_response_ready: bool,
}

impl PendingRequest {
    /// Create a fresh record expiring `ttl` from now.
    pub fn new(
        request_id: impl Into<String>,
        tunnel_id: impl Into<String>,
        method: impl Into<String>,
        path: impl Into<String>,
        headers: Headers,
        body: impl Into<String>,
        status: RequestStatus,
        ttl: Duration,
    ) -> Self {
        let now = Utc::now();
        Self {
            request_id: request_id.into(),
            tunnel_id: tunnel_id.into(),
            method: method.into(),
            path: path.into(),
            headers,
            body: body.into(),
            status,
            created_at: now,
            expires_at: now + ttl,
            response_status: None,
            response_headers: None,
            response_body: None,
            total_chunks: None,
            is_streaming: false,
            stream_status: None,
            stream_headers: None,
            stream_chunks: BTreeMap::new(),
            stream_done: false,
            s3_request_key: None,
            s3_response_key: None,
            s3_response_put_url: None,
            s3_response_ready: false,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    /// Derive the response view, if one is present.
    ///
    /// Checked in the same order the edge polls: streaming first, then a
    /// ready staged body, then a completed buffered response.
    pub fn response_view(&self) -> Option<ResponseView> {
        if self.is_streaming {
            return Some(ResponseView::Streaming {
                status: self.stream_status.unwrap_or(200),
                headers: self.stream_headers.clone().unwrap_or_default(),
            });
        }

        if self.s3_response_ready {
            if let Some(key) = &self.s3_response_key {
                return Some(ResponseView::Staged {
                    status: self.response_status.unwrap_or(200),
                    headers: self.response_headers.clone().unwrap_or_default(),
                    key: key.clone(),
                });
            }
        }

        if self.status == RequestStatus::Completed {
            return Some(ResponseView::Inline {
                status: self.response_status.unwrap_or(200),
                headers: self.response_headers.clone().unwrap_or_default(),
                body: self.assembled_body(),
            });
        }

        None
    }

    /// The buffered response body: inline, or reassembled from chunk
    /// attributes when the terminal frame recorded `total_chunks`.
    fn assembled_body(&self) -> String {
        match self.total_chunks {
            Some(total) if total > 0 => {
                let mut body = String::new();
                for index in 0..total {
                    if let Some(chunk) = self.stream_chunks.get(&index) {
                        body.push_str(chunk);
                    }
                }
                body
            }
            _ => self.response_body.clone().unwrap_or_default(),
        }
    }
}

/// Tagged response view derived from a record's sparse attributes.
#[derive(Debug, Clone, PartialEq)]
pub enum ResponseView {
    /// A fully buffered response.
    Inline {
        status: u16,
        headers: Headers,
        body: String,
    },
    /// An SSE response; chunks are drained from the record as they arrive.
    Streaming { status: u16, headers: Headers },
    /// A response body staged in the object store under `key`.
    Staged {
        status: u16,
        headers: Headers,
        key: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(status: RequestStatus) -> PendingRequest {
        PendingRequest::new(
            "r1",
            "t1",
            "GET",
            "/ping",
            Headers::new(),
            "",
            status,
            Duration::minutes(5),
        )
    }

    #[test]
    fn test_new_record_has_no_response_view() {
        assert_eq!(record(RequestStatus::Pending).response_view(), None);
        assert_eq!(record(RequestStatus::WaitingUpload).response_view(), None);
    }

    #[test]
    fn test_inline_view() {
        let mut rec = record(RequestStatus::Completed);
        rec.response_status = Some(201);
        rec.response_body = Some("created".to_string());

        match rec.response_view() {
            Some(ResponseView::Inline { status, body, .. }) => {
                assert_eq!(status, 201);
                assert_eq!(body, "created");
            }
            other => panic!("expected inline view, got {:?}", other),
        }
    }

    #[test]
    fn test_streaming_view_wins_over_completed() {
        let mut rec = record(RequestStatus::Streaming);
        rec.is_streaming = true;
        rec.stream_status = Some(200);
        rec.response_body = Some("ignored".to_string());

        assert!(matches!(
            rec.response_view(),
            Some(ResponseView::Streaming { status: 200, .. })
        ));
    }

    #[test]
    fn test_staged_view_requires_ready_flag() {
        let mut rec = record(RequestStatus::Pending);
        rec.s3_response_key = Some("responses/r1/body".to_string());
        assert_eq!(rec.response_view(), None);

        rec.s3_response_ready = true;
        assert!(matches!(
            rec.response_view(),
            Some(ResponseView::Staged { ref key, .. }) if key == "responses/r1/body"
        ));
    }

    #[test]
    fn test_chunked_body_reassembly() {
        let mut rec = record(RequestStatus::Completed);
        rec.response_status = Some(200);
        rec.total_chunks = Some(3);
        rec.stream_chunks.insert(0, "aa".to_string());
        rec.stream_chunks.insert(1, "bb".to_string());
        rec.stream_chunks.insert(2, "cc".to_string());

        match rec.response_view() {
            Some(ResponseView::Inline { body, .. }) => assert_eq!(body, "aabbcc"),
            other => panic!("expected inline view, got {:?}", other),
        }
    }

    #[test]
    fn test_expiry_check() {
        let mut rec = record(RequestStatus::Pending);
        assert!(!rec.is_expired(Utc::now()));
        rec.expires_at = Utc::now() - Duration::seconds(1);
        assert!(rec.is_expired(Utc::now()));
    }
}
