//! Frame types and wire format

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Flat header map as carried on the wire.
///
/// The channel collapses multi-valued HTTP headers to their first value,
/// which is what the original system does as well.
pub type Headers = HashMap<String, String>;

/// A single control-channel message.
///
/// Serialized as `{"action": "...", "data": {...}}`; the keep-alive frames
/// carry no data member. Unknown actions fail to deserialize and are
/// logged and dropped by the receiver.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", content = "data")]
pub enum Frame {
    /// Request envelope pushed from the edge to the agent. Terminal when
    /// the body is inline, header-only when the body was chunked or staged.
    #[serde(rename = "proxy")]
    Proxy(ProxyRequest),

    /// One request-body chunk, sent before the `proxy` envelope.
    #[serde(rename = "proxy_chunk")]
    ProxyChunk(BodyChunk),

    /// Terminal buffered response from the agent, or header-only if the
    /// body was chunked or staged in the object store.
    #[serde(rename = "proxy_response")]
    ProxyResponse(ProxyResponse),

    /// One response-body chunk, sent before the terminal `proxy_response`.
    #[serde(rename = "proxy_response_chunk")]
    ProxyResponseChunk(BodyChunk),

    /// Opens a server-sent-event stream: carries status and headers.
    #[serde(rename = "proxy_stream_start")]
    StreamStart(StreamStart),

    /// One SSE event, with a monotonically increasing chunk index.
    #[serde(rename = "proxy_stream_chunk")]
    StreamChunk(BodyChunk),

    /// Closes a server-sent-event stream.
    #[serde(rename = "proxy_stream_end")]
    StreamEnd(StreamEnd),

    #[serde(rename = "PING")]
    Ping,

    #[serde(rename = "PONG")]
    Pong,
}

impl Frame {
    /// Serialize the frame to its JSON wire form.
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Parse a frame from its JSON wire form.
    pub fn decode(raw: &str) -> Result<Frame, serde_json::Error> {
        serde_json::from_str(raw)
    }

    /// The request id this frame correlates to, if any.
    pub fn request_id(&self) -> Option<&str> {
        match self {
            Frame::Proxy(p) => Some(&p.request_id),
            Frame::ProxyChunk(c) | Frame::ProxyResponseChunk(c) | Frame::StreamChunk(c) => {
                Some(&c.request_id)
            }
            Frame::ProxyResponse(r) => Some(&r.request_id),
            Frame::StreamStart(s) => Some(&s.request_id),
            Frame::StreamEnd(e) => Some(&e.request_id),
            Frame::Ping | Frame::Pong => None,
        }
    }
}

/// Payload of a `proxy` frame.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ProxyRequest {
    pub request_id: String,
    pub method: String,
    pub path: String,
    #[serde(default)]
    pub headers: Headers,
    /// Inline request body; empty when chunked or staged.
    #[serde(default)]
    pub body: String,
    /// Number of `proxy_chunk` frames preceding this envelope; 0 if inline.
    #[serde(default)]
    pub total_chunks: u32,
    /// Presigned PUT handle the agent may use to stage a large response.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub s3_put_url: Option<String>,
    /// Object key the staged response will live under.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub s3_response_key: Option<String>,
    /// Object key the request body was staged under, if out-of-band.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub s3_request_key: Option<String>,
    /// Presigned GET handle for an out-of-band request body.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub s3_request_get_url: Option<String>,
}

/// Payload shared by `proxy_chunk`, `proxy_response_chunk`, and
/// `proxy_stream_chunk` frames.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BodyChunk {
    pub request_id: String,
    pub chunk_index: u32,
    pub data: String,
}

/// Payload of a terminal `proxy_response` frame.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ProxyResponse {
    pub request_id: String,
    pub status_code: u16,
    #[serde(default)]
    pub response_headers: Headers,
    /// Inline response body; empty when chunked or staged.
    #[serde(default)]
    pub response_body: String,
    /// Number of `proxy_response_chunk` frames that carried the body.
    #[serde(default)]
    pub total_chunks: u32,
    /// Set when the body was staged in the object store instead.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub s3_response_key: Option<String>,
}

/// Payload of a `proxy_stream_start` frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamStart {
    pub request_id: String,
    pub status_code: u16,
    #[serde(default)]
    pub response_headers: Headers,
}

/// Payload of a `proxy_stream_end` frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamEnd {
    pub request_id: String,
}
