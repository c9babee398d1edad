//! Local HTTP forwarding and response-mode selection

use crate::AgentError;
use edgetun_proto::{effective_chunk_size, Headers, FRAME_MAX, STAGE_THRESHOLD};
use reqwest::header::{HeaderName, HeaderValue};
use std::time::Duration;
use tracing::warn;

/// Forwards tunneled requests to the local HTTP server.
#[derive(Debug)]
pub struct LocalForwarder {
    client: reqwest::Client,
    base_url: String,
}

impl LocalForwarder {
    pub fn new(local_port: u16, timeout: Duration) -> Result<Self, AgentError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: format!("http://localhost:{}", local_port),
        })
    }

    /// Issue the local call with the supplied method, headers, and body.
    /// Any HTTP status the server returns is a valid response; only
    /// transport failures surface as errors.
    pub async fn forward(
        &self,
        method: &str,
        path: &str,
        headers: &Headers,
        body: Vec<u8>,
    ) -> Result<reqwest::Response, AgentError> {
        let method = reqwest::Method::from_bytes(method.as_bytes())
            .map_err(|_| AgentError::Config(format!("invalid method: {}", method)))?;
        let url = format!("{}{}", self.base_url, path);

        let mut request = self.client.request(method, &url).body(body);
        for (name, value) in headers {
            // The local client supplies its own connection-level headers
            if name.eq_ignore_ascii_case("host") || name.eq_ignore_ascii_case("content-length") {
                continue;
            }
            match (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(value),
            ) {
                (Ok(name), Ok(value)) => request = request.header(name, value),
                _ => warn!(header = %name, "Skipping unrepresentable header"),
            }
        }

        Ok(request.send().await?)
    }
}

/// How the agent returns a buffered response body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseMode {
    /// Single terminal `proxy_response` with the body inline.
    Inline,
    /// `proxy_response_chunk` frames of `chunk_size` bytes, then a
    /// terminal frame naming the total.
    Chunk { chunk_size: usize },
    /// PUT the body to the object store and send a terminal frame
    /// carrying only the staged key.
    Stage,
}

/// Binary media types that stage through the object store rather than
/// riding the channel.
pub fn is_binary_content_type(content_type: &str) -> bool {
    let ct = content_type.to_ascii_lowercase();
    [
        "video/",
        "audio/",
        "image/",
        "application/octet-stream",
        "application/pdf",
        "application/zip",
    ]
    .iter()
    .any(|prefix| ct.contains(prefix))
}

/// Pick the response mode for a buffered body.
///
/// `frame_len` is the serialized size of the terminal frame with the
/// body inline. Staging requires a presigned handle and applies when
/// the frame exceeds the channel ceiling and the body is large or
/// binary — or unconditionally when the body is not valid UTF-8, since
/// JSON frames cannot carry it byte-exactly.
pub fn select_response_mode(
    frame_len: usize,
    body_len: usize,
    content_type: &str,
    body_is_utf8: bool,
    handle_available: bool,
) -> ResponseMode {
    if handle_available {
        let binary = is_binary_content_type(content_type) || !body_is_utf8;
        if !body_is_utf8 {
            return ResponseMode::Stage;
        }
        if frame_len > FRAME_MAX && (body_len > STAGE_THRESHOLD || binary) {
            return ResponseMode::Stage;
        }
    }
    if frame_len > FRAME_MAX {
        ResponseMode::Chunk {
            chunk_size: effective_chunk_size(frame_len, body_len),
        }
    } else {
        ResponseMode::Inline
    }
}
