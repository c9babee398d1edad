//! Presigned object transfers
//!
//! Staged bodies move over plain HTTP against presigned URLs, so no
//! store credentials ever reach the agent.

use crate::AgentError;
use std::time::Duration;
use tracing::debug;

/// Object up/downloads over presigned URLs.
#[derive(Debug)]
pub struct Transfer {
    client: reqwest::Client,
}

impl Transfer {
    pub fn new() -> Result<Self, AgentError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(300))
            .build()?;
        Ok(Self { client })
    }

    /// PUT a body to a presigned URL.
    pub async fn upload(
        &self,
        presigned_url: &str,
        content_type: &str,
        body: Vec<u8>,
    ) -> Result<(), AgentError> {
        let size = body.len();
        let mut request = self.client.put(presigned_url).body(body);
        if !content_type.is_empty() {
            request = request.header("content-type", content_type);
        }
        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(AgentError::Transfer(response.status().as_u16()));
        }
        debug!(size, "Uploaded staged body");
        Ok(())
    }

    /// GET a body from a presigned URL.
    pub async fn download(&self, presigned_url: &str) -> Result<Vec<u8>, AgentError> {
        let response = self.client.get(presigned_url).send().await?;
        if !response.status().is_success() {
            return Err(AgentError::Transfer(response.status().as_u16()));
        }
        let body = response.bytes().await?;
        debug!(size = body.len(), "Downloaded staged body");
        Ok(body.to_vec())
    }
}
