//! Object store adapter
//!
//! Bodies that would exceed the control-channel frame budget are staged
//! as short-lived blobs keyed by `request_id`: inbound request bodies
//! under `requests/{request_id}/body`, outbound response bodies under
//! `responses/{request_id}/body`. Producers and consumers reach the
//! blobs through expiring signed URLs ([`sign::UrlSigner`]) rather than
//! shared credentials.

pub mod memory;
pub mod sign;

pub use memory::MemoryObjectStore;
pub use sign::{parse_signed_query, SignedUrlError, UrlSigner};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};

/// Prefix for staged inbound request bodies.
pub const REQUESTS_PREFIX: &str = "requests/";

/// Prefix for staged outbound response bodies.
pub const RESPONSES_PREFIX: &str = "responses/";

/// Key of a staged request body.
pub fn request_body_key(request_id: &str) -> String {
    format!("{}{}/body", REQUESTS_PREFIX, request_id)
}

/// Key of a staged response body.
pub fn response_body_key(request_id: &str) -> String {
    format!("{}{}/body", RESPONSES_PREFIX, request_id)
}

/// Extract the request id from a `requests/{request_id}/body` key.
pub fn request_id_from_key(key: &str) -> Option<&str> {
    let rest = key.strip_prefix(REQUESTS_PREFIX)?;
    let (request_id, _) = rest.split_once('/')?;
    if request_id.is_empty() {
        None
    } else {
        Some(request_id)
    }
}

/// A staged blob.
#[derive(Debug, Clone)]
pub struct StoredObject {
    pub data: Bytes,
    pub content_type: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl StoredObject {
    pub fn new(data: Bytes, content_type: Option<String>) -> Self {
        Self {
            data,
            content_type,
            created_at: Utc::now(),
        }
    }

    pub fn content_length(&self) -> usize {
        self.data.len()
    }
}

/// Object store errors.
#[derive(Debug, thiserror::Error)]
pub enum ObjectStoreError {
    #[error("object {0} not found")]
    NotFound(String),

    #[error("object store backend error: {0}")]
    Backend(String),
}

/// Blob storage seam.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn put(&self, key: &str, object: StoredObject) -> Result<(), ObjectStoreError>;

    async fn get(&self, key: &str) -> Result<StoredObject, ObjectStoreError>;

    async fn delete(&self, key: &str) -> Result<(), ObjectStoreError>;
}
