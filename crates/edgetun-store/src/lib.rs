//! Pending-request store
//!
//! The authoritative external state for in-flight tunneled requests. Each
//! record is keyed by `request_id` and carries the request view, a status,
//! and — once the agent has responded — exactly one response view: inline,
//! streaming, or staged in the object store.
//!
//! Write amplification dominates the streaming path, so the store accepts
//! sparse attribute-level patches ([`Patch`]) without rewriting the whole
//! record. Records expire at their TTL; any operation on an expired key
//! behaves as not-found.

pub mod memory;
pub mod patch;
pub mod record;

pub use memory::MemoryPendingStore;
pub use patch::Patch;
pub use record::{PendingRequest, RequestStatus, ResponseView};

use async_trait::async_trait;

/// Store operation errors.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("pending request {0} already exists")]
    AlreadyExists(String),

    #[error("pending request {0} not found")]
    NotFound(String),

    #[error("store backend error: {0}")]
    Backend(String),
}

/// Persistent mapping from `request_id` to request state.
///
/// Implementations must apply [`patch`](PendingStore::patch) as a single
/// atomic update per record; concurrent patches on disjoint attributes
/// both succeed, and same-attribute races are last-writer-wins.
#[async_trait]
pub trait PendingStore: Send + Sync {
    /// Create a record. Fails with [`StoreError::AlreadyExists`] if the
    /// key is already present and unexpired.
    async fn put(&self, record: PendingRequest) -> Result<(), StoreError>;

    /// Fetch a record, or [`StoreError::NotFound`] for missing/expired keys.
    async fn get(&self, request_id: &str) -> Result<PendingRequest, StoreError>;

    /// Atomically apply an attribute patch to a record. No prior read is
    /// required; missing/expired keys yield [`StoreError::NotFound`].
    async fn patch(&self, request_id: &str, patch: Patch) -> Result<(), StoreError>;
}
