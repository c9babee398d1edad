//! In-memory store backend

use crate::{Patch, PendingRequest, PendingStore, StoreError};
use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// In-memory pending-request store.
///
/// Entries live in a concurrent map; patches are applied under the
/// entry's shard lock, which gives the atomic single-record update the
/// protocol requires. Expired entries are dropped lazily on access and
/// by the background sweeper.
#[derive(Debug, Default)]
pub struct MemoryPendingStore {
    entries: DashMap<String, PendingRequest>,
}

impl MemoryPendingStore {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    /// Drop every expired entry. Returns how many were removed.
    pub fn sweep(&self) -> usize {
        let now = Utc::now();
        let before = self.entries.len();
        self.entries.retain(|_, record| !record.is_expired(now));
        let removed = before - self.entries.len();
        if removed > 0 {
            debug!(removed, "Swept expired pending requests");
        }
        removed
    }

    /// Number of live entries (expired-but-unswept entries included).
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Spawn a background task sweeping `store` every `period`.
pub fn start_sweeper(store: Arc<MemoryPendingStore>, period: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            interval.tick().await;
            store.sweep();
        }
    })
}

#[async_trait]
impl PendingStore for MemoryPendingStore {
    async fn put(&self, record: PendingRequest) -> Result<(), StoreError> {
        let now = Utc::now();
        match self.entries.entry(record.request_id.clone()) {
            dashmap::mapref::entry::Entry::Occupied(mut occupied) => {
                if occupied.get().is_expired(now) {
                    occupied.insert(record);
                    Ok(())
                } else {
                    Err(StoreError::AlreadyExists(record.request_id))
                }
            }
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                vacant.insert(record);
                Ok(())
            }
        }
    }

    async fn get(&self, request_id: &str) -> Result<PendingRequest, StoreError> {
        let expired = match self.entries.get(request_id) {
            Some(record) if record.is_expired(Utc::now()) => true,
            Some(record) => return Ok(record.value().clone()),
            None => return Err(StoreError::NotFound(request_id.to_string())),
        };
        if expired {
            self.entries.remove(request_id);
        }
        Err(StoreError::NotFound(request_id.to_string()))
    }

    async fn patch(&self, request_id: &str, patch: Patch) -> Result<(), StoreError> {
        let expired = match self.entries.get_mut(request_id) {
            Some(mut record) => {
                if record.is_expired(Utc::now()) {
                    true
                } else {
                    patch.apply(&mut record);
                    return Ok(());
                }
            }
            None => return Err(StoreError::NotFound(request_id.to_string())),
        };
        if expired {
            self.entries.remove(request_id);
        }
        Err(StoreError::NotFound(request_id.to_string()))
    }
}
