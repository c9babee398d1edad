//! In-memory blob backend

use crate::{ObjectStore, ObjectStoreError, StoredObject};
use async_trait::async_trait;
use chrono::{Duration, Utc};
use dashmap::DashMap;
use tracing::debug;

/// In-memory object store.
///
/// Staged objects are operationally short-lived; [`sweep`] drops
/// everything older than the given age.
///
/// [`sweep`]: MemoryObjectStore::sweep
#[derive(Debug, Default)]
pub struct MemoryObjectStore {
    objects: DashMap<String, StoredObject>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    /// Drop objects older than `max_age`. Returns how many were removed.
    pub fn sweep(&self, max_age: Duration) -> usize {
        let cutoff = Utc::now() - max_age;
        let before = self.objects.len();
        self.objects.retain(|_, object| object.created_at > cutoff);
        let removed = before - self.objects.len();
        if removed > 0 {
            debug!(removed, "Swept expired staged objects");
        }
        removed
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn put(&self, key: &str, object: StoredObject) -> Result<(), ObjectStoreError> {
        debug!(key = %key, size = object.data.len(), "Stored object");
        self.objects.insert(key.to_string(), object);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<StoredObject, ObjectStoreError> {
        self.objects
            .get(key)
            .map(|o| o.value().clone())
            .ok_or_else(|| ObjectStoreError::NotFound(key.to_string()))
    }

    async fn delete(&self, key: &str) -> Result<(), ObjectStoreError> {
        self.objects.remove(key);
        Ok(())
    }
}
