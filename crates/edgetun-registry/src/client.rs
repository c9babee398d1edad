//! Client credential registry
//!
//! Agents authenticate to the control channel with a bearer API key.
//! Keys are issued once, stored only as SHA-256 digests, and verified by
//! an indexed digest lookup.

use crate::RegistryError;
use async_trait::async_trait;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::info;

const API_KEY_BYTES: usize = 32;
const API_KEY_PREFIX: &str = "tk_";

/// A registered tenant client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Client {
    pub client_id: String,
    /// SHA-256 hex digest of the API key; the key itself is never stored.
    #[serde(skip_serializing)]
    pub api_key_hash: String,
    pub active: bool,
    pub created_at: DateTime<Utc>,
}

/// A freshly issued credential, returned to the caller exactly once.
#[derive(Debug, Clone, Serialize)]
pub struct IssuedKey {
    pub client_id: String,
    pub api_key: String,
}

/// Generate a `tk_`-prefixed API key from 32 random bytes.
pub fn generate_api_key() -> String {
    let mut bytes = [0u8; API_KEY_BYTES];
    rand::thread_rng().fill_bytes(&mut bytes);
    format!("{}{}", API_KEY_PREFIX, URL_SAFE_NO_PAD.encode(bytes))
}

/// SHA-256 hex digest of an API key, the registry's index key.
pub fn hash_api_key(api_key: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(api_key.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Client credential store.
#[async_trait]
pub trait ClientRegistry: Send + Sync {
    /// Register a new client and issue its API key.
    async fn register(&self) -> Result<IssuedKey, RegistryError>;

    /// Verify a presented API key; returns the client id of an active
    /// client, or [`RegistryError::Unauthorized`].
    async fn verify_key(&self, api_key: &str) -> Result<String, RegistryError>;

    async fn deactivate(&self, client_id: &str) -> Result<(), RegistryError>;
}

/// In-memory client registry indexed by key digest.
#[derive(Debug, Default)]
pub struct MemoryClientRegistry {
    /// api_key_hash -> client
    by_hash: DashMap<String, Client>,
    /// client_id -> api_key_hash
    by_id: DashMap<String, String>,
}

impl MemoryClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn count(&self) -> usize {
        self.by_hash.len()
    }
}

#[async_trait]
impl ClientRegistry for MemoryClientRegistry {
    async fn register(&self) -> Result<IssuedKey, RegistryError> {
        let client_id = {
            let mut bytes = [0u8; 16];
            rand::thread_rng().fill_bytes(&mut bytes);
            bytes.iter().map(|b| format!("{:02x}", b)).collect::<String>()
        };
        let api_key = generate_api_key();
        let hash = hash_api_key(&api_key);

        let client = Client {
            client_id: client_id.clone(),
            api_key_hash: hash.clone(),
            active: true,
            created_at: Utc::now(),
        };
        self.by_hash.insert(hash.clone(), client);
        self.by_id.insert(client_id.clone(), hash);

        info!(client_id = %client_id, "Registered client");
        Ok(IssuedKey { client_id, api_key })
    }

    async fn verify_key(&self, api_key: &str) -> Result<String, RegistryError> {
        let hash = hash_api_key(api_key);
        match self.by_hash.get(&hash) {
            Some(client) if client.active => Ok(client.client_id.clone()),
            _ => Err(RegistryError::Unauthorized),
        }
    }

    async fn deactivate(&self, client_id: &str) -> Result<(), RegistryError> {
        let hash = self
            .by_id
            .get(client_id)
            .map(|h| h.value().clone())
            .ok_or(RegistryError::Unauthorized)?;
        if let Some(mut client) = self.by_hash.get_mut(&hash) {
            client.active = false;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_api_key_shape() {
        let key = generate_api_key();
        assert!(key.starts_with("tk_"));
        assert_ne!(key, generate_api_key());
    }

    #[test]
    fn test_hash_is_stable() {
        assert_eq!(hash_api_key("abc"), hash_api_key("abc"));
        assert_ne!(hash_api_key("abc"), hash_api_key("abd"));
    }

    #[tokio::test]
    async fn test_register_and_verify() {
        let registry = MemoryClientRegistry::new();
        let issued = registry.register().await.unwrap();

        let client_id = registry.verify_key(&issued.api_key).await.unwrap();
        assert_eq!(client_id, issued.client_id);
    }

    #[tokio::test]
    async fn test_verify_rejects_unknown_key() {
        let registry = MemoryClientRegistry::new();
        assert!(matches!(
            registry.verify_key("tk_bogus").await,
            Err(RegistryError::Unauthorized)
        ));
    }

    #[tokio::test]
    async fn test_deactivated_client_is_rejected() {
        let registry = MemoryClientRegistry::new();
        let issued = registry.register().await.unwrap();

        registry.deactivate(&issued.client_id).await.unwrap();
        assert!(matches!(
            registry.verify_key(&issued.api_key).await,
            Err(RegistryError::Unauthorized)
        ));
    }
}
