//! Tunnel bindings and hostname mapping

use crate::RegistryError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// Whether a tunnel currently has an agent connection bound to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TunnelStatus {
    Active,
    Inactive,
}

/// A named binding through which public requests reach one agent.
///
/// Invariant: `status == Active` exactly when `connection_id` is set.
/// Only [`TunnelRegistry::bind`] and [`TunnelRegistry::unbind`] mutate
/// those two fields, and they always move them together.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tunnel {
    pub tunnel_id: String,
    pub client_id: String,
    pub subdomain: String,
    /// Fully qualified public hostname, `{subdomain}.{base_domain}`.
    pub hostname: String,
    pub status: TunnelStatus,
    pub connection_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Tunnel {
    pub fn new(
        tunnel_id: impl Into<String>,
        client_id: impl Into<String>,
        subdomain: impl Into<String>,
        base_domain: &str,
    ) -> Self {
        let subdomain = subdomain.into();
        let now = Utc::now();
        Self {
            tunnel_id: tunnel_id.into(),
            client_id: client_id.into(),
            hostname: format!("{}.{}", subdomain, base_domain),
            subdomain,
            status: TunnelStatus::Inactive,
            connection_id: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_active(&self) -> bool {
        self.status == TunnelStatus::Active
    }
}

/// Bidirectional tunnel/connection mapping plus hostname resolution.
#[async_trait]
pub trait TunnelRegistry: Send + Sync {
    /// Register a new tunnel. Fails if its subdomain is already mapped.
    async fn create(&self, tunnel: Tunnel) -> Result<(), RegistryError>;

    async fn get(&self, tunnel_id: &str) -> Result<Tunnel, RegistryError>;

    /// Resolve a public hostname to its tunnel.
    async fn resolve_hostname(&self, hostname: &str) -> Result<Tunnel, RegistryError>;

    /// Tunnels owned by one client.
    async fn list(&self, client_id: &str) -> Result<Vec<Tunnel>, RegistryError>;

    /// Remove a tunnel and its hostname mapping.
    async fn delete(&self, tunnel_id: &str) -> Result<(), RegistryError>;

    /// Bind an agent connection: sets `status=active`, stamps
    /// `updated_at`. Rebinding an active tunnel atomically replaces the
    /// prior connection id (agent reconnect). Fails if the connection id
    /// is already bound to a different tunnel.
    async fn bind(&self, tunnel_id: &str, connection_id: &str) -> Result<(), RegistryError>;

    /// Clear the tunnel referencing `connection_id`, setting
    /// `status=inactive`. Returns the tunnel id, or `None` when the
    /// connection is unknown (already replaced by a reconnect, say).
    async fn unbind(&self, connection_id: &str) -> Result<Option<String>, RegistryError>;

    /// Reverse lookup by connection id.
    async fn lookup_by_connection(
        &self,
        connection_id: &str,
    ) -> Result<Option<Tunnel>, RegistryError>;
}

/// In-memory tunnel registry with a hostname index and a reverse
/// connection index.
#[derive(Debug, Default)]
pub struct MemoryTunnelRegistry {
    tunnels: DashMap<String, Tunnel>,
    /// hostname -> tunnel_id
    hostnames: DashMap<String, String>,
    /// connection_id -> tunnel_id
    connections: DashMap<String, String>,
}

impl MemoryTunnelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn count(&self) -> usize {
        self.tunnels.len()
    }
}

#[async_trait]
impl TunnelRegistry for MemoryTunnelRegistry {
    async fn create(&self, tunnel: Tunnel) -> Result<(), RegistryError> {
        match self.hostnames.entry(tunnel.hostname.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                return Err(RegistryError::SubdomainTaken(tunnel.subdomain.clone()));
            }
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                vacant.insert(tunnel.tunnel_id.clone());
            }
        }
        info!(
            tunnel_id = %tunnel.tunnel_id,
            hostname = %tunnel.hostname,
            "Registered tunnel"
        );
        self.tunnels.insert(tunnel.tunnel_id.clone(), tunnel);
        Ok(())
    }

    async fn get(&self, tunnel_id: &str) -> Result<Tunnel, RegistryError> {
        self.tunnels
            .get(tunnel_id)
            .map(|t| t.value().clone())
            .ok_or_else(|| RegistryError::TunnelNotFound(tunnel_id.to_string()))
    }

    async fn resolve_hostname(&self, hostname: &str) -> Result<Tunnel, RegistryError> {
        let tunnel_id = self
            .hostnames
            .get(hostname)
            .map(|id| id.value().clone())
            .ok_or_else(|| RegistryError::HostnameNotFound(hostname.to_string()))?;
        self.get(&tunnel_id).await
    }

    async fn list(&self, client_id: &str) -> Result<Vec<Tunnel>, RegistryError> {
        Ok(self
            .tunnels
            .iter()
            .filter(|t| t.client_id == client_id)
            .map(|t| t.value().clone())
            .collect())
    }

    async fn delete(&self, tunnel_id: &str) -> Result<(), RegistryError> {
        let (_, tunnel) = self
            .tunnels
            .remove(tunnel_id)
            .ok_or_else(|| RegistryError::TunnelNotFound(tunnel_id.to_string()))?;
        self.hostnames.remove(&tunnel.hostname);
        if let Some(connection_id) = &tunnel.connection_id {
            self.connections.remove(connection_id);
        }
        info!(tunnel_id = %tunnel_id, "Deleted tunnel");
        Ok(())
    }

    async fn bind(&self, tunnel_id: &str, connection_id: &str) -> Result<(), RegistryError> {
        // No two tunnels may share a connection id
        if let Some(owner) = self.connections.get(connection_id) {
            if owner.value() != tunnel_id {
                return Err(RegistryError::ConnectionInUse(
                    connection_id.to_string(),
                    owner.value().clone(),
                ));
            }
        }

        let mut tunnel = self
            .tunnels
            .get_mut(tunnel_id)
            .ok_or_else(|| RegistryError::TunnelNotFound(tunnel_id.to_string()))?;

        // Reconnect: drop the reverse entry for the replaced connection
        if let Some(old) = tunnel.connection_id.take() {
            self.connections.remove(&old);
            info!(
                tunnel_id = %tunnel_id,
                old_connection = %old,
                new_connection = %connection_id,
                "Rebinding tunnel to new connection"
            );
        } else {
            info!(tunnel_id = %tunnel_id, connection_id = %connection_id, "Bound tunnel");
        }

        tunnel.connection_id = Some(connection_id.to_string());
        tunnel.status = TunnelStatus::Active;
        tunnel.updated_at = Utc::now();
        drop(tunnel);

        self.connections
            .insert(connection_id.to_string(), tunnel_id.to_string());
        Ok(())
    }

    async fn unbind(&self, connection_id: &str) -> Result<Option<String>, RegistryError> {
        let Some((_, tunnel_id)) = self.connections.remove(connection_id) else {
            warn!(connection_id = %connection_id, "Unbind for unknown connection");
            return Ok(None);
        };

        if let Some(mut tunnel) = self.tunnels.get_mut(&tunnel_id) {
            // A reconnect may have already replaced this connection; only
            // clear the binding if it still points at us.
            if tunnel.connection_id.as_deref() == Some(connection_id) {
                tunnel.connection_id = None;
                tunnel.status = TunnelStatus::Inactive;
                tunnel.updated_at = Utc::now();
                info!(tunnel_id = %tunnel_id, connection_id = %connection_id, "Unbound tunnel");
            }
        }
        Ok(Some(tunnel_id))
    }

    async fn lookup_by_connection(
        &self,
        connection_id: &str,
    ) -> Result<Option<Tunnel>, RegistryError> {
        let tunnel_id = match self.connections.get(connection_id) {
            Some(id) => id.value().clone(),
            None => return Ok(None),
        };
        Ok(Some(self.get(&tunnel_id).await?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tunnel(id: &str, subdomain: &str) -> Tunnel {
        Tunnel::new(id, "client-1", subdomain, "tunnel.example")
    }

    #[tokio::test]
    async fn test_create_and_resolve() {
        let registry = MemoryTunnelRegistry::new();
        registry.create(tunnel("t1", "myapp")).await.unwrap();

        let resolved = registry
            .resolve_hostname("myapp.tunnel.example")
            .await
            .unwrap();
        assert_eq!(resolved.tunnel_id, "t1");
        assert_eq!(resolved.status, TunnelStatus::Inactive);
    }

    #[tokio::test]
    async fn test_subdomain_conflict() {
        let registry = MemoryTunnelRegistry::new();
        registry.create(tunnel("t1", "myapp")).await.unwrap();

        let err = registry.create(tunnel("t2", "myapp")).await.unwrap_err();
        assert!(matches!(err, RegistryError::SubdomainTaken(_)));
    }

    #[tokio::test]
    async fn test_bind_activates_tunnel() {
        let registry = MemoryTunnelRegistry::new();
        registry.create(tunnel("t1", "myapp")).await.unwrap();

        registry.bind("t1", "conn-1").await.unwrap();
        let bound = registry.get("t1").await.unwrap();
        assert_eq!(bound.status, TunnelStatus::Active);
        assert_eq!(bound.connection_id.as_deref(), Some("conn-1"));
    }

    #[tokio::test]
    async fn test_status_active_iff_connection_present() {
        let registry = MemoryTunnelRegistry::new();
        registry.create(tunnel("t1", "myapp")).await.unwrap();

        let check = |t: &Tunnel| {
            assert_eq!(t.status == TunnelStatus::Active, t.connection_id.is_some());
        };
        check(&registry.get("t1").await.unwrap());

        registry.bind("t1", "conn-1").await.unwrap();
        check(&registry.get("t1").await.unwrap());

        registry.unbind("conn-1").await.unwrap();
        check(&registry.get("t1").await.unwrap());
    }

    #[tokio::test]
    async fn test_rebind_replaces_connection() {
        let registry = MemoryTunnelRegistry::new();
        registry.create(tunnel("t1", "myapp")).await.unwrap();

        registry.bind("t1", "conn-1").await.unwrap();
        registry.bind("t1", "conn-2").await.unwrap();

        let bound = registry.get("t1").await.unwrap();
        assert_eq!(bound.connection_id.as_deref(), Some("conn-2"));

        // The replaced connection no longer reverse-resolves
        assert!(registry
            .lookup_by_connection("conn-1")
            .await
            .unwrap()
            .is_none());
        assert_eq!(
            registry
                .lookup_by_connection("conn-2")
                .await
                .unwrap()
                .unwrap()
                .tunnel_id,
            "t1"
        );
    }

    #[tokio::test]
    async fn test_stale_unbind_after_rebind_is_a_no_op() {
        let registry = MemoryTunnelRegistry::new();
        registry.create(tunnel("t1", "myapp")).await.unwrap();

        registry.bind("t1", "conn-1").await.unwrap();
        registry.bind("t1", "conn-2").await.unwrap();

        // The old connection's disconnect hook fires late
        registry.unbind("conn-1").await.unwrap();

        let bound = registry.get("t1").await.unwrap();
        assert_eq!(bound.status, TunnelStatus::Active);
        assert_eq!(bound.connection_id.as_deref(), Some("conn-2"));
    }

    #[tokio::test]
    async fn test_no_two_tunnels_share_a_connection() {
        let registry = MemoryTunnelRegistry::new();
        registry.create(tunnel("t1", "one")).await.unwrap();
        registry.create(tunnel("t2", "two")).await.unwrap();

        registry.bind("t1", "conn-1").await.unwrap();
        let err = registry.bind("t2", "conn-1").await.unwrap_err();
        assert!(matches!(err, RegistryError::ConnectionInUse(_, _)));
    }

    #[tokio::test]
    async fn test_unbind_unknown_connection() {
        let registry = MemoryTunnelRegistry::new();
        assert_eq!(registry.unbind("ghost").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_delete_clears_indexes() {
        let registry = MemoryTunnelRegistry::new();
        registry.create(tunnel("t1", "myapp")).await.unwrap();
        registry.bind("t1", "conn-1").await.unwrap();

        registry.delete("t1").await.unwrap();
        assert!(registry.resolve_hostname("myapp.tunnel.example").await.is_err());
        assert!(registry
            .lookup_by_connection("conn-1")
            .await
            .unwrap()
            .is_none());

        // Subdomain is reusable after deletion
        registry.create(tunnel("t3", "myapp")).await.unwrap();
    }

    #[tokio::test]
    async fn test_list_by_client() {
        let registry = MemoryTunnelRegistry::new();
        registry.create(tunnel("t1", "one")).await.unwrap();
        registry.create(tunnel("t2", "two")).await.unwrap();
        registry
            .create(Tunnel::new("t3", "client-2", "three", "tunnel.example"))
            .await
            .unwrap();

        let mine = registry.list("client-1").await.unwrap();
        assert_eq!(mine.len(), 2);
    }
}
