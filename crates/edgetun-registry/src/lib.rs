//! Tunnel and client registries
//!
//! Two small authoritative maps sit next to the pending-request store:
//! the tunnel registry (tunnel bindings plus the hostname map the edge
//! resolves subdomains against) and the client registry (API-key
//! credentials for agents). Connection lifecycle hooks mutate the tunnel
//! registry through [`TunnelRegistry::bind`] / [`TunnelRegistry::unbind`];
//! the lifecycle CRUD populates and drains both.

pub mod client;
pub mod tunnel;

pub use client::{Client, ClientRegistry, IssuedKey, MemoryClientRegistry};
pub use tunnel::{MemoryTunnelRegistry, Tunnel, TunnelRegistry, TunnelStatus};

/// Registry operation errors.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("tunnel {0} not found")]
    TunnelNotFound(String),

    #[error("hostname {0} is not mapped to a tunnel")]
    HostnameNotFound(String),

    #[error("subdomain {0} is already taken")]
    SubdomainTaken(String),

    #[error("connection {0} is already bound to tunnel {1}")]
    ConnectionInUse(String, String),

    #[error("invalid subdomain: {0}")]
    InvalidSubdomain(String),

    #[error("invalid credentials")]
    Unauthorized,

    #[error("registry backend error: {0}")]
    Backend(String),
}

/// Validate a caller-chosen subdomain: 3–63 chars, lowercase alphanumeric
/// and inner hyphens only.
pub fn validate_subdomain(subdomain: &str) -> bool {
    if subdomain.len() < 3 || subdomain.len() > 63 {
        return false;
    }
    subdomain.chars().enumerate().all(|(i, c)| {
        c.is_ascii_lowercase()
            || c.is_ascii_digit()
            || (c == '-' && i > 0 && i < subdomain.len() - 1)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_subdomain() {
        assert!(validate_subdomain("myapp"));
        assert!(validate_subdomain("my-app-01"));
        assert!(!validate_subdomain("ab"));
        assert!(!validate_subdomain("-leading"));
        assert!(!validate_subdomain("trailing-"));
        assert!(!validate_subdomain("Upper"));
        assert!(!validate_subdomain("under_score"));
        assert!(!validate_subdomain(&"x".repeat(64)));
    }
}
