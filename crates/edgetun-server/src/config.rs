//! Edge configuration

use chrono::Duration as ChronoDuration;
use std::time::Duration;

/// Tunables for the edge handler, dispatcher, and staging paths.
///
/// The defaults are the production values; tests shrink the windows.
#[derive(Debug, Clone)]
pub struct EdgeConfig {
    /// Base public domain; tunnels live at `{subdomain}.{base_domain}`.
    pub base_domain: String,

    /// Store polling cadence while waiting for a response.
    pub poll_interval: Duration,

    /// Overall deadline for a tunneled round trip.
    pub poll_deadline: Duration,

    /// How long the edge tolerates a briefly-absent agent.
    pub grace_window: Duration,

    /// Registry probe cadence inside the grace window.
    pub grace_probe_interval: Duration,

    /// Grace only applies when the tunnel binding changed this recently.
    pub grace_updated_within: ChronoDuration,

    /// TTL of a pending record created on the synchronous path.
    pub pending_ttl: ChronoDuration,

    /// TTL of a record waiting for an out-of-band upload.
    pub upload_ttl: ChronoDuration,

    /// Lifetime of presigned object handles.
    pub presign_ttl: ChronoDuration,
}

impl Default for EdgeConfig {
    fn default() -> Self {
        Self {
            base_domain: "tunnel.localhost".to_string(),
            poll_interval: Duration::from_millis(50),
            poll_deadline: Duration::from_secs(180),
            grace_window: Duration::from_secs(30),
            grace_probe_interval: Duration::from_millis(500),
            grace_updated_within: ChronoDuration::minutes(5),
            pending_ttl: ChronoDuration::minutes(5),
            upload_ttl: ChronoDuration::minutes(30),
            presign_ttl: ChronoDuration::minutes(30),
        }
    }
}

impl EdgeConfig {
    pub fn with_base_domain(mut self, base_domain: impl Into<String>) -> Self {
        self.base_domain = base_domain.into();
        self
    }
}
