//! Agent configuration

use std::time::Duration;

/// Configuration for the agent.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Tunnel this agent serves.
    pub tunnel_id: String,

    /// Control channel endpoint, e.g. `ws://edge.example:9090/channel`.
    pub channel_url: String,

    /// Bearer API key presented during the channel handshake.
    pub api_key: String,

    /// Port of the local HTTP server requests are forwarded to.
    pub local_port: u16,

    /// Keep-alive PING cadence.
    pub heartbeat: Duration,

    /// Deadline for one local HTTP call.
    pub local_timeout: Duration,

    /// Reconnect backoff bounds.
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl AgentConfig {
    pub fn new(
        tunnel_id: impl Into<String>,
        channel_url: impl Into<String>,
        api_key: impl Into<String>,
        local_port: u16,
    ) -> Self {
        Self {
            tunnel_id: tunnel_id.into(),
            channel_url: channel_url.into(),
            api_key: api_key.into(),
            local_port,
            heartbeat: Duration::from_secs(30),
            local_timeout: Duration::from_secs(180),
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(60),
        }
    }

    /// Channel URL with the tunnel id appended as a query parameter.
    pub fn connect_url(&self) -> String {
        if self.channel_url.contains('?') {
            format!("{}&tunnel_id={}", self.channel_url, self.tunnel_id)
        } else {
            format!("{}?tunnel_id={}", self.channel_url, self.tunnel_id)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connect_url() {
        let config = AgentConfig::new("t1", "ws://edge:9090/channel", "tk_x", 3000);
        assert_eq!(config.connect_url(), "ws://edge:9090/channel?tunnel_id=t1");

        let config = AgentConfig::new("t1", "ws://edge:9090/channel?region=a", "tk_x", 3000);
        assert_eq!(
            config.connect_url(),
            "ws://edge:9090/channel?region=a&tunnel_id=t1"
        );
    }
}
