//! edgetun agent
//!
//! The long-lived process owning the private-network side of a tunnel.
//! It keeps an authenticated control channel open to the edge, turns
//! every pushed `proxy` frame into a local HTTP call, and returns the
//! response under the same request id — inline, chunked, streamed as
//! SSE, or staged through the object store when the frame budget or the
//! body's shape demands it.

pub mod agent;
pub mod backoff;
pub mod config;
pub mod forwarder;
pub mod reassembly;
pub mod sse;
pub mod transfer;

pub use agent::Agent;
pub use config::AgentConfig;

/// Agent errors.
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("channel error: {0}")]
    Channel(String),

    #[error("frame encoding failed: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("local request failed: {0}")]
    Local(#[from] reqwest::Error),

    #[error("object transfer failed with status {0}")]
    Transfer(u16),

    #[error("agent shut down")]
    Shutdown,
}
