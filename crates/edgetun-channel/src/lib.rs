//! Control channel between the edge and agents
//!
//! A message-oriented, authenticated, full-duplex transport carrying the
//! JSON frames defined in `edgetun-proto`. The server side lives here:
//! it authorizes connecting agents before binding them into the tunnel
//! registry, enforces the per-frame ceiling, serializes outbound writes
//! through one writer task per connection, and hands every inbound frame
//! to a [`FrameHandler`] in arrival order (per-direction FIFO is the
//! only ordering the protocol assumes).

pub mod connection;
pub mod server;

pub use connection::{AgentConnection, ConnectionMap};
pub use server::ChannelServer;

use async_trait::async_trait;
use edgetun_proto::Frame;

/// Channel errors.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("frame of {0} bytes exceeds the channel ceiling")]
    FrameTooLarge(usize),

    #[error("no live connection {0}")]
    ConnectionGone(String),

    #[error("connection {0} closed")]
    ConnectionClosed(String),

    #[error("frame encoding failed: {0}")]
    Encode(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Consumer of inbound frames — the dispatcher implements this.
///
/// Invoked serially per connection; malformed frames never reach it
/// (the channel logs and drops them).
#[async_trait]
pub trait FrameHandler: Send + Sync {
    async fn handle_frame(&self, connection_id: &str, frame: Frame);
}
