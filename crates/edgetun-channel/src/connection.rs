//! Live connection handles and the post-to-connection map

use crate::ChannelError;
use dashmap::DashMap;
use edgetun_proto::{Frame, FRAME_MAX};
use tokio::sync::mpsc;
use tracing::debug;

/// Handle to one live agent connection.
///
/// Sending enqueues the encoded frame to the connection's writer task,
/// which owns the socket's write half — writes are serialized because
/// the transport forbids concurrent writers.
#[derive(Debug, Clone)]
pub struct AgentConnection {
    connection_id: String,
    frame_tx: mpsc::Sender<String>,
}

impl AgentConnection {
    pub fn new(connection_id: impl Into<String>, frame_tx: mpsc::Sender<String>) -> Self {
        Self {
            connection_id: connection_id.into(),
            frame_tx,
        }
    }

    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    /// Enqueue a frame. Rejects frames above the channel ceiling; the
    /// sender is expected to have applied the chunking rules first.
    pub async fn send(&self, frame: &Frame) -> Result<(), ChannelError> {
        let encoded = frame.encode()?;
        if encoded.len() > FRAME_MAX {
            return Err(ChannelError::FrameTooLarge(encoded.len()));
        }
        self.frame_tx
            .send(encoded)
            .await
            .map_err(|_| ChannelError::ConnectionClosed(self.connection_id.clone()))
    }
}

/// Registry of live connections, keyed by `connection_id`.
///
/// This is the management surface the dispatcher and edge push frames
/// through; posting to an id with no live connection is an availability
/// error the caller surfaces (503/500), never retried here.
#[derive(Debug, Default)]
pub struct ConnectionMap {
    connections: DashMap<String, AgentConnection>,
}

impl ConnectionMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, connection: AgentConnection) {
        debug!(connection_id = %connection.connection_id(), "Connection registered");
        self.connections
            .insert(connection.connection_id().to_string(), connection);
    }

    pub fn remove(&self, connection_id: &str) -> Option<AgentConnection> {
        debug!(connection_id = %connection_id, "Connection removed");
        self.connections.remove(connection_id).map(|(_, c)| c)
    }

    pub fn contains(&self, connection_id: &str) -> bool {
        self.connections.contains_key(connection_id)
    }

    pub fn count(&self) -> usize {
        self.connections.len()
    }

    /// Post a frame to a live connection.
    pub async fn post(&self, connection_id: &str, frame: &Frame) -> Result<(), ChannelError> {
        let connection = self
            .connections
            .get(connection_id)
            .map(|c| c.value().clone())
            .ok_or_else(|| ChannelError::ConnectionGone(connection_id.to_string()))?;
        connection.send(frame).await
    }
}
