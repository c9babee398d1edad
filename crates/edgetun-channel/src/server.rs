//! Channel server: accept loop, authorization, and lifecycle hooks

use crate::connection::{AgentConnection, ConnectionMap};
use crate::{ChannelError, FrameHandler};
use edgetun_proto::{Frame, FRAME_MAX};
use edgetun_registry::{ClientRegistry, TunnelRegistry};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::handshake::server::{Request, Response};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

struct ChannelState {
    clients: Arc<dyn ClientRegistry>,
    tunnels: Arc<dyn TunnelRegistry>,
    connections: Arc<ConnectionMap>,
    handler: Arc<dyn FrameHandler>,
}

/// WebSocket listener terminating agent control channels.
///
/// Every accepted connection is authorized against the client registry
/// (bearer key, digest-indexed lookup) and checked for tunnel ownership
/// before the connect hook binds it into the tunnel registry. Closing
/// the socket fires the disconnect hook, which marks the tunnel
/// inactive.
pub struct ChannelServer {
    listener: TcpListener,
    state: Arc<ChannelState>,
}

impl ChannelServer {
    pub async fn bind(
        addr: SocketAddr,
        clients: Arc<dyn ClientRegistry>,
        tunnels: Arc<dyn TunnelRegistry>,
        connections: Arc<ConnectionMap>,
        handler: Arc<dyn FrameHandler>,
    ) -> Result<Self, ChannelError> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            state: Arc::new(ChannelState {
                clients,
                tunnels,
                connections,
                handler,
            }),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, ChannelError> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections until the task is cancelled.
    pub async fn run(self) -> Result<(), ChannelError> {
        info!(addr = %self.listener.local_addr()?, "Control channel listening");
        loop {
            let (stream, peer) = self.listener.accept().await?;
            let state = self.state.clone();
            tokio::spawn(async move {
                handle_socket(state, stream, peer).await;
            });
        }
    }
}

async fn handle_socket(state: Arc<ChannelState>, stream: TcpStream, peer: SocketAddr) {
    let mut tunnel_id: Option<String> = None;
    let mut bearer: Option<String> = None;

    let ws = match tokio_tungstenite::accept_hdr_async(stream, |req: &Request, resp: Response| {
        tunnel_id = query_param(req.uri().query(), "tunnel_id");
        bearer = req
            .headers()
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .and_then(extract_bearer)
            .map(str::to_string);
        Ok(resp)
    })
    .await
    {
        Ok(ws) => ws,
        Err(e) => {
            debug!(peer = %peer, error = %e, "WebSocket handshake failed");
            return;
        }
    };

    // Pre-connect authorization: bearer key, then tunnel ownership.
    let Some(tunnel_id) = tunnel_id else {
        reject(ws, "tunnel_id query parameter is required").await;
        return;
    };
    let Some(bearer) = bearer else {
        reject(ws, "bearer credential is required").await;
        return;
    };
    let client_id = match state.clients.verify_key(&bearer).await {
        Ok(id) => id,
        Err(_) => {
            warn!(peer = %peer, tunnel_id = %tunnel_id, "Channel authorization failed");
            reject(ws, "invalid credentials").await;
            return;
        }
    };
    let tunnel = match state.tunnels.get(&tunnel_id).await {
        Ok(tunnel) => tunnel,
        Err(_) => {
            reject(ws, "tunnel not found").await;
            return;
        }
    };
    if tunnel.client_id != client_id {
        warn!(
            peer = %peer,
            tunnel_id = %tunnel_id,
            client_id = %client_id,
            "Client is not authorized for tunnel"
        );
        reject(ws, "not authorized for this tunnel").await;
        return;
    }

    let connection_id = format!("conn-{}", Uuid::new_v4());
    let (sink, source) = ws.split();

    let (frame_tx, frame_rx) = mpsc::channel::<String>(256);
    tokio::spawn(writer_task(sink, frame_rx, connection_id.clone()));

    state
        .connections
        .insert(AgentConnection::new(&connection_id, frame_tx));

    // Connect hook: bind (or rebind on reconnect) the tunnel.
    if let Err(e) = state.tunnels.bind(&tunnel_id, &connection_id).await {
        error!(tunnel_id = %tunnel_id, error = %e, "Failed to bind tunnel");
        state.connections.remove(&connection_id);
        return;
    }

    info!(
        tunnel_id = %tunnel_id,
        connection_id = %connection_id,
        peer = %peer,
        "Agent channel established"
    );

    read_frames(&state, &connection_id, source).await;

    // Disconnect hook: drop the live handle, mark the tunnel inactive.
    state.connections.remove(&connection_id);
    match state.tunnels.unbind(&connection_id).await {
        Ok(Some(tunnel_id)) => {
            info!(tunnel_id = %tunnel_id, connection_id = %connection_id, "Agent channel closed")
        }
        Ok(None) => {
            debug!(connection_id = %connection_id, "Channel closed after tunnel rebind")
        }
        Err(e) => error!(connection_id = %connection_id, error = %e, "Unbind failed"),
    }
}

async fn read_frames(
    state: &ChannelState,
    connection_id: &str,
    mut source: SplitStream<WebSocketStream<TcpStream>>,
) {
    while let Some(result) = source.next().await {
        let raw = match result {
            Ok(Message::Text(raw)) => raw,
            Ok(Message::Binary(data)) => match String::from_utf8(data) {
                Ok(raw) => raw,
                Err(_) => {
                    warn!(connection_id = %connection_id, "Dropping non-UTF-8 binary frame");
                    continue;
                }
            },
            Ok(Message::Ping(_)) => {
                // Pong replies are queued by tungstenite itself
                trace!(connection_id = %connection_id, "Transport ping");
                continue;
            }
            Ok(Message::Pong(_)) => continue,
            Ok(Message::Close(_)) => {
                debug!(connection_id = %connection_id, "Close frame received");
                break;
            }
            Ok(_) => continue,
            Err(e) => {
                debug!(connection_id = %connection_id, error = %e, "Channel read error");
                break;
            }
        };

        if raw.len() > FRAME_MAX {
            warn!(
                connection_id = %connection_id,
                size = raw.len(),
                "Dropping oversized frame"
            );
            continue;
        }

        match Frame::decode(&raw) {
            Ok(frame) => state.handler.handle_frame(connection_id, frame).await,
            Err(e) => {
                // Integrity errors are logged and dropped, never propagated
                warn!(connection_id = %connection_id, error = %e, "Dropping malformed frame");
            }
        }
    }
}

async fn writer_task(
    mut sink: SplitSink<WebSocketStream<TcpStream>, Message>,
    mut rx: mpsc::Receiver<String>,
    connection_id: String,
) {
    while let Some(encoded) = rx.recv().await {
        if let Err(e) = sink.send(Message::Text(encoded)).await {
            debug!(connection_id = %connection_id, error = %e, "Channel write error");
            break;
        }
    }
    let _ = sink.close().await;
    debug!(connection_id = %connection_id, "Writer task ended");
}

async fn reject(mut ws: WebSocketStream<TcpStream>, reason: &str) {
    let _ = ws
        .close(Some(CloseFrame {
            code: CloseCode::Policy,
            reason: reason.to_string().into(),
        }))
        .await;
}

fn query_param(query: Option<&str>, name: &str) -> Option<String> {
    query?.split('&').find_map(|pair| {
        let (k, v) = pair.split_once('=')?;
        if k == name && !v.is_empty() {
            Some(v.to_string())
        } else {
            None
        }
    })
}

fn extract_bearer(header: &str) -> Option<&str> {
    let (scheme, token) = header.split_once(' ')?;
    let token = token.trim();
    if scheme.eq_ignore_ascii_case("bearer") && !token.is_empty() {
        Some(token)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_param() {
        assert_eq!(
            query_param(Some("tunnel_id=t1&x=y"), "tunnel_id"),
            Some("t1".to_string())
        );
        assert_eq!(query_param(Some("x=y"), "tunnel_id"), None);
        assert_eq!(query_param(Some("tunnel_id="), "tunnel_id"), None);
        assert_eq!(query_param(None, "tunnel_id"), None);
    }

    #[test]
    fn test_extract_bearer() {
        assert_eq!(extract_bearer("Bearer tk_abc"), Some("tk_abc"));
        assert_eq!(extract_bearer("bearer tk_abc"), Some("tk_abc"));
        assert_eq!(extract_bearer("Basic dXNlcg=="), None);
        assert_eq!(extract_bearer("Bearer "), None);
        assert_eq!(extract_bearer("Bearer"), None);
    }
}
