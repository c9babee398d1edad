//! Channel lifecycle: authorize, bind, keep-alive, unbind on close

use async_trait::async_trait;
use edgetun_channel::{ChannelServer, ConnectionMap, FrameHandler};
use edgetun_proto::Frame;
use edgetun_registry::{
    ClientRegistry, MemoryClientRegistry, MemoryTunnelRegistry, Tunnel, TunnelRegistry,
};
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::{sleep, timeout};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message;

/// Records every inbound frame and answers PING with PONG through the
/// connection map, the way the dispatcher does.
struct PongHandler {
    connections: Arc<ConnectionMap>,
    seen: Mutex<Vec<Frame>>,
}

#[async_trait]
impl FrameHandler for PongHandler {
    async fn handle_frame(&self, connection_id: &str, frame: Frame) {
        self.seen.lock().await.push(frame.clone());
        if frame == Frame::Ping {
            let _ = self.connections.post(connection_id, &Frame::Pong).await;
        }
    }
}

struct Harness {
    tunnels: Arc<MemoryTunnelRegistry>,
    connections: Arc<ConnectionMap>,
    handler: Arc<PongHandler>,
    api_key: String,
    url: String,
    server_task: tokio::task::JoinHandle<()>,
}

async fn start_harness() -> Harness {
    let clients = Arc::new(MemoryClientRegistry::new());
    let issued = clients.register().await.unwrap();

    let tunnels = Arc::new(MemoryTunnelRegistry::new());
    tunnels
        .create(Tunnel::new("t1", &issued.client_id, "myapp", "tunnel.example"))
        .await
        .unwrap();

    let connections = Arc::new(ConnectionMap::new());
    let handler = Arc::new(PongHandler {
        connections: connections.clone(),
        seen: Mutex::new(Vec::new()),
    });

    let server = ChannelServer::bind(
        "127.0.0.1:0".parse().unwrap(),
        clients,
        tunnels.clone(),
        connections.clone(),
        handler.clone(),
    )
    .await
    .unwrap();
    let addr = server.local_addr().unwrap();
    let server_task = tokio::spawn(async move {
        let _ = server.run().await;
    });

    Harness {
        tunnels,
        connections,
        handler,
        api_key: issued.api_key,
        url: format!("ws://{}/channel?tunnel_id=t1", addr),
        server_task,
    }
}

async fn wait_until<F, Fut>(mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..200 {
        if condition().await {
            return;
        }
        sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached within 2s");
}

#[tokio::test]
async fn test_connect_bind_ping_and_unbind() {
    let harness = start_harness().await;

    let mut request = harness.url.clone().into_client_request().unwrap();
    request.headers_mut().insert(
        "authorization",
        format!("Bearer {}", harness.api_key).parse().unwrap(),
    );
    let (mut ws, _) = tokio_tungstenite::connect_async(request).await.unwrap();

    // Connect hook binds the tunnel
    let tunnels = harness.tunnels.clone();
    wait_until(|| {
        let tunnels = tunnels.clone();
        async move { tunnels.get("t1").await.unwrap().is_active() }
    })
    .await;

    let bound = harness.tunnels.get("t1").await.unwrap();
    let connection_id = bound.connection_id.clone().unwrap();
    assert!(harness.connections.contains(&connection_id));

    // Keep-alive round trip through the frame handler
    ws.send(Message::Text(Frame::Ping.encode().unwrap()))
        .await
        .unwrap();
    let reply = timeout(Duration::from_secs(2), ws.next())
        .await
        .expect("timed out waiting for PONG")
        .unwrap()
        .unwrap();
    assert_eq!(reply, Message::Text(r#"{"action":"PONG"}"#.to_string()));
    assert_eq!(
        harness.handler.seen.lock().await.as_slice(),
        &[Frame::Ping]
    );

    // Disconnect hook marks the tunnel inactive
    ws.close(None).await.unwrap();
    let tunnels = harness.tunnels.clone();
    wait_until(|| {
        let tunnels = tunnels.clone();
        async move { !tunnels.get("t1").await.unwrap().is_active() }
    })
    .await;
    assert!(!harness.connections.contains(&connection_id));

    harness.server_task.abort();
}

#[tokio::test]
async fn test_invalid_key_is_rejected_before_bind() {
    let harness = start_harness().await;

    let mut request = harness.url.clone().into_client_request().unwrap();
    request
        .headers_mut()
        .insert("authorization", "Bearer tk_wrong".parse().unwrap());
    let (mut ws, _) = tokio_tungstenite::connect_async(request).await.unwrap();

    // The server closes the socket without binding anything
    let next = timeout(Duration::from_secs(2), ws.next())
        .await
        .expect("timed out waiting for close");
    match next {
        Some(Ok(Message::Close(_))) | None => {}
        other => panic!("expected close, got {:?}", other),
    }
    assert!(!harness.tunnels.get("t1").await.unwrap().is_active());
    assert_eq!(harness.connections.count(), 0);

    harness.server_task.abort();
}

#[tokio::test]
async fn test_missing_tunnel_id_is_rejected() {
    let harness = start_harness().await;

    let url = harness.url.split('?').next().unwrap().to_string();
    let mut request = url.into_client_request().unwrap();
    request.headers_mut().insert(
        "authorization",
        format!("Bearer {}", harness.api_key).parse().unwrap(),
    );
    let (mut ws, _) = tokio_tungstenite::connect_async(request).await.unwrap();

    let next = timeout(Duration::from_secs(2), ws.next())
        .await
        .expect("timed out waiting for close");
    match next {
        Some(Ok(Message::Close(_))) | None => {}
        other => panic!("expected close, got {:?}", other),
    }

    harness.server_task.abort();
}
