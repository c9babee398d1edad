//! Dispatcher: control-channel ingress
//!
//! Invoked per frame an agent sends. Every handler is one atomic store
//! patch — no prior read — so concurrent stream appends and completion
//! writes cannot corrupt a record. Keep-alive PINGs are answered
//! out-of-band through the connection map and never touch the store.

use crate::ServerError;
use async_trait::async_trait;
use edgetun_channel::{ConnectionMap, FrameHandler};
use edgetun_objects::{request_id_from_key, UrlSigner};
use edgetun_proto::{BodyChunk, Frame, ProxyRequest, ProxyResponse, StreamEnd, StreamStart};
use edgetun_registry::TunnelRegistry;
use edgetun_store::{Patch, PendingStore, RequestStatus};
use std::sync::Arc;
use tracing::{debug, info, warn};

pub struct Dispatcher {
    store: Arc<dyn PendingStore>,
    tunnels: Arc<dyn TunnelRegistry>,
    signer: UrlSigner,
    connections: Arc<ConnectionMap>,
    presign_ttl: chrono::Duration,
}

impl Dispatcher {
    pub fn new(
        store: Arc<dyn PendingStore>,
        tunnels: Arc<dyn TunnelRegistry>,
        signer: UrlSigner,
        connections: Arc<ConnectionMap>,
        presign_ttl: chrono::Duration,
    ) -> Self {
        Self {
            store,
            tunnels,
            signer,
            connections,
            presign_ttl,
        }
    }

    /// Terminal buffered response: completed with either an inline body,
    /// a staged key, or a chunk count the edge reassembles from.
    async fn on_proxy_response(&self, response: ProxyResponse) {
        let request_id = response.request_id.clone();
        let mut patch = Patch::new()
            .status(RequestStatus::Completed)
            .response_status(response.status_code)
            .response_headers(response.response_headers);

        let staged = response
            .s3_response_key
            .as_deref()
            .filter(|key| !key.is_empty());
        if let Some(key) = staged {
            patch = patch.s3_response_key(key).s3_response_ready();
        } else if response.total_chunks > 0 {
            patch = patch.total_chunks(response.total_chunks);
        } else {
            patch = patch.response_body(response.response_body);
        }

        match self.store.patch(&request_id, patch).await {
            Ok(()) => info!(
                request_id = %request_id,
                status = response.status_code,
                "Request completed"
            ),
            Err(e) => warn!(
                request_id = %request_id,
                error = %e,
                "Dropping response for unknown request"
            ),
        }
    }

    /// Chunk append, shared by response chunks and stream chunks. A
    /// record that has already expired is not a protocol error.
    async fn on_chunk(&self, chunk: BodyChunk) {
        let patch = Patch::new().stream_chunk(chunk.chunk_index, chunk.data);
        if let Err(e) = self.store.patch(&chunk.request_id, patch).await {
            warn!(
                request_id = %chunk.request_id,
                chunk_index = chunk.chunk_index,
                error = %e,
                "Dropping chunk for unknown request"
            );
        }
    }

    async fn on_stream_start(&self, start: StreamStart) {
        let patch = Patch::new()
            .status(RequestStatus::Streaming)
            .is_streaming(true)
            .stream_status(start.status_code)
            .stream_headers(start.response_headers);
        match self.store.patch(&start.request_id, patch).await {
            Ok(()) => debug!(request_id = %start.request_id, "Stream started"),
            Err(e) => warn!(
                request_id = %start.request_id,
                error = %e,
                "Dropping stream start for unknown request"
            ),
        }
    }

    async fn on_stream_end(&self, end: StreamEnd) {
        let patch = Patch::new()
            .stream_done()
            .status(RequestStatus::Completed);
        match self.store.patch(&end.request_id, patch).await {
            Ok(()) => debug!(request_id = %end.request_id, "Stream ended"),
            Err(e) => warn!(
                request_id = %end.request_id,
                error = %e,
                "Dropping stream end for unknown request"
            ),
        }
    }

    /// Out-of-band inbound body arrived under `requests/{id}/body`:
    /// move the record from `waiting_upload` to `pending` and push the
    /// envelope to the agent with a presigned GET in place of the body.
    pub async fn upload_notify(&self, key: &str) -> Result<(), ServerError> {
        let Some(request_id) = request_id_from_key(key) else {
            // Objects outside the requests prefix don't notify
            return Ok(());
        };
        info!(request_id = %request_id, key = %key, "Upload notification");

        let record = self.store.get(request_id).await?;
        let tunnel = self.tunnels.get(&record.tunnel_id).await?;
        let connection_id = match (&tunnel.connection_id, tunnel.is_active()) {
            (Some(connection_id), true) => connection_id.clone(),
            _ => return Err(ServerError::TunnelOffline(tunnel.tunnel_id)),
        };

        let get_url = self.signer.presign_get(key, self.presign_ttl);

        self.store
            .patch(
                request_id,
                Patch::new()
                    .status(RequestStatus::Pending)
                    .s3_request_key(key),
            )
            .await?;

        let frame = Frame::Proxy(ProxyRequest {
            request_id: request_id.to_string(),
            method: record.method,
            path: record.path,
            headers: record.headers,
            body: String::new(),
            total_chunks: 0,
            s3_put_url: record.s3_response_put_url,
            s3_response_key: record.s3_response_key,
            s3_request_key: Some(key.to_string()),
            s3_request_get_url: Some(get_url),
        });
        self.connections.post(&connection_id, &frame).await?;

        debug!(
            request_id = %request_id,
            connection_id = %connection_id,
            "Pushed staged request to agent"
        );
        Ok(())
    }
}

#[async_trait]
impl FrameHandler for Dispatcher {
    async fn handle_frame(&self, connection_id: &str, frame: Frame) {
        match frame {
            Frame::Ping => {
                // Keep-alive reply goes through the management surface,
                // not the store
                if let Err(e) = self.connections.post(connection_id, &Frame::Pong).await {
                    warn!(connection_id = %connection_id, error = %e, "Failed to send PONG");
                }
            }
            Frame::Pong => {}
            Frame::ProxyResponse(response) => self.on_proxy_response(response).await,
            Frame::ProxyResponseChunk(chunk) | Frame::StreamChunk(chunk) => {
                self.on_chunk(chunk).await
            }
            Frame::StreamStart(start) => self.on_stream_start(start).await,
            Frame::StreamEnd(end) => self.on_stream_end(end).await,
            other => {
                warn!(
                    connection_id = %connection_id,
                    frame = ?other,
                    "Unexpected agent-direction frame"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use edgetun_channel::AgentConnection;
    use edgetun_objects::response_body_key;
    use edgetun_proto::Headers;
    use edgetun_registry::{MemoryTunnelRegistry, Tunnel};
    use edgetun_store::{MemoryPendingStore, PendingRequest, ResponseView};
    use tokio::sync::mpsc;

    struct Fixture {
        dispatcher: Dispatcher,
        store: Arc<MemoryPendingStore>,
        tunnels: Arc<MemoryTunnelRegistry>,
        connections: Arc<ConnectionMap>,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(MemoryPendingStore::new());
        let tunnels = Arc::new(MemoryTunnelRegistry::new());
        let connections = Arc::new(ConnectionMap::new());
        let signer = UrlSigner::new(b"secret".to_vec(), "http://edge.local");
        let dispatcher = Dispatcher::new(
            store.clone(),
            tunnels.clone(),
            signer,
            connections.clone(),
            chrono::Duration::minutes(30),
        );
        Fixture {
            dispatcher,
            store,
            tunnels,
            connections,
        }
    }

    async fn seed_pending(store: &MemoryPendingStore, request_id: &str) {
        store
            .put(PendingRequest::new(
                request_id,
                "t1",
                "GET",
                "/ping",
                Headers::new(),
                "",
                RequestStatus::Pending,
                chrono::Duration::minutes(5),
            ))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_inline_response_completes_record() {
        let f = fixture();
        seed_pending(&f.store, "r1").await;

        f.dispatcher
            .handle_frame(
                "c1",
                Frame::ProxyResponse(ProxyResponse {
                    request_id: "r1".to_string(),
                    status_code: 200,
                    response_headers: [("Content-Type".to_string(), "text/plain".to_string())]
                        .into_iter()
                        .collect(),
                    response_body: "ok".to_string(),
                    total_chunks: 0,
                    s3_response_key: None,
                }),
            )
            .await;

        let record = f.store.get("r1").await.unwrap();
        assert_eq!(record.status, RequestStatus::Completed);
        match record.response_view() {
            Some(ResponseView::Inline { status, body, .. }) => {
                assert_eq!(status, 200);
                assert_eq!(body, "ok");
            }
            other => panic!("expected inline view, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_staged_response_sets_ready_flag() {
        let f = fixture();
        seed_pending(&f.store, "r1").await;

        f.dispatcher
            .handle_frame(
                "c1",
                Frame::ProxyResponse(ProxyResponse {
                    request_id: "r1".to_string(),
                    status_code: 200,
                    response_headers: Headers::new(),
                    response_body: String::new(),
                    total_chunks: 0,
                    s3_response_key: Some(response_body_key("r1")),
                }),
            )
            .await;

        let record = f.store.get("r1").await.unwrap();
        assert!(record.s3_response_ready);
        assert!(matches!(
            record.response_view(),
            Some(ResponseView::Staged { .. })
        ));
    }

    #[tokio::test]
    async fn test_chunked_response_records_total() {
        let f = fixture();
        seed_pending(&f.store, "r1").await;

        for (index, data) in ["aa", "bb"].iter().enumerate() {
            f.dispatcher
                .handle_frame(
                    "c1",
                    Frame::ProxyResponseChunk(BodyChunk {
                        request_id: "r1".to_string(),
                        chunk_index: index as u32,
                        data: data.to_string(),
                    }),
                )
                .await;
        }
        f.dispatcher
            .handle_frame(
                "c1",
                Frame::ProxyResponse(ProxyResponse {
                    request_id: "r1".to_string(),
                    status_code: 200,
                    response_headers: Headers::new(),
                    response_body: String::new(),
                    total_chunks: 2,
                    s3_response_key: None,
                }),
            )
            .await;

        let record = f.store.get("r1").await.unwrap();
        match record.response_view() {
            Some(ResponseView::Inline { body, .. }) => assert_eq!(body, "aabb"),
            other => panic!("expected inline view, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_stream_bracket() {
        let f = fixture();
        seed_pending(&f.store, "r1").await;

        f.dispatcher
            .handle_frame(
                "c1",
                Frame::StreamStart(StreamStart {
                    request_id: "r1".to_string(),
                    status_code: 200,
                    response_headers: [(
                        "Content-Type".to_string(),
                        "text/event-stream".to_string(),
                    )]
                    .into_iter()
                    .collect(),
                }),
            )
            .await;
        f.dispatcher
            .handle_frame(
                "c1",
                Frame::StreamChunk(BodyChunk {
                    request_id: "r1".to_string(),
                    chunk_index: 0,
                    data: "data: a\n\n".to_string(),
                }),
            )
            .await;
        f.dispatcher
            .handle_frame(
                "c1",
                Frame::StreamEnd(StreamEnd {
                    request_id: "r1".to_string(),
                }),
            )
            .await;

        let record = f.store.get("r1").await.unwrap();
        assert_eq!(record.status, RequestStatus::Completed);
        assert!(record.is_streaming);
        assert!(record.stream_done);
        assert_eq!(
            record.stream_chunks.get(&0).map(String::as_str),
            Some("data: a\n\n")
        );
    }

    #[tokio::test]
    async fn test_chunk_for_unknown_request_is_dropped() {
        let f = fixture();
        // No record exists; the frame is logged and dropped
        f.dispatcher
            .handle_frame(
                "c1",
                Frame::StreamChunk(BodyChunk {
                    request_id: "ghost".to_string(),
                    chunk_index: 3,
                    data: "x".to_string(),
                }),
            )
            .await;
        assert_eq!(f.store.len(), 0);
    }

    #[tokio::test]
    async fn test_terminal_state_survives_late_stream_start() {
        let f = fixture();
        seed_pending(&f.store, "r1").await;

        f.dispatcher
            .handle_frame(
                "c1",
                Frame::ProxyResponse(ProxyResponse {
                    request_id: "r1".to_string(),
                    status_code: 200,
                    response_headers: Headers::new(),
                    response_body: "done".to_string(),
                    total_chunks: 0,
                    s3_response_key: None,
                }),
            )
            .await;
        // A straggling stream start must not demote the terminal state
        f.dispatcher
            .handle_frame(
                "c1",
                Frame::StreamStart(StreamStart {
                    request_id: "r1".to_string(),
                    status_code: 200,
                    response_headers: Headers::new(),
                }),
            )
            .await;

        let record = f.store.get("r1").await.unwrap();
        assert_eq!(record.status, RequestStatus::Completed);
    }

    #[tokio::test]
    async fn test_ping_answers_pong_without_store_writes() {
        let f = fixture();
        let (tx, mut rx) = mpsc::channel(4);
        f.connections.insert(AgentConnection::new("c1", tx));

        f.dispatcher.handle_frame("c1", Frame::Ping).await;

        assert_eq!(rx.recv().await.unwrap(), r#"{"action":"PONG"}"#);
        assert_eq!(f.store.len(), 0);
    }

    #[tokio::test]
    async fn test_upload_notify_transitions_and_pushes() {
        let f = fixture();

        // Active tunnel with a live connection
        f.tunnels
            .create(Tunnel::new("t1", "client-1", "myapp", "tunnel.example"))
            .await
            .unwrap();
        f.tunnels.bind("t1", "c1").await.unwrap();
        let (tx, mut rx) = mpsc::channel(4);
        f.connections.insert(AgentConnection::new("c1", tx));

        // Record parked in waiting_upload with a response handle
        let mut record = PendingRequest::new(
            "r1",
            "t1",
            "POST",
            "/transcribe",
            Headers::new(),
            "",
            RequestStatus::WaitingUpload,
            chrono::Duration::minutes(30),
        );
        record.s3_response_key = Some(response_body_key("r1"));
        record.s3_response_put_url = Some("http://edge.local/objects/responses/r1/body?x".into());
        f.store.put(record).await.unwrap();

        f.dispatcher
            .upload_notify("requests/r1/body")
            .await
            .unwrap();

        let record = f.store.get("r1").await.unwrap();
        assert_eq!(record.status, RequestStatus::Pending);
        assert_eq!(record.s3_request_key.as_deref(), Some("requests/r1/body"));

        let raw = rx.recv().await.unwrap();
        let frame = Frame::decode(&raw).unwrap();
        match frame {
            Frame::Proxy(request) => {
                assert_eq!(request.request_id, "r1");
                assert_eq!(request.method, "POST");
                assert!(request.body.is_empty());
                let get_url = request.s3_request_get_url.expect("presigned GET");
                assert!(get_url.contains("/objects/requests/r1/body?"));
                assert_eq!(
                    request.s3_response_key.as_deref(),
                    Some("responses/r1/body")
                );
            }
            other => panic!("expected proxy frame, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_upload_notify_requires_active_tunnel() {
        let f = fixture();
        f.tunnels
            .create(Tunnel::new("t1", "client-1", "myapp", "tunnel.example"))
            .await
            .unwrap();
        seed_pending(&f.store, "r1").await;

        let err = f
            .dispatcher
            .upload_notify("requests/r1/body")
            .await
            .unwrap_err();
        assert!(matches!(err, ServerError::TunnelOffline(_)));
    }

    #[tokio::test]
    async fn test_upload_notify_ignores_other_prefixes() {
        let f = fixture();
        // Response-side objects never trigger the notify path
        f.dispatcher
            .upload_notify("responses/r1/body")
            .await
            .unwrap();
    }
}
