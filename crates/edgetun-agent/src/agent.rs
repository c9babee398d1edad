//! Agent lifecycle and message loop
//!
//! One reader loop per connection, one worker task per pushed request,
//! and a single writer owning the socket's write half — outbound frames
//! from workers and the heartbeat funnel through one queue because the
//! channel forbids concurrent writes.

use crate::backoff::Backoff;
use crate::config::AgentConfig;
use crate::forwarder::{select_response_mode, LocalForwarder, ResponseMode};
use crate::reassembly::ReassemblyBuffers;
use crate::sse::SseEventSplitter;
use crate::transfer::Transfer;
use crate::AgentError;
use edgetun_proto::{
    split_utf8_chunks, BodyChunk, Frame, Headers, ProxyRequest, ProxyResponse, StreamEnd,
    StreamStart, FRAME_MAX,
};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;

/// The tunnel agent: maintains the control channel and serves pushed
/// requests against the local HTTP server.
pub struct Agent {
    config: AgentConfig,
    forwarder: Arc<LocalForwarder>,
    transfer: Arc<Transfer>,
    buffers: Arc<ReassemblyBuffers>,
    shutdown_tx: watch::Sender<bool>,
}

/// Everything a request worker needs, cheap to clone per request.
#[derive(Clone)]
struct WorkerCtx {
    forwarder: Arc<LocalForwarder>,
    transfer: Arc<Transfer>,
    buffers: Arc<ReassemblyBuffers>,
    outbound: mpsc::Sender<Frame>,
}

impl WorkerCtx {
    async fn send(&self, frame: Frame) -> Result<(), AgentError> {
        self.outbound
            .send(frame)
            .await
            .map_err(|_| AgentError::Channel("connection closed".to_string()))
    }
}

impl Agent {
    pub fn new(config: AgentConfig) -> Result<Self, AgentError> {
        if config.tunnel_id.is_empty() {
            return Err(AgentError::Config("tunnel_id cannot be empty".to_string()));
        }
        if config.api_key.is_empty() {
            return Err(AgentError::Config("api_key cannot be empty".to_string()));
        }

        let forwarder = Arc::new(LocalForwarder::new(config.local_port, config.local_timeout)?);
        let transfer = Arc::new(Transfer::new()?);
        let (shutdown_tx, _) = watch::channel(false);

        Ok(Self {
            config,
            forwarder,
            transfer,
            buffers: Arc::new(ReassemblyBuffers::new()),
            shutdown_tx,
        })
    }

    /// Request a graceful shutdown; [`run`](Agent::run) returns soon after.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Connect and serve until shut down, reconnecting with bounded
    /// backoff on any read or write error.
    pub async fn run(&self) -> Result<(), AgentError> {
        let mut shutdown = self.shutdown_tx.subscribe();
        let mut backoff = Backoff::new(self.config.initial_backoff, self.config.max_backoff);

        info!(
            tunnel_id = %self.config.tunnel_id,
            local_port = self.config.local_port,
            "Starting agent"
        );

        loop {
            if *shutdown.borrow() {
                return Ok(());
            }

            match self.run_connection(&mut shutdown, &mut backoff).await {
                Ok(()) => {
                    info!(tunnel_id = %self.config.tunnel_id, "Agent stopped");
                    return Ok(());
                }
                Err(e) => {
                    warn!(
                        tunnel_id = %self.config.tunnel_id,
                        error = %e,
                        "Channel connection lost, reconnecting"
                    );
                }
            }

            tokio::select! {
                _ = backoff.wait() => {}
                _ = shutdown.changed() => return Ok(()),
            }
        }
    }

    /// One connection lifetime: connect, serve frames, tear down.
    async fn run_connection(
        &self,
        shutdown: &mut watch::Receiver<bool>,
        backoff: &mut Backoff,
    ) -> Result<(), AgentError> {
        let mut request = self
            .config
            .connect_url()
            .into_client_request()
            .map_err(|e| AgentError::Channel(e.to_string()))?;
        let bearer = HeaderValue::from_str(&format!("Bearer {}", self.config.api_key))
            .map_err(|_| AgentError::Config("api_key is not a valid header value".to_string()))?;
        request.headers_mut().insert("authorization", bearer);

        let (ws, _) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(|e| AgentError::Channel(e.to_string()))?;
        backoff.reset();
        info!(tunnel_id = %self.config.tunnel_id, "Connected to control channel");

        let (mut sink, mut source) = ws.split();
        let (outbound_tx, mut outbound_rx) = mpsc::channel::<Frame>(256);

        let mut heartbeat = tokio::time::interval(self.config.heartbeat);
        heartbeat.tick().await; // first tick completes immediately

        let result = loop {
            tokio::select! {
                _ = heartbeat.tick() => {
                    debug!(tunnel_id = %self.config.tunnel_id, "Sending ping");
                    if let Err(e) = send_frame(&mut sink, &Frame::Ping).await {
                        break Err(e);
                    }
                }

                maybe_frame = outbound_rx.recv() => {
                    match maybe_frame {
                        Some(frame) => {
                            if let Err(e) = send_frame(&mut sink, &frame).await {
                                break Err(e);
                            }
                        }
                        None => break Err(AgentError::Channel("writer queue closed".to_string())),
                    }
                }

                msg = source.next() => {
                    match msg {
                        Some(Ok(Message::Text(raw))) => self.handle_raw(&raw, &outbound_tx),
                        Some(Ok(Message::Binary(data))) => {
                            match String::from_utf8(data) {
                                Ok(raw) => self.handle_raw(&raw, &outbound_tx),
                                Err(_) => warn!("Dropping non-UTF-8 binary frame"),
                            }
                        }
                        Some(Ok(Message::Close(_))) => {
                            break Err(AgentError::Channel("closed by edge".to_string()));
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => break Err(AgentError::Channel(e.to_string())),
                        None => break Err(AgentError::Channel("stream ended".to_string())),
                    }
                }

                _ = shutdown.changed() => {
                    let _ = sink.close().await;
                    break Ok(());
                }
            }
        };

        // Reassembly buffers are per-connection state
        self.buffers.clear();
        result
    }

    /// Dispatch one inbound frame. Pushed requests get their own worker;
    /// chunks are buffered inline.
    fn handle_raw(&self, raw: &str, outbound: &mpsc::Sender<Frame>) {
        let frame = match Frame::decode(raw) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(error = %e, "Dropping malformed frame");
                return;
            }
        };

        match frame {
            Frame::Proxy(request) => {
                let ctx = WorkerCtx {
                    forwarder: self.forwarder.clone(),
                    transfer: self.transfer.clone(),
                    buffers: self.buffers.clone(),
                    outbound: outbound.clone(),
                };
                tokio::spawn(async move {
                    handle_proxy(ctx, request).await;
                });
            }
            Frame::ProxyChunk(chunk) => {
                self.buffers
                    .insert(&chunk.request_id, chunk.chunk_index, chunk.data);
            }
            Frame::Pong => debug!("Received pong"),
            Frame::Ping => {
                // The edge does not normally ping, but answer anyway
                let _ = outbound.try_send(Frame::Pong);
            }
            other => warn!(frame = ?other, "Unexpected frame on agent channel"),
        }
    }
}

async fn send_frame(sink: &mut WsSink, frame: &Frame) -> Result<(), AgentError> {
    let encoded = frame.encode()?;
    if encoded.len() > FRAME_MAX {
        return Err(AgentError::Channel(format!(
            "refusing to send {} byte frame",
            encoded.len()
        )));
    }
    sink.send(Message::Text(encoded))
        .await
        .map_err(|e| AgentError::Channel(e.to_string()))
}

/// One worker per pushed request: resolve the body, call the local
/// server, and return the response in whichever mode fits.
async fn handle_proxy(ctx: WorkerCtx, request: ProxyRequest) {
    let request_id = request.request_id.clone();
    debug!(
        request_id = %request_id,
        method = %request.method,
        path = %request.path,
        "Handling pushed request"
    );

    if let Err(e) = process_proxy(&ctx, request).await {
        error!(request_id = %request_id, error = %e, "Request handling failed");
        let error_frame = Frame::ProxyResponse(ProxyResponse {
            request_id: request_id.clone(),
            status_code: 500,
            response_headers: [(
                "Content-Type".to_string(),
                "application/json".to_string(),
            )]
            .into_iter()
            .collect(),
            response_body: serde_json::json!({ "error": e.to_string() }).to_string(),
            total_chunks: 0,
            s3_response_key: None,
        });
        if ctx.send(error_frame).await.is_err() {
            warn!(request_id = %request_id, "Connection closed before error response");
        }
    }
}

async fn process_proxy(ctx: &WorkerCtx, request: ProxyRequest) -> Result<(), AgentError> {
    // Resolve the request body: staged, chunked, or inline.
    let mut body = request.body.clone().into_bytes();
    if body.is_empty() {
        if let Some(url) = &request.s3_request_get_url {
            body = ctx.transfer.download(url).await?;
            debug!(
                request_id = %request.request_id,
                size = body.len(),
                "Downloaded staged request body"
            );
        }
    }
    if request.total_chunks > 0 {
        body = ctx
            .buffers
            .take(&request.request_id, request.total_chunks)
            .into_bytes();
        debug!(
            request_id = %request.request_id,
            chunks = request.total_chunks,
            size = body.len(),
            "Assembled chunked request body"
        );
    }

    let response = ctx
        .forwarder
        .forward(&request.method, &request.path, &request.headers, body)
        .await?;

    let content_type = response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();

    if content_type.contains("text/event-stream") {
        debug!(request_id = %request.request_id, "SSE response, forwarding progressively");
        return stream_response(ctx, &request.request_id, response).await;
    }

    let status = response.status().as_u16();
    let response_headers = flatten_headers(response.headers());
    let body = response.bytes().await?.to_vec();

    send_buffered(ctx, &request, status, response_headers, &content_type, body).await
}

/// Return a buffered response inline, chunked, or staged.
async fn send_buffered(
    ctx: &WorkerCtx,
    request: &ProxyRequest,
    status: u16,
    response_headers: Headers,
    content_type: &str,
    body: Vec<u8>,
) -> Result<(), AgentError> {
    let body_is_utf8 = std::str::from_utf8(&body).is_ok();
    let handle_available = request.s3_put_url.is_some() && request.s3_response_key.is_some();

    let terminal = Frame::ProxyResponse(ProxyResponse {
        request_id: request.request_id.clone(),
        status_code: status,
        response_headers: response_headers.clone(),
        response_body: String::from_utf8_lossy(&body).into_owned(),
        total_chunks: 0,
        s3_response_key: None,
    });
    let frame_len = terminal.encode()?.len();

    let mode = select_response_mode(
        frame_len,
        body.len(),
        content_type,
        body_is_utf8,
        handle_available,
    );

    if mode == ResponseMode::Stage {
        if let (Some(put_url), Some(key)) = (&request.s3_put_url, &request.s3_response_key) {
            match ctx.transfer.upload(put_url, content_type, body.clone()).await {
                Ok(()) => {
                    debug!(
                        request_id = %request.request_id,
                        key = %key,
                        size = body.len(),
                        "Staged response body"
                    );
                    return ctx
                        .send(Frame::ProxyResponse(ProxyResponse {
                            request_id: request.request_id.clone(),
                            status_code: status,
                            response_headers,
                            response_body: String::new(),
                            total_chunks: 0,
                            s3_response_key: Some(key.clone()),
                        }))
                        .await;
                }
                Err(e) => {
                    warn!(
                        request_id = %request.request_id,
                        error = %e,
                        "Staging failed, falling back to the channel"
                    );
                }
            }
        }
    }

    if !body_is_utf8 {
        warn!(
            request_id = %request.request_id,
            "Binary body could not be staged, returning lossy UTF-8 rendition"
        );
    }
    let body_text = String::from_utf8_lossy(&body).into_owned();

    if frame_len > FRAME_MAX {
        let chunk_size = match mode {
            ResponseMode::Chunk { chunk_size } => chunk_size,
            _ => edgetun_proto::effective_chunk_size(frame_len, body_text.len()),
        };
        let chunks = split_utf8_chunks(&body_text, chunk_size);
        let total_chunks = chunks.len() as u32;
        debug!(
            request_id = %request.request_id,
            total_chunks,
            chunk_size,
            "Response exceeds frame ceiling, chunking body"
        );
        for (index, chunk) in chunks.iter().enumerate() {
            ctx.send(Frame::ProxyResponseChunk(BodyChunk {
                request_id: request.request_id.clone(),
                chunk_index: index as u32,
                data: chunk.to_string(),
            }))
            .await?;
        }
        return ctx
            .send(Frame::ProxyResponse(ProxyResponse {
                request_id: request.request_id.clone(),
                status_code: status,
                response_headers,
                response_body: String::new(),
                total_chunks,
                s3_response_key: None,
            }))
            .await;
    }

    ctx.send(terminal).await
}

/// Forward an SSE response progressively: one stream chunk per event,
/// bracketed by stream start and end frames.
async fn stream_response(
    ctx: &WorkerCtx,
    request_id: &str,
    response: reqwest::Response,
) -> Result<(), AgentError> {
    let status = response.status().as_u16();
    let response_headers = flatten_headers(response.headers());

    ctx.send(Frame::StreamStart(StreamStart {
        request_id: request_id.to_string(),
        status_code: status,
        response_headers,
    }))
    .await?;

    let mut splitter = SseEventSplitter::new();
    let mut chunk_index = 0u32;
    let mut stream = response.bytes_stream();

    while let Some(next) = stream.next().await {
        match next {
            Ok(bytes) => {
                for event in splitter.push(&bytes) {
                    ctx.send(Frame::StreamChunk(BodyChunk {
                        request_id: request_id.to_string(),
                        chunk_index,
                        data: event,
                    }))
                    .await?;
                    chunk_index += 1;
                }
            }
            Err(e) => {
                warn!(request_id = %request_id, error = %e, "Error reading streaming body");
                break;
            }
        }
    }
    if let Some(event) = splitter.finish() {
        ctx.send(Frame::StreamChunk(BodyChunk {
            request_id: request_id.to_string(),
            chunk_index,
            data: event,
        }))
        .await?;
        chunk_index += 1;
    }

    debug!(request_id = %request_id, chunks = chunk_index, "Stream finished");
    ctx.send(Frame::StreamEnd(StreamEnd {
        request_id: request_id.to_string(),
    }))
    .await
}

fn flatten_headers(headers: &reqwest::header::HeaderMap) -> Headers {
    let mut flat = Headers::new();
    for (name, value) in headers {
        if let Ok(value) = value.to_str() {
            flat.entry(name.to_string())
                .or_insert_with(|| value.to_string());
        }
    }
    flat
}
