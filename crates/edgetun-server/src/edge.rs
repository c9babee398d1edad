//! Edge handler: public-request ingress
//!
//! Translates an inbound HTTP request into a correlated round trip:
//! resolve the subdomain, tolerate a briefly-absent agent, persist the
//! pending record, push the request over the control channel (chunked
//! when it exceeds the frame budget), then poll the store until the
//! response arrives — buffered, streamed, or staged.

use crate::{AppState, ServerError};
use axum::body::{Body, Bytes};
use axum::extract::{Path, RawQuery, State};
use axum::http::response::Builder;
use axum::http::{header, HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Uri};
use axum::response::Response;
use chrono::Utc;
use edgetun_proto::{
    generate_request_id, split_utf8_chunks, BodyChunk, Frame, Headers, ProxyRequest,
    REQUEST_CHUNK_SIZE,
};
use edgetun_registry::Tunnel;
use edgetun_store::{
    Patch, PendingRequest, PendingStore, RequestStatus, ResponseView,
};
use serde::Deserialize;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// `/t/{subdomain}` — proxy to the tunnel root.
pub async fn tunnel_root(
    State(state): State<Arc<AppState>>,
    Path(subdomain): Path<String>,
    RawQuery(query): RawQuery,
    method: Method,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let path = path_with_query("/", query);
    handle_tunnel_request(&state, &subdomain, method, path, headers, body).await
}

/// `/t/{subdomain}/{*proxy}` — proxy with a path.
pub async fn tunnel_path(
    State(state): State<Arc<AppState>>,
    Path((subdomain, proxy)): Path<(String, String)>,
    RawQuery(query): RawQuery,
    method: Method,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let path = path_with_query(&format!("/{}", proxy), query);
    handle_tunnel_request(&state, &subdomain, method, path, headers, body).await
}

/// Fallback: host-header routed tunnels (`{subdomain}.{base}/path`).
pub async fn host_routed(
    State(state): State<Arc<AppState>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let host = headers
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    let Some(subdomain) = subdomain_from_host(host, &state.config.base_domain) else {
        return error_response(StatusCode::NOT_FOUND, "Not found");
    };
    let path = uri
        .path_and_query()
        .map(|pq| pq.to_string())
        .unwrap_or_else(|| "/".to_string());
    handle_tunnel_request(&state, &subdomain, method, path, headers, body).await
}

async fn handle_tunnel_request(
    state: &Arc<AppState>,
    subdomain: &str,
    method: Method,
    path: String,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let hostname = format!("{}.{}", subdomain, state.config.base_domain);
    let tunnel = match state.tunnels.resolve_hostname(&hostname).await {
        Ok(tunnel) => tunnel,
        Err(_) => return error_response(StatusCode::NOT_FOUND, "Tunnel not found"),
    };

    let tunnel = match await_active(state, tunnel).await {
        Ok(tunnel) => tunnel,
        Err(response) => return response,
    };
    let Some(connection_id) = tunnel.connection_id.clone() else {
        return error_response(StatusCode::SERVICE_UNAVAILABLE, "Tunnel is not connected");
    };

    let request_id = generate_request_id();
    let request_headers = flatten_headers(&headers);

    // Pre-allocate the response staging handle so the agent can park
    // large or binary bodies in the object store.
    let response_key = edgetun_objects::response_body_key(&request_id);
    let response_put_url = state
        .signer
        .presign_put(&response_key, state.config.presign_ttl);

    // JSON frames carry text; a binary inline body is staged instead.
    let (record_body, staged_request) = match std::str::from_utf8(&body) {
        Ok(text) => (text.to_string(), None),
        Err(_) => {
            let key = edgetun_objects::request_body_key(&request_id);
            let content_type = headers
                .get(header::CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string);
            let object = edgetun_objects::StoredObject::new(body.clone(), content_type);
            if let Err(e) = state.objects.put(&key, object).await {
                error!(request_id = %request_id, error = %e, "Failed to stage request body");
                return error_response(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Failed to stage request body",
                );
            }
            let get_url = state.signer.presign_get(&key, state.config.presign_ttl);
            debug!(request_id = %request_id, size = body.len(), "Staged binary request body");
            (String::new(), Some((key, get_url)))
        }
    };

    let mut record = PendingRequest::new(
        &request_id,
        &tunnel.tunnel_id,
        method.as_str(),
        &path,
        request_headers.clone(),
        record_body.clone(),
        RequestStatus::Pending,
        state.config.pending_ttl,
    );
    record.s3_response_key = Some(response_key.clone());
    record.s3_response_put_url = Some(response_put_url.clone());
    if let Some((key, _)) = &staged_request {
        record.s3_request_key = Some(key.clone());
    }
    if let Err(e) = state.store.put(record).await {
        error!(request_id = %request_id, error = %e, "Failed to store pending request");
        return error_response(StatusCode::INTERNAL_SERVER_ERROR, "Failed to store request");
    }

    if let Err(e) = push_request(
        state,
        &connection_id,
        &request_id,
        method.as_str(),
        &path,
        &request_headers,
        record_body,
        &response_put_url,
        &response_key,
        staged_request,
    )
    .await
    {
        error!(
            request_id = %request_id,
            connection_id = %connection_id,
            error = %e,
            "Failed to push request to tunnel"
        );
        let _ = state
            .store
            .patch(&request_id, Patch::new().status(RequestStatus::Failed))
            .await;
        return error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            "Failed to send request to tunnel",
        );
    }

    info!(
        request_id = %request_id,
        tunnel_id = %tunnel.tunnel_id,
        method = %method,
        path = %path,
        "Request pushed to agent"
    );
    poll_and_respond(state, &request_id).await
}

/// Wait out the reconnect grace window for an inactive tunnel whose
/// binding changed recently; otherwise 503 immediately.
async fn await_active(state: &Arc<AppState>, tunnel: Tunnel) -> Result<Tunnel, Response> {
    if tunnel.is_active() {
        return Ok(tunnel);
    }

    let recently_bound =
        Utc::now().signed_duration_since(tunnel.updated_at) <= state.config.grace_updated_within;
    if !recently_bound {
        return Err(error_response(
            StatusCode::SERVICE_UNAVAILABLE,
            "Tunnel is not active",
        ));
    }

    info!(
        tunnel_id = %tunnel.tunnel_id,
        "Tunnel inactive, waiting for agent reconnect"
    );
    let deadline = Instant::now() + state.config.grace_window;
    while Instant::now() < deadline {
        tokio::time::sleep(state.config.grace_probe_interval).await;
        match state.tunnels.get(&tunnel.tunnel_id).await {
            Ok(current) if current.is_active() => {
                info!(tunnel_id = %tunnel.tunnel_id, "Agent reconnected within grace window");
                return Ok(current);
            }
            Ok(_) => {}
            Err(_) => break,
        }
    }

    warn!(tunnel_id = %tunnel.tunnel_id, "Reconnect grace window elapsed");
    Err(error_response(
        StatusCode::SERVICE_UNAVAILABLE,
        "Tunnel is not active",
    ))
}

#[allow(clippy::too_many_arguments)]
async fn push_request(
    state: &Arc<AppState>,
    connection_id: &str,
    request_id: &str,
    method: &str,
    path: &str,
    headers: &Headers,
    body: String,
    response_put_url: &str,
    response_key: &str,
    staged_request: Option<(String, String)>,
) -> Result<(), ServerError> {
    let (inline_body, total_chunks) = if body.len() > REQUEST_CHUNK_SIZE {
        let chunks: Vec<String> = split_utf8_chunks(&body, REQUEST_CHUNK_SIZE)
            .into_iter()
            .map(str::to_string)
            .collect();
        let total = chunks.len() as u32;
        debug!(
            request_id = %request_id,
            total_chunks = total,
            "Request body exceeds frame budget, chunking"
        );
        for (index, data) in chunks.into_iter().enumerate() {
            let frame = Frame::ProxyChunk(BodyChunk {
                request_id: request_id.to_string(),
                chunk_index: index as u32,
                data,
            });
            state.connections.post(connection_id, &frame).await?;
        }
        (String::new(), total)
    } else {
        (body, 0)
    };

    let (s3_request_key, s3_request_get_url) = match staged_request {
        Some((key, url)) => (Some(key), Some(url)),
        None => (None, None),
    };

    let frame = Frame::Proxy(ProxyRequest {
        request_id: request_id.to_string(),
        method: method.to_string(),
        path: path.to_string(),
        headers: headers.clone(),
        body: inline_body,
        total_chunks,
        s3_put_url: Some(response_put_url.to_string()),
        s3_response_key: Some(response_key.to_string()),
        s3_request_key,
        s3_request_get_url,
    });
    state.connections.post(connection_id, &frame).await?;
    Ok(())
}

/// Poll the store until a response view appears, the record fails, or
/// the deadline passes.
async fn poll_and_respond(state: &Arc<AppState>, request_id: &str) -> Response {
    let deadline = Instant::now() + state.config.poll_deadline;
    let mut ticker = tokio::time::interval(state.config.poll_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        ticker.tick().await;
        if Instant::now() >= deadline {
            warn!(request_id = %request_id, "Poll deadline elapsed");
            return error_response(
                StatusCode::GATEWAY_TIMEOUT,
                "Gateway timeout - no response from tunnel",
            );
        }

        let record = match state.store.get(request_id).await {
            Ok(record) => record,
            Err(_) => continue,
        };

        match record.response_view() {
            Some(ResponseView::Streaming { status, headers }) => {
                return streaming_response(state, request_id, status, headers);
            }
            Some(ResponseView::Staged {
                status,
                headers,
                key,
            }) => {
                return staged_response(state, status, headers, &key).await;
            }
            Some(ResponseView::Inline {
                status,
                headers,
                body,
            }) => {
                return data_response(status, &headers, Body::from(body));
            }
            None => {
                if record.status == RequestStatus::Failed {
                    return error_response(
                        StatusCode::BAD_GATEWAY,
                        "Tunnel failed to deliver the request",
                    );
                }
            }
        }
    }
}

/// Return status and headers immediately and feed the body from the
/// store as stream chunks arrive, removing each consumed chunk in one
/// batched patch per poll tick.
fn streaming_response(
    state: &Arc<AppState>,
    request_id: &str,
    status: u16,
    headers: Headers,
) -> Response {
    let (tx, rx) = mpsc::channel::<Result<Bytes, Infallible>>(32);

    let store = state.store.clone();
    let request_id = request_id.to_string();
    let poll_interval = state.config.poll_interval;
    let poll_deadline = state.config.poll_deadline;
    tokio::spawn(async move {
        stream_producer(store, request_id, tx, poll_interval, poll_deadline).await;
    });

    let stream = futures_util::stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|item| (item, rx))
    });
    data_response(status, &headers, Body::from_stream(stream))
}

async fn stream_producer(
    store: Arc<dyn PendingStore>,
    request_id: String,
    tx: mpsc::Sender<Result<Bytes, Infallible>>,
    poll_interval: std::time::Duration,
    poll_deadline: std::time::Duration,
) {
    let deadline = Instant::now() + poll_deadline;
    let mut ticker = tokio::time::interval(poll_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let mut next_chunk: u32 = 0;

    loop {
        ticker.tick().await;
        if Instant::now() >= deadline {
            debug!(request_id = %request_id, "Stream producer deadline elapsed");
            return;
        }

        let record = match store.get(&request_id).await {
            Ok(record) => record,
            Err(_) => {
                debug!(request_id = %request_id, "Record gone, closing stream");
                return;
            }
        };

        // Forward every dense chunk from the cursor, then remove the
        // consumed attributes in one batched patch.
        let mut removal = Patch::new();
        while let Some(data) = record.stream_chunks.get(&next_chunk) {
            if tx.send(Ok(Bytes::from(data.clone()))).await.is_err() {
                // Caller disconnected (499): abort promptly, leave the
                // record to its TTL.
                debug!(request_id = %request_id, "Caller gone, aborting stream producer");
                return;
            }
            removal = removal.remove_stream_chunk(next_chunk);
            next_chunk += 1;
        }
        if !removal.is_empty() {
            if let Err(e) = store.patch(&request_id, removal).await {
                debug!(request_id = %request_id, error = %e, "Chunk cleanup failed");
            }
        }

        if record.stream_done {
            debug!(request_id = %request_id, chunks = next_chunk, "Stream complete");
            return;
        }
    }
}

async fn staged_response(
    state: &Arc<AppState>,
    status: u16,
    mut headers: Headers,
    key: &str,
) -> Response {
    let object = match state.objects.get(key).await {
        Ok(object) => object,
        Err(e) => {
            error!(key = %key, error = %e, "Failed to fetch staged response");
            return error_response(
                StatusCode::BAD_GATEWAY,
                "Failed to fetch response from object store",
            );
        }
    };

    let has_content_length = headers
        .keys()
        .any(|name| name.eq_ignore_ascii_case("content-length"));
    if !has_content_length {
        headers.insert(
            "Content-Length".to_string(),
            object.content_length().to_string(),
        );
    }
    data_response(status, &headers, Body::from(object.data))
}

/// `/poll/{request_id}` — outcome of a deferred request.
pub async fn poll(
    State(state): State<Arc<AppState>>,
    Path(request_id): Path<String>,
) -> Response {
    let record = match state.store.get(&request_id).await {
        Ok(record) => record,
        Err(_) => return error_response(StatusCode::NOT_FOUND, "Request not found"),
    };

    match record.status {
        RequestStatus::Completed if !record.is_streaming => match record.response_view() {
            Some(ResponseView::Staged {
                status,
                headers,
                key,
            }) => staged_response(&state, status, headers, &key).await,
            Some(ResponseView::Inline {
                status,
                headers,
                body,
            }) => data_response(status, &headers, Body::from(body)),
            _ => status_response(&record),
        },
        RequestStatus::Failed => json_response(
            StatusCode::BAD_GATEWAY,
            serde_json::json!({ "status": "failed" }),
        ),
        _ => status_response(&record),
    }
}

fn status_response(record: &PendingRequest) -> Response {
    json_response(
        StatusCode::ACCEPTED,
        serde_json::json!({ "status": record.status.as_str() }),
    )
}

/// `/upload-url/{subdomain}` — deferred-body request, root path.
pub async fn upload_url_root(
    State(state): State<Arc<AppState>>,
    Path(subdomain): Path<String>,
    RawQuery(query): RawQuery,
    body: Bytes,
) -> Response {
    let path = path_with_query("/", query);
    handle_upload_url(&state, &subdomain, path, body).await
}

/// `/upload-url/{subdomain}/{*proxy}` — deferred-body request.
pub async fn upload_url_path(
    State(state): State<Arc<AppState>>,
    Path((subdomain, proxy)): Path<(String, String)>,
    RawQuery(query): RawQuery,
    body: Bytes,
) -> Response {
    let path = path_with_query(&format!("/{}", proxy), query);
    handle_upload_url(&state, &subdomain, path, body).await
}

#[derive(Debug, Default, Deserialize)]
struct UploadUrlMeta {
    #[serde(default)]
    method: Option<String>,
    #[serde(default)]
    content_type: Option<String>,
    #[serde(default)]
    headers: Option<Headers>,
}

/// Create a `waiting_upload` record and hand the caller a presigned PUT
/// for the body plus a poll URL for the outcome. The push to the agent
/// happens when the upload-notify event fires.
async fn handle_upload_url(
    state: &Arc<AppState>,
    subdomain: &str,
    path: String,
    body: Bytes,
) -> Response {
    let meta: UploadUrlMeta = if body.is_empty() {
        UploadUrlMeta::default()
    } else {
        serde_json::from_slice(&body).unwrap_or_default()
    };

    let hostname = format!("{}.{}", subdomain, state.config.base_domain);
    let tunnel = match state.tunnels.resolve_hostname(&hostname).await {
        Ok(tunnel) => tunnel,
        Err(_) => return error_response(StatusCode::NOT_FOUND, "Tunnel not found"),
    };
    if !tunnel.is_active() {
        return error_response(StatusCode::SERVICE_UNAVAILABLE, "Tunnel is not active");
    }

    let request_id = generate_request_id();
    let request_key = edgetun_objects::request_body_key(&request_id);
    let response_key = edgetun_objects::response_body_key(&request_id);

    let upload_url = state
        .signer
        .presign_put(&request_key, state.config.presign_ttl);
    let response_put_url = state
        .signer
        .presign_put(&response_key, state.config.presign_ttl);

    let method = meta
        .method
        .filter(|m| !m.is_empty())
        .unwrap_or_else(|| "POST".to_string());
    let mut headers = meta.headers.unwrap_or_default();
    if let Some(content_type) = meta.content_type {
        headers
            .entry("Content-Type".to_string())
            .or_insert(content_type);
    }

    let mut record = PendingRequest::new(
        &request_id,
        &tunnel.tunnel_id,
        &method,
        &path,
        headers,
        "",
        RequestStatus::WaitingUpload,
        state.config.upload_ttl,
    );
    record.s3_request_key = Some(request_key);
    record.s3_response_key = Some(response_key);
    record.s3_response_put_url = Some(response_put_url);

    if let Err(e) = state.store.put(record).await {
        error!(request_id = %request_id, error = %e, "Failed to store pending request");
        return error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            "Failed to store pending request",
        );
    }

    info!(
        request_id = %request_id,
        tunnel_id = %tunnel.tunnel_id,
        "Issued upload URL"
    );
    json_response(
        StatusCode::OK,
        serde_json::json!({
            "request_id": request_id,
            "upload_url": upload_url,
            "poll_url": format!("/poll/{}", request_id),
        }),
    )
}

// ---------------------------------------------------------------------
// Response plumbing

fn path_with_query(path: &str, query: Option<String>) -> String {
    match query {
        Some(query) if !query.is_empty() => format!("{}?{}", path, query),
        _ => path.to_string(),
    }
}

pub(crate) fn subdomain_from_host(host: &str, base_domain: &str) -> Option<String> {
    let host = host.split(':').next().unwrap_or("");
    let subdomain = host.strip_suffix(&format!(".{}", base_domain))?;
    if subdomain.is_empty() || subdomain.contains('.') {
        return None;
    }
    Some(subdomain.to_string())
}

fn flatten_headers(headers: &HeaderMap) -> Headers {
    let mut flat = Headers::new();
    for (name, value) in headers {
        if let Ok(value) = value.to_str() {
            flat.entry(name.to_string())
                .or_insert_with(|| value.to_string());
        }
    }
    flat
}

fn apply_headers(mut builder: Builder, headers: &Headers) -> Builder {
    for (name, value) in headers {
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            builder = builder.header(name, value);
        }
    }
    builder
}

fn data_response(status: u16, headers: &Headers, body: Body) -> Response {
    let status = StatusCode::from_u16(status).unwrap_or(StatusCode::OK);
    let builder = apply_headers(Response::builder().status(status), headers);
    builder
        .body(body)
        .unwrap_or_else(|_| error_response(StatusCode::INTERNAL_SERVER_ERROR, "Invalid response"))
}

pub(crate) fn json_response(status: StatusCode, value: serde_json::Value) -> Response {
    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(value.to_string()))
        .expect("static response headers are valid")
}

pub(crate) fn error_response(status: StatusCode, message: &str) -> Response {
    json_response(status, serde_json::json!({ "error": message }))
}
