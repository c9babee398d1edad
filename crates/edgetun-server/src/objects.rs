//! Signed object routes
//!
//! The HTTP face of the object store: presigned URLs minted by the
//! `UrlSigner` land here. A completed PUT under the requests prefix
//! fires the dispatcher's upload-notify path, the way an object-created
//! event would.

use crate::edge::{error_response, json_response};
use crate::AppState;
use axum::body::{Body, Bytes};
use axum::extract::{Path, RawQuery, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::Response;
use edgetun_objects::{parse_signed_query, StoredObject, REQUESTS_PREFIX};
use std::sync::Arc;
use tracing::{debug, error, warn};

fn verify(state: &AppState, method: &str, key: &str, query: Option<&str>) -> Result<(), Response> {
    let (expires, sig) = parse_signed_query(query.unwrap_or("")).map_err(|e| {
        warn!(key = %key, error = %e, "Malformed signed URL");
        error_response(StatusCode::FORBIDDEN, "Invalid signature")
    })?;
    state.signer.verify(method, key, expires, &sig).map_err(|e| {
        warn!(key = %key, error = %e, "Rejected signed URL");
        error_response(StatusCode::FORBIDDEN, "Invalid signature")
    })
}

/// `PUT /objects/{*key}` — store a staged body.
pub async fn put_object(
    State(state): State<Arc<AppState>>,
    Path(key): Path<String>,
    RawQuery(query): RawQuery,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if let Err(response) = verify(&state, "PUT", &key, query.as_deref()) {
        return response;
    }

    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let size = body.len();
    if let Err(e) = state
        .objects
        .put(&key, StoredObject::new(body, content_type))
        .await
    {
        error!(key = %key, error = %e, "Failed to store object");
        return error_response(StatusCode::INTERNAL_SERVER_ERROR, "Failed to store object");
    }
    debug!(key = %key, size, "Object stored");

    // Upload-notify: a request body landing is the signal to push the
    // pending request to the agent.
    if key.starts_with(REQUESTS_PREFIX) {
        let dispatcher = state.dispatcher.clone();
        let key = key.clone();
        tokio::spawn(async move {
            if let Err(e) = dispatcher.upload_notify(&key).await {
                error!(key = %key, error = %e, "Upload notify failed");
            }
        });
    }

    json_response(StatusCode::OK, serde_json::json!({ "key": key }))
}

/// `GET /objects/{*key}` — fetch a staged body.
pub async fn get_object(
    State(state): State<Arc<AppState>>,
    Path(key): Path<String>,
    RawQuery(query): RawQuery,
) -> Response {
    if let Err(response) = verify(&state, "GET", &key, query.as_deref()) {
        return response;
    }

    let object = match state.objects.get(&key).await {
        Ok(object) => object,
        Err(_) => return error_response(StatusCode::NOT_FOUND, "Object not found"),
    };

    let mut builder = Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_LENGTH, object.content_length());
    if let Some(content_type) = &object.content_type {
        builder = builder.header(header::CONTENT_TYPE, content_type);
    }
    builder
        .body(Body::from(object.data))
        .unwrap_or_else(|_| error_response(StatusCode::INTERNAL_SERVER_ERROR, "Invalid object"))
}
