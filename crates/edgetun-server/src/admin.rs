//! Lifecycle CRUD: client registration and tunnel create/list/delete
//!
//! Everything here is plumbing around the registries; the correlation
//! engine never reads these routes.

use crate::edge::{error_response, json_response};
use crate::AppState;
use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::Response;
use edgetun_registry::{validate_subdomain, Tunnel};
use rand::RngCore;
use serde::Deserialize;
use std::sync::Arc;
use tracing::info;

fn random_hex(bytes: usize) -> String {
    let mut buf = vec![0u8; bytes];
    rand::thread_rng().fill_bytes(&mut buf);
    buf.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Resolve the bearer API key in `headers` to a client id.
async fn authorize(state: &AppState, headers: &HeaderMap) -> Result<String, Response> {
    let bearer = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split_once(' '))
        .filter(|(scheme, _)| scheme.eq_ignore_ascii_case("bearer"))
        .map(|(_, token)| token.trim().to_string())
        .ok_or_else(|| error_response(StatusCode::UNAUTHORIZED, "Invalid authorization header"))?;

    state
        .clients
        .verify_key(&bearer)
        .await
        .map_err(|_| error_response(StatusCode::UNAUTHORIZED, "Invalid API key"))
}

/// `POST /api/register` — issue a client id and API key. The key is
/// returned exactly once; only its digest is stored.
pub async fn register_client(State(state): State<Arc<AppState>>) -> Response {
    match state.clients.register().await {
        Ok(issued) => json_response(
            StatusCode::CREATED,
            serde_json::json!({
                "client_id": issued.client_id,
                "api_key": issued.api_key,
            }),
        ),
        Err(e) => error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            &format!("Failed to register client: {}", e),
        ),
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct CreateTunnelRequest {
    #[serde(default)]
    pub subdomain: Option<String>,
}

/// `POST /api/tunnels` — create a tunnel, with an optional custom
/// subdomain (409 when taken, random otherwise).
pub async fn create_tunnel(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let client_id = match authorize(&state, &headers).await {
        Ok(client_id) => client_id,
        Err(response) => return response,
    };
    let request: CreateTunnelRequest = if body.is_empty() {
        CreateTunnelRequest::default()
    } else {
        match serde_json::from_slice(&body) {
            Ok(request) => request,
            Err(_) => return error_response(StatusCode::BAD_REQUEST, "Invalid request body"),
        }
    };

    let tunnel_id = format!("t_{}", random_hex(16));
    let tunnel = match request.subdomain.filter(|s| !s.is_empty()) {
        Some(subdomain) => {
            let subdomain = subdomain.to_lowercase();
            if !validate_subdomain(&subdomain) {
                return error_response(StatusCode::BAD_REQUEST, "Invalid subdomain format");
            }
            let tunnel = Tunnel::new(&tunnel_id, &client_id, subdomain, &state.config.base_domain);
            match state.tunnels.create(tunnel.clone()).await {
                Ok(()) => tunnel,
                Err(_) => {
                    return error_response(StatusCode::CONFLICT, "Subdomain is already taken")
                }
            }
        }
        None => {
            // Random subdomains can collide; retry a few times
            let mut created = None;
            for _ in 0..5 {
                let tunnel = Tunnel::new(
                    &tunnel_id,
                    &client_id,
                    random_hex(4),
                    &state.config.base_domain,
                );
                if state.tunnels.create(tunnel.clone()).await.is_ok() {
                    created = Some(tunnel);
                    break;
                }
            }
            match created {
                Some(tunnel) => tunnel,
                None => {
                    return error_response(
                        StatusCode::INTERNAL_SERVER_ERROR,
                        "Failed to allocate a subdomain",
                    )
                }
            }
        }
    };

    info!(
        tunnel_id = %tunnel.tunnel_id,
        client_id = %client_id,
        hostname = %tunnel.hostname,
        "Created tunnel"
    );
    json_response(
        StatusCode::CREATED,
        serde_json::json!({
            "tunnel_id": tunnel.tunnel_id,
            "subdomain": tunnel.subdomain,
            "hostname": tunnel.hostname,
            "status": "inactive",
        }),
    )
}

/// `GET /api/tunnels` — list the caller's tunnels.
pub async fn list_tunnels(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    let client_id = match authorize(&state, &headers).await {
        Ok(client_id) => client_id,
        Err(response) => return response,
    };

    match state.tunnels.list(&client_id).await {
        Ok(tunnels) => {
            let total = tunnels.len();
            json_response(
                StatusCode::OK,
                serde_json::json!({ "tunnels": tunnels, "total": total }),
            )
        }
        Err(e) => error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            &format!("Failed to list tunnels: {}", e),
        ),
    }
}

/// `DELETE /api/tunnels/{tunnel_id}` — drop a tunnel the caller owns.
pub async fn delete_tunnel(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(tunnel_id): Path<String>,
) -> Response {
    let client_id = match authorize(&state, &headers).await {
        Ok(client_id) => client_id,
        Err(response) => return response,
    };

    let tunnel = match state.tunnels.get(&tunnel_id).await {
        Ok(tunnel) => tunnel,
        Err(_) => return error_response(StatusCode::NOT_FOUND, "Tunnel not found"),
    };
    if tunnel.client_id != client_id {
        return error_response(StatusCode::FORBIDDEN, "Not authorized for this tunnel");
    }

    match state.tunnels.delete(&tunnel_id).await {
        Ok(()) => json_response(
            StatusCode::OK,
            serde_json::json!({ "message": "Tunnel deleted" }),
        ),
        Err(e) => error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            &format!("Failed to delete tunnel: {}", e),
        ),
    }
}
