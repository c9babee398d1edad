//! edgetun edge server
//!
//! Hosts the four public surfaces of the tunnel system: the synchronous
//! proxy entry (`/t/{subdomain}/…` and host-header routing), the
//! deferred-body upload endpoints, the signed object routes standing in
//! for the blob store, and the lifecycle CRUD that populates the
//! registries. The control-channel listener and the dispatcher consuming
//! agent frames are wired in by the binary.

pub mod admin;
pub mod config;
pub mod dispatch;
pub mod edge;
pub mod objects;

pub use config::EdgeConfig;
pub use dispatch::Dispatcher;

use axum::extract::DefaultBodyLimit;
use axum::routing::{any, get, post, put};
use axum::Router;
use edgetun_channel::{ChannelError, ConnectionMap};
use edgetun_objects::{ObjectStore, ObjectStoreError, UrlSigner};
use edgetun_registry::{ClientRegistry, RegistryError, TunnelRegistry};
use edgetun_store::{PendingStore, StoreError};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

/// Buffered inline request bodies are capped here; anything larger goes
/// through the upload-URL path.
const MAX_INLINE_BODY: usize = 8 * 1024 * 1024;

/// Server-side errors, wrapped per collaborating component.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Objects(#[from] ObjectStoreError),

    #[error(transparent)]
    Channel(#[from] ChannelError),

    #[error("tunnel {0} has no live connection")]
    TunnelOffline(String),
}

/// Shared state behind every handler.
pub struct AppState {
    pub store: Arc<dyn PendingStore>,
    pub tunnels: Arc<dyn TunnelRegistry>,
    pub clients: Arc<dyn ClientRegistry>,
    pub objects: Arc<dyn ObjectStore>,
    pub signer: UrlSigner,
    pub connections: Arc<ConnectionMap>,
    pub dispatcher: Arc<Dispatcher>,
    pub config: EdgeConfig,
}

/// Build the public router.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        // Synchronous tunneled requests
        .route("/t/{subdomain}", any(edge::tunnel_root))
        .route("/t/{subdomain}/{*proxy}", any(edge::tunnel_path))
        // Deferred-body requests
        .route("/upload-url/{subdomain}", post(edge::upload_url_root))
        .route("/upload-url/{subdomain}/{*proxy}", post(edge::upload_url_path))
        .route("/poll/{request_id}", get(edge::poll))
        // Signed object routes (presigned-URL targets)
        .route(
            "/objects/{*key}",
            put(objects::put_object).get(objects::get_object),
        )
        // Lifecycle CRUD
        .route("/api/register", post(admin::register_client))
        .route(
            "/api/tunnels",
            get(admin::list_tunnels).post(admin::create_tunnel),
        )
        .route(
            "/api/tunnels/{tunnel_id}",
            axum::routing::delete(admin::delete_tunnel),
        )
        // Host-header routed tunnels ({subdomain}.base_domain/...)
        .fallback(edge::host_routed)
        .layer(DefaultBodyLimit::max(MAX_INLINE_BODY))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
