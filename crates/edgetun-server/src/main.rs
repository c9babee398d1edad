//! edgetun server binary
//!
//! Hosts the public HTTP surface and the agent control channel in one
//! process, backed by the in-memory store, registries, and object store.

use anyhow::{Context, Result};
use clap::Parser;
use edgetun_channel::{ChannelServer, ConnectionMap};
use edgetun_objects::{MemoryObjectStore, UrlSigner};
use edgetun_registry::{MemoryClientRegistry, MemoryTunnelRegistry};
use edgetun_server::{build_router, AppState, Dispatcher, EdgeConfig};
use edgetun_store::{memory::start_sweeper, MemoryPendingStore};
use rand::RngCore;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Public edge and control-channel server for edgetun tunnels.
#[derive(Parser, Debug)]
#[command(name = "edgetun-server", about = "edgetun edge server", version)]
struct Args {
    /// Public HTTP bind address
    #[arg(long, env = "EDGETUN_HTTP_BIND", default_value = "0.0.0.0:8080")]
    http_bind: SocketAddr,

    /// Control channel bind address
    #[arg(long, env = "EDGETUN_CHANNEL_BIND", default_value = "0.0.0.0:9090")]
    channel_bind: SocketAddr,

    /// Base public domain tunnels are served under
    #[arg(long, env = "EDGETUN_DOMAIN", default_value = "tunnel.localhost")]
    domain: String,

    /// Externally reachable base URL of this server (presigned URLs are
    /// minted against it)
    #[arg(long, env = "EDGETUN_PUBLIC_URL", default_value = "http://localhost:8080")]
    public_url: String,

    /// Secret for signing object URLs; generated per process if absent
    #[arg(long, env = "EDGETUN_SIGNING_SECRET")]
    signing_secret: Option<String>,

    /// Reconnect grace window in seconds
    #[arg(long, env = "EDGETUN_GRACE_SECS", default_value_t = 30)]
    grace_secs: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "RUST_LOG", default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(&args.log_level))
        .with_target(true)
        .init();

    info!("Starting edgetun server");
    info!("  HTTP: {}", args.http_bind);
    info!("  Channel: {}", args.channel_bind);
    info!("  Domain: {}", args.domain);

    let signing_secret = match args.signing_secret {
        Some(secret) => secret.into_bytes(),
        None => {
            warn!("No signing secret configured; presigned URLs will not survive a restart");
            let mut secret = vec![0u8; 32];
            rand::thread_rng().fill_bytes(&mut secret);
            secret
        }
    };

    let mut config = EdgeConfig::default().with_base_domain(args.domain);
    config.grace_window = Duration::from_secs(args.grace_secs);

    let store = Arc::new(MemoryPendingStore::new());
    let tunnels = Arc::new(MemoryTunnelRegistry::new());
    let clients = Arc::new(MemoryClientRegistry::new());
    let objects = Arc::new(MemoryObjectStore::new());
    let connections = Arc::new(ConnectionMap::new());
    let signer = UrlSigner::new(signing_secret, args.public_url);

    let dispatcher = Arc::new(Dispatcher::new(
        store.clone(),
        tunnels.clone(),
        signer.clone(),
        connections.clone(),
        config.presign_ttl,
    ));

    let state = Arc::new(AppState {
        store: store.clone(),
        tunnels: tunnels.clone(),
        clients: clients.clone(),
        objects: objects.clone(),
        signer,
        connections: connections.clone(),
        dispatcher: dispatcher.clone(),
        config,
    });

    // Background expiry of pending records and staged objects
    let _store_sweeper = start_sweeper(store.clone(), Duration::from_secs(30));
    let object_sweeper = {
        let objects = objects.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(300));
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                objects.sweep(chrono::Duration::days(1));
            }
        })
    };

    let channel = ChannelServer::bind(
        args.channel_bind,
        clients,
        tunnels,
        connections,
        dispatcher,
    )
    .await
    .context("Failed to bind control channel")?;
    let channel_task = tokio::spawn(channel.run());

    let listener = tokio::net::TcpListener::bind(args.http_bind)
        .await
        .context("Failed to bind HTTP listener")?;
    let router = build_router(state);

    tokio::select! {
        result = axum::serve(listener, router) => {
            result.context("HTTP server error")?;
        }
        result = channel_task => {
            match result {
                Ok(Err(e)) => return Err(e).context("Control channel error"),
                Ok(Ok(())) => {}
                Err(e) => return Err(e).context("Control channel task failed"),
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down");
        }
    }

    object_sweeper.abort();
    info!("Server stopped");
    Ok(())
}
