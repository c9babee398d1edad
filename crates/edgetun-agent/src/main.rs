//! edgetun agent binary
//!
//! ```bash
//! edgetun-agent --tunnel-id t_abc --key tk_... --port 3000 \
//!   --channel-url wss://edge.example/channel
//! ```

use anyhow::{Context, Result};
use clap::Parser;
use edgetun_agent::{Agent, AgentConfig};
use tracing::{error, info};

/// Forwards tunneled public requests to a local HTTP server.
#[derive(Parser, Debug)]
#[command(
    name = "edgetun-agent",
    about = "edgetun agent: serve a tunnel from a private network",
    version
)]
struct Args {
    /// Tunnel id this agent serves
    #[arg(long, env = "EDGETUN_TUNNEL_ID")]
    tunnel_id: String,

    /// Control channel endpoint (ws:// or wss://)
    #[arg(
        long,
        env = "EDGETUN_CHANNEL_URL",
        default_value = "ws://localhost:9090/channel"
    )]
    channel_url: String,

    /// API key issued at client registration
    #[arg(long = "key", env = "EDGETUN_API_KEY")]
    api_key: String,

    /// Port of the local HTTP server to forward to
    #[arg(long = "port", env = "EDGETUN_LOCAL_PORT", default_value_t = 3000)]
    local_port: u16,

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

    info!("Starting edgetun agent");
    info!("  Tunnel: {}", args.tunnel_id);
    info!("  Channel: {}", args.channel_url);
    info!("  Local port: {}", args.local_port);
    info!(
        "  Key: {}...",
        &args.api_key[..args.api_key.len().min(10)]
    );

    let config = AgentConfig::new(
        args.tunnel_id,
        args.channel_url,
        args.api_key,
        args.local_port,
    );
    let agent = Agent::new(config).context("Failed to create agent")?;

    tokio::select! {
        result = agent.run() => {
            if let Err(e) = result {
                error!("Agent error: {}", e);
                return Err(e.into());
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down");
            agent.shutdown();
        }
    }

    info!("Agent stopped");
    Ok(())
}
