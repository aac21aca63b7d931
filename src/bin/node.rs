use anyhow::{Context, Result};
use chat_relay_cluster::config::{parse_peers, NodeConfig, Timing};
use chat_relay_cluster::{RelayNode, UdpTransport};
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// ─────────────────────────────────────────────────────────────────────────────
/// CLI
/// ─────────────────────────────────────────────────────────────────────────────
#[derive(Parser, Debug)]
#[command(author, version, about = "Chat relay cluster node", long_about = None)]
struct Args {
    /// Node id (unique per node; the largest live id becomes leader)
    #[arg(long)]
    id: u32,

    /// UDP address for node and client traffic (e.g. "127.0.0.1:5001")
    #[arg(long)]
    addr: SocketAddr,

    /// Peers list: comma-separated id=addr (e.g. "2=127.0.0.1:5002,3=127.0.0.1:5003")
    #[arg(long, default_value = "")]
    peers: String,

    /// Optional TOML file with timing overrides in milliseconds
    #[arg(long)]
    config: Option<PathBuf>,
}

/// ─────────────────────────────────────────────────────────────────────────────
/// main
/// ─────────────────────────────────────────────────────────────────────────────
#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();

    let peers = parse_peers(&args.peers, args.id)?;
    let timing = match &args.config {
        Some(path) => Timing::from_file(path).with_context(|| format!("loading {}", path.display()))?,
        None => Timing::default(),
    };
    let config = NodeConfig::new(args.id, args.addr, peers).with_timing(timing);

    let (transport, inbound) = UdpTransport::bind(config.addr)
        .await
        .with_context(|| format!("binding {}", config.addr))?;
    info!("Node {} listening on {} with {} peer(s)", config.id, config.addr, config.peers.len());

    let node = RelayNode::new(config, transport);
    let handles = node.start(inbound);

    // the dispatcher only ends if the socket reader dies
    if let Some(dispatch) = handles.into_iter().next() {
        dispatch.await?;
    }
    Ok(())
}
