use anyhow::{Context, Result};
use clap::Parser;
use mvirt_overlay::config::Config;
use mvirt_overlay::node::Node;
use mvirt_overlay::transport::quic::QuicTransport;
use mvirt_overlay::tun::LinuxTunDriver;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal::unix::{Signal, SignalKind, signal};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Overlay data plane: forwards IPv4 between local TUN interfaces and QUIC peers
#[derive(Parser, Debug)]
#[command(name = "mvirt-overlay", version, about)]
struct Args {
    /// Path to the YAML configuration file
    #[arg(short, long, default_value = "config.yaml")]
    config: PathBuf,

    /// Listen address for inbound peer sessions (overrides the config file)
    #[arg(long)]
    listen: Option<SocketAddr>,

    /// Generate interfaces <prefix>1..<prefix>N instead of the configured ones (e.g. "10.0.0.")
    #[arg(long)]
    prefix: Option<String>,

    /// Number of interfaces generated from --prefix
    #[arg(long, default_value = "2")]
    count: usize,

    /// Log filter when RUST_LOG is unset (e.g. "debug", "mvirt_overlay=trace")
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level)),
        )
        .init();

    if let Err(e) = run(args).await {
        error!("mvirt-overlay failed: {e:#}");
        std::process::exit(1);
    }
}

async fn run(args: Args) -> Result<()> {
    info!(config = %args.config.display(), "Starting mvirt-overlay");

    let mut config = Config::load(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;
    if let Some(listen) = args.listen {
        config.listen = listen;
    }
    if let Some(prefix) = &args.prefix {
        config
            .generate_interfaces(prefix, args.count)
            .context("generating interfaces from --prefix")?;
    }

    let sigint = signal(SignalKind::interrupt()).context("installing SIGINT handler")?;
    let sigterm = signal(SignalKind::terminate()).context("installing SIGTERM handler")?;

    let transport =
        QuicTransport::new(&config.quic_config()).context("initializing QUIC transport")?;

    let mut node = Node::start(config, Arc::new(LinuxTunDriver), Arc::new(transport))
        .await
        .context("starting node")?;

    let reason = node.run_until(interrupted(sigint, sigterm)).await?;
    info!(?reason, "mvirt-overlay stopped");
    Ok(())
}

async fn interrupted(mut sigint: Signal, mut sigterm: Signal) {
    tokio::select! {
        _ = sigint.recv() => info!("Received SIGINT"),
        _ = sigterm.recv() => info!("Received SIGTERM"),
    }
}
