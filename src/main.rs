//! SSO broker node.
//!
//! Starts the ticket and artifact stores, their cleaners and the logout
//! coordinator from a JSON configuration file, then runs until interrupted.

use anyhow::{anyhow, bail, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

use sso_broker::cluster::{GroupTransport, LocalGroup, TcpGroup};
use sso_broker::config::StoreBackend;
use sso_broker::{Broker, BrokerConfig};

/// Command line arguments
#[derive(Parser, Debug)]
#[command(name = "sso-broker")]
#[command(about = "Federated SSO broker node")]
struct Args {
    /// Path to the JSON configuration file
    #[arg(long, env = "SSO_BROKER_CONFIG")]
    config: Option<PathBuf>,

    /// Override the TGT store backend (memory, persistent, replicated)
    #[arg(long, env = "SSO_TGT_BACKEND")]
    tgt_backend: Option<String>,

    /// Override the TGT lifetime in seconds
    #[arg(long, env = "SSO_TGT_TTL")]
    tgt_ttl: Option<u64>,

    /// Override the artifact lifetime in seconds
    #[arg(long, env = "SSO_ARTIFACT_TTL")]
    artifact_ttl: Option<u64>,

    /// Enable verbose logging
    #[arg(short, long, env = "SSO_VERBOSE")]
    verbose: bool,
}

fn parse_backend(value: &str) -> Result<StoreBackend> {
    match value.to_lowercase().as_str() {
        "memory" => Ok(StoreBackend::Memory),
        "persistent" | "relational" => Ok(StoreBackend::Persistent),
        "replicated" => Ok(StoreBackend::Replicated),
        _ => Err(anyhow!("Unsupported store backend: {}", value)),
    }
}

fn load_config(args: &Args) -> Result<BrokerConfig> {
    let mut config = match &args.config {
        Some(path) => BrokerConfig::from_file(path)?,
        None => BrokerConfig::default(),
    };

    if let Some(ref backend) = args.tgt_backend {
        config.tgt.backend = parse_backend(backend)?;
    }
    if let Some(ttl) = args.tgt_ttl {
        config.tgt.ttl_secs = ttl;
    }
    if let Some(ttl) = args.artifact_ttl {
        config.artifact.ttl_secs = ttl;
    }

    Ok(config)
}

/// Cluster transport for this process.
///
/// Replicated stores need other processes to replicate to, so they require a
/// `network` section.
async fn transport(config: &BrokerConfig) -> Result<Arc<dyn GroupTransport>> {
    match config.network {
        Some(ref network) => Ok(Arc::new(TcpGroup::start(network.clone()).await?)),
        None if config.uses_replication() => {
            bail!("The replicated store backend needs a `network` section listing the cluster peers")
        }
        None => Ok(Arc::new(LocalGroup::new())),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(format!("{}={}", env!("CARGO_CRATE_NAME"), log_level))
        .json()
        .init();

    info!("Starting SSO broker");

    let config = load_config(&args)?;
    info!(
        config_file = ?args.config,
        tgt_ttl_secs = config.tgt.ttl_secs,
        artifact_ttl_secs = config.artifact.ttl_secs,
        clusters = config.clusters.len(),
        "Configuration loaded"
    );

    let transport = transport(&config).await?;
    let broker = Broker::start(config, transport).await?;

    tokio::signal::ctrl_c().await?;
    info!("Shutdown requested");

    broker.shutdown().await;
    Ok(())
}
