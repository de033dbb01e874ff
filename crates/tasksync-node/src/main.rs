//! TaskSync node: real-time sync server.

use anyhow::Context;
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use tasksync_node::config::NodeConfig;
use tasksync_node::observability::{init_logging, LogFormat};
use tasksync_node::SyncNode;

/// TaskSync real-time sync node
#[derive(Parser, Debug)]
#[command(name = "tasksync-node")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to a YAML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Listen address, overrides `server.listen_addr`
    #[arg(long)]
    listen_addr: Option<SocketAddr>,

    /// Node id, overrides `server.node_id`
    #[arg(long)]
    node_id: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    log_level: Option<String>,

    /// Log format (pretty, json)
    #[arg(long)]
    log_format: Option<String>,

    /// Print the effective configuration as YAML and exit
    #[arg(long)]
    print_config: bool,
}

impl Args {
    fn apply(&self, config: &mut NodeConfig) {
        if let Some(addr) = self.listen_addr {
            config.server.listen_addr = addr;
        }
        if let Some(node_id) = &self.node_id {
            config.server.node_id = Some(node_id.clone());
        }
        if let Some(level) = &self.log_level {
            config.logging.level = level.clone();
        }
        if let Some(format) = &self.log_format {
            config.logging.format = LogFormat::parse(format);
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config =
        NodeConfig::load(args.config.as_deref()).context("failed to load configuration")?;
    args.apply(&mut config);

    if args.print_config {
        print!("{}", serde_yaml::to_string(&config)?);
        return Ok(());
    }

    config.check()?;
    init_logging(&config.logging.level, config.logging.format);

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "Starting TaskSync node");

    let node = SyncNode::start(&config).await?;
    let listener = tokio::net::TcpListener::bind(config.server.listen_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.server.listen_addr))?;

    node.serve(listener, shutdown_signal()).await?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}
