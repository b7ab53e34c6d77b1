//! Cluster manager service entry point

use std::path::PathBuf;

use clap::Parser;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use manager::{api::HttpApi, config::Config, ClusterManager};

/// Cluster manager - shard allocation and routing
#[derive(Parser, Debug)]
#[command(name = "cluster-manager")]
#[command(about = "Shard allocation and routing cluster manager")]
struct Args {
    /// Configuration file (YAML)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Cluster name
    #[arg(short, long)]
    cluster: Option<String>,

    /// Node ID of this manager
    #[arg(long)]
    node_id: Option<String>,

    /// Data directory
    #[arg(short, long)]
    data_dir: Option<PathBuf>,

    /// HTTP API listen address
    #[arg(long)]
    http_addr: Option<String>,

    /// Heartbeat timeout (seconds)
    #[arg(long)]
    heartbeat_timeout: Option<u64>,

    /// Log level
    #[arg(long)]
    log_level: Option<String>,
}

impl Args {
    fn into_config(self) -> anyhow::Result<Config> {
        let mut config = match &self.config {
            Some(path) => Config::from_file(path)?,
            None => Config::default(),
        };
        if let Some(cluster) = self.cluster {
            config.cluster.name = cluster;
        }
        if let Some(node_id) = self.node_id {
            config.node.node_id = node_id;
        }
        if let Some(data_dir) = self.data_dir {
            config.storage.data_dir = data_dir;
        }
        if let Some(http_addr) = self.http_addr {
            config.http.addr = http_addr;
        }
        if let Some(timeout) = self.heartbeat_timeout {
            config.heartbeat.timeout_secs = timeout;
        }
        if let Some(level) = self.log_level {
            config.log.level = level;
        }
        config.validate()?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Args::parse().into_config()?;

    // Initialize logging
    let level = match config.log.level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    info!("Starting cluster manager...");
    info!("  Cluster: {}", config.cluster.name);
    info!("  Node: {}", config.node.node_id);
    info!("  Data dir: {:?}", config.storage.data_dir);
    info!("  HTTP API: {}", config.http.addr);

    let http_addr = config.http.addr.clone();
    let manager = ClusterManager::start(config).await?;

    // Start background tasks
    let _liveness_handle = manager.start_liveness_checker();

    let health = manager.health();
    info!(
        "Cluster ready: status {}, {} indices, {} unassigned shards",
        health.status,
        health.indices.len(),
        health.counts.unassigned_shards
    );

    // Start HTTP API
    let app = HttpApi::new(manager).router();
    let listener = tokio::net::TcpListener::bind(&http_addr).await?;
    info!("HTTP API listening on {}", http_addr);

    axum::serve(listener, app).await?;

    Ok(())
}
