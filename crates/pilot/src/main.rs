//! Pilot sharding control plane service entry point

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use pilot::{api::HttpApi, Config, Pilot};

/// Pilot - Sharding control plane
#[derive(Parser, Debug)]
#[command(name = "pilot")]
#[command(about = "Chunk sharding control plane")]
struct Args {
    /// Configuration file (YAML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Cluster name
    #[arg(long)]
    cluster: Option<String>,

    /// Data directory
    #[arg(short, long)]
    data_dir: Option<PathBuf>,

    /// HTTP API listen address
    #[arg(long)]
    http_addr: Option<String>,

    /// Log level
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => Config::from_file(path)?,
        None => Config::default(),
    };
    if let Some(cluster) = args.cluster {
        config.cluster.name = cluster;
    }
    if let Some(data_dir) = args.data_dir {
        config.cluster.data_dir = data_dir;
    }
    if let Some(http_addr) = args.http_addr {
        config.http.addr = http_addr;
    }
    if let Some(log_level) = args.log_level {
        config.log.level = log_level;
    }

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

    info!("Starting Pilot control plane...");
    info!("  Cluster: {}", config.cluster.name);
    info!("  Data dir: {}", config.cluster.data_dir.display());
    info!("  Config replicas: {}", config.cluster.replicas.len());
    info!("  HTTP API: {}", config.http.addr);

    let http_addr = config.http.addr.clone();
    let pilot = Arc::new(Pilot::open(config).await?);

    let added = pilot.bootstrap_shards().await?;
    if added > 0 {
        info!("Bootstrapped {} shards", added);
    }

    // Start background tasks
    let _tasks = pilot.start_background_tasks();

    let stats = pilot.stats().await;
    info!(
        "Cluster ready: {} shards ({} up), {} sharded collections, {} chunks, config version {}",
        stats.total_shards,
        stats.up_shards,
        stats.sharded_collections,
        stats.total_chunks,
        stats.config_version
    );

    // Start HTTP API
    let app = HttpApi::new(pilot.clone()).router();

    let listener = tokio::net::TcpListener::bind(&http_addr).await?;
    info!("HTTP API listening on {}", http_addr);

    axum::serve(listener, app).await?;

    Ok(())
}
