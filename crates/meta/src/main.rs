//! Meta control plane service entry point

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use meta::{api::HttpApi, MetaConfig, MetaServer};

/// Meta - control plane of a distributed analytical database
#[derive(Parser, Debug)]
#[command(name = "meta-server")]
#[command(about = "Topology and procedure control plane")]
struct Args {
    /// YAML configuration file
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

    /// Leader replica address; omit to lead
    #[arg(long)]
    leader_addr: Option<String>,

    /// Log level
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => MetaConfig::from_file(path)?,
        None => MetaConfig::default(),
    };
    if let Some(cluster) = args.cluster {
        config.cluster.name = cluster;
    }
    if let Some(data_dir) = args.data_dir {
        config.storage.data_dir = data_dir;
    }
    if let Some(http_addr) = args.http_addr {
        config.server.http_addr = http_addr;
    }
    if let Some(leader_addr) = args.leader_addr {
        config.election.leader_addr = Some(leader_addr);
    }
    if let Some(log_level) = args.log_level {
        config.log.level = log_level;
    }
    config.validate()?;

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

    info!("Starting meta control plane...");
    info!("  Cluster: {}", config.cluster.name);
    info!("  Storage: {:?} at {:?}", config.storage.backend, config.storage.data_dir);
    info!("  HTTP API: {}", config.server.http_addr);
    info!(
        "  Leader: {}",
        config.election.leader_addr.as_deref().unwrap_or("self")
    );

    let http_addr = config.server.http_addr.clone();
    let server = Arc::new(MetaServer::new(config).await?);
    server.start().await?;

    // Start background tasks
    let _handles = server.start_background_tasks();

    // Start HTTP API
    let app = HttpApi::new(server.clone()).router();
    let listener = tokio::net::TcpListener::bind(&http_addr).await?;
    info!("HTTP API listening on {}", http_addr);

    axum::serve(listener, app).await?;

    Ok(())
}
