use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use raidframe::block_store::BlockStore;
use raidframe::catalog::Catalog;
use raidframe::config::Config;
use raidframe::coordinator::{ClusterParams, RaidCoordinator};
use raidframe::health::HealthMonitor;
use raidframe::serve::{run_coordinator_server, run_node_server};
use raidframe::transport::{NodeClient, NodeTransport, TransportPolicy};
use tracing::info;
use tracing_appender::{
    non_blocking,
    rolling::{RollingFileAppender, Rotation},
};
use tracing_subscriber::{fmt, layer::SubscriberExt, EnvFilter, Registry};

/// CLI for running the RAID-5 distributed file store.
#[derive(Parser)]
#[command(name = "raidframe")]
#[command(about = "RAID-5 style distributed file store over a fixed 4-node fleet")]
#[command(arg_required_else_help = true)]
struct Cli {
    /// Path to the cluster configuration file.
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the RAID coordinator: the API clients upload/download/delete
    /// files through, fanning writes and reads out across the node fleet.
    Coordinator,

    /// Start a single storage node, identified by its id in the cluster
    /// config. Run one of these per node in `cluster.nodes`.
    Node {
        /// The node id from `cluster.nodes[].id` this process serves.
        #[arg(long)]
        id: u32,
    },
}

/// Sets up the global `tracing` subscriber: events go to stdout and to a
/// daily-rotating log file under `./logs`, each on its own non-blocking
/// writer thread so logging never backpressures the request path.
pub fn init_logging() {
    let file_appender = RollingFileAppender::new(Rotation::DAILY, "./logs", "raidframe.log");
    let (file_writer, file_guard) = non_blocking(file_appender);
    let (stdout_writer, stdout_guard) = non_blocking(std::io::stdout());

    let subscriber = Registry::default()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,raidframe=debug")),
        )
        .with(
            fmt::layer()
                .with_writer(stdout_writer)
                .with_target(true)
                .with_thread_ids(true),
        )
        .with(fmt::layer().with_writer(file_writer).with_ansi(false));

    tracing::subscriber::set_global_default(subscriber).expect("failed to set tracing subscriber");

    // Leaking the guards keeps their background writer threads alive for the
    // life of the process; dropping them would silently stop the file/stdout
    // sinks the moment `init_logging` returns.
    Box::leak(Box::new(file_guard));
    Box::leak(Box::new(stdout_guard));
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    init_logging();

    let config = Config::load(&cli.config).map_err(|e| {
        format!(
            "failed to load {}: {e}. Make sure the cluster config file exists.",
            cli.config.display()
        )
    })?;

    match cli.command {
        Commands::Coordinator => run_coordinator(config).await,
        Commands::Node { id } => run_node(config, id).await,
    }
}

async fn run_coordinator(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    info!(node_count = config.cluster.nodes.len(), "starting coordinator");

    let endpoints: HashMap<u32, String> = config
        .cluster
        .nodes
        .iter()
        .map(|n| (n.id, n.url.clone()))
        .collect();
    let policy = TransportPolicy {
        request_timeout: Duration::from_secs(config.cluster.request_timeout_secs),
        max_retry_attempts: config.cluster.max_retry_attempts,
        retry_delay: Duration::from_secs(config.cluster.retry_delay_secs),
        compression_enabled: config.cluster.compression_enabled,
        compression_threshold_bytes: config.cluster.compression_threshold_bytes,
        max_connections_per_server: config.cluster.max_connections_per_server,
    };
    let transport: Arc<dyn NodeClient> = Arc::new(NodeTransport::new(endpoints, policy));

    let node_count = config.cluster.nodes.len();
    let stale_after = Duration::from_secs(config.cluster.node_failure_threshold_minutes * 60);
    let health = HealthMonitor::new(
        transport.clone(),
        node_count,
        node_count.saturating_sub(1),
        stale_after,
    );
    // Prime the status cache before accepting traffic so the first write
    // isn't rejected just because no probe has run yet.
    health.check_all().await;

    let catalog = Catalog::open(std::path::Path::new(&config.server.catalog_dir))?;
    let params = ClusterParams {
        node_count: node_count as u32,
        stripe_width: node_count.saturating_sub(1) as u32,
        block_size: config.cluster.block_size,
        max_file_size: config.cluster.max_file_size,
    };
    let coordinator = Arc::new(RaidCoordinator::new(catalog, transport, health.clone(), params)?);

    run_coordinator_server(
        coordinator,
        health,
        Duration::from_secs(config.cluster.health_check_interval_secs),
        config.server.coordinator_port,
    )
    .await
}

async fn run_node(config: Config, node_id: u32) -> Result<(), Box<dyn std::error::Error>> {
    let node_config = config.node(node_id)?;
    info!(node_id, data_dir = %node_config.data_dir, "starting node");

    let store = BlockStore::new(
        std::path::Path::new(&node_config.data_dir),
        node_config.capacity_bytes,
    )?;
    run_node_server(node_id, store, node_config.listen_port).await
}
