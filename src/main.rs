//! MeshMQ - cluster RPC node
//!
//! Usage:
//!   meshmq [OPTIONS]
//!
//! Options:
//!   -c, --config <FILE>       Configuration file path
//!   -b, --rpc-bind <ADDR>     Cluster RPC bind address (default: 0.0.0.0:8933)
//!   -n, --node-id <ID>        Node identifier (default: hostname)
//!   -p, --peer <ID=ADDR>      Peer node, may be repeated
//!   -l, --log-level           Log level (error, warn, info, debug, trace)
//!   -h, --help                Print help

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use meshmq::cluster::{ClusterManager, ClusterNode, ClusterService};
use meshmq::config::Config;
use meshmq::local::{LocalDelivery, MemoryClients, MemorySubscriptions, SubscriptionIndex};

/// Log level for CLI
#[derive(Debug, Clone, Copy, ValueEnum, Default)]
enum LogLevel {
    /// Only errors
    Error,
    /// Warnings and errors
    Warn,
    /// Informational messages
    #[default]
    Info,
    /// Debug messages
    Debug,
    /// Trace messages (very verbose)
    Trace,
}

impl LogLevel {
    fn to_tracing_level(self) -> Level {
        match self {
            LogLevel::Error => Level::ERROR,
            LogLevel::Warn => Level::WARN,
            LogLevel::Info => Level::INFO,
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Trace => Level::TRACE,
        }
    }
}

/// Parse `ID=ADDR` into a cluster node
fn parse_peer(s: &str) -> Result<ClusterNode, String> {
    match s.split_once('=') {
        Some((id, addr)) if !id.is_empty() && !addr.is_empty() => Ok(ClusterNode::new(id, addr)),
        _ => Err(format!("expected ID=ADDR, got '{}'", s)),
    }
}

/// MeshMQ - inter-node RPC mesh for a clustered MQTT broker
#[derive(Parser, Debug)]
#[command(name = "meshmq")]
#[command(version)]
#[command(about = "Inter-node RPC mesh for a clustered MQTT broker")]
struct Args {
    /// Configuration file path (TOML format)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Cluster RPC bind address
    #[arg(short = 'b', long)]
    rpc_bind: Option<SocketAddr>,

    /// Node identifier
    #[arg(short, long)]
    node_id: Option<String>,

    /// Peer node as ID=ADDR (repeatable)
    #[arg(short, long = "peer", value_parser = parse_peer)]
    peers: Vec<ClusterNode>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(short, long, value_enum)]
    log_level: Option<LogLevel>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Load configuration file if specified, otherwise env + defaults
    let loaded = match &args.config {
        Some(path) => Config::load(path),
        None => Config::from_env(),
    };
    let mut config = match loaded {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Error loading config: {}", e);
            std::process::exit(1);
        }
    };

    // Setup logging - CLI overrides config
    let log_level = args.log_level.unwrap_or_else(|| {
        match config.log.level.to_lowercase().as_str() {
            "error" => LogLevel::Error,
            "warn" => LogLevel::Warn,
            "debug" => LogLevel::Debug,
            "trace" => LogLevel::Trace,
            _ => LogLevel::Info,
        }
    });

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level.to_tracing_level())
        .with_target(false)
        .with_thread_ids(true)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    if let Some(path) = &args.config {
        info!("Loaded configuration from {:?}", path);
    }

    // CLI args override file config; any cluster flag enables clustering
    let cli_cluster = args.rpc_bind.is_some() || args.node_id.is_some() || !args.peers.is_empty();
    let cluster = &mut config.cluster;
    if let Some(bind) = args.rpc_bind {
        cluster.rpc_bind = bind;
    }
    if let Some(node_id) = args.node_id {
        cluster.node_id = Some(node_id);
    }
    cluster.peers.extend(args.peers);
    cluster.enabled |= cli_cluster;

    if let Err(e) = config.validate() {
        eprintln!("Invalid configuration: {}", e);
        std::process::exit(1);
    }

    if !config.cluster.enabled {
        warn!("Clustering is disabled; set [cluster] enabled = true or pass --rpc-bind");
        return Ok(());
    }

    let subscriptions: Arc<dyn SubscriptionIndex> = Arc::new(MemorySubscriptions::new());
    let clients = Arc::new(MemoryClients::new());
    let delivery = Arc::new(LocalDelivery::new(subscriptions.clone()));
    let service = Arc::new(ClusterService::new(subscriptions, clients, delivery));

    let manager = ClusterManager::from_config(&config.cluster);
    info!("MeshMQ node '{}' starting", manager.node_id());
    info!("  RPC bind: {}", config.cluster.rpc_bind);
    info!("  Call timeout: {:?}", config.cluster.call_timeout);
    info!(
        "  Retry: {:?} doubling to {:?}, {} retries",
        config.cluster.retry.initial_delay,
        config.cluster.retry.max_delay,
        config.cluster.retry.max_retries
    );

    manager
        .start(config.cluster.rpc_bind, service, &config.cluster.peers)
        .await?;

    tokio::signal::ctrl_c().await?;
    info!(
        "Shutting down ({} of {} peers connected)",
        manager.connected_peer_count(),
        manager.peer_count()
    );

    Ok(())
}
