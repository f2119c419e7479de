//! kvmesh node
//!
//! Runs one cluster member: the HTTP transport server, the routing table
//! broadcaster and the balancer.

use anyhow::{Context, Result};
use clap::Parser;
use kvmesh_cluster::Transport;
use kvmesh_common::Config;
use kvmesh_node::{HttpTransport, Node, server};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "kvmesh-node")]
#[command(about = "kvmesh cluster member")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "/etc/kvmesh/node.toml")]
    config: String,

    /// Listen address
    #[arg(short, long)]
    listen: Option<String>,

    /// Address other members reach this node at (host:port)
    #[arg(long)]
    advertise_addr: Option<String>,

    /// Seed members (host:port), repeatable
    #[arg(long = "peer")]
    peers: Vec<String>,

    /// Number of partitions
    #[arg(long)]
    partition_count: Option<u64>,

    /// Copies of every partition, primary included
    #[arg(long)]
    replica_count: Option<usize>,

    /// Log level
    #[arg(long, env = "KVMESH_LOG_LEVEL")]
    log_level: Option<String>,

    /// Emit JSON logs
    #[arg(long, default_value_t = false)]
    log_json: bool,
}

/// Layer the configuration file, `KVMESH__*` environment variables and the
/// command line, in increasing precedence
fn load_config(args: &Args) -> Result<Config> {
    let mut config: Config = config::Config::builder()
        .add_source(config::File::with_name(&args.config).required(false))
        .add_source(
            config::Environment::with_prefix("KVMESH")
                .separator("__")
                .list_separator(",")
                .with_list_parse_key("cluster.peers")
                .try_parsing(true),
        )
        .build()
        .with_context(|| format!("failed to load configuration from {}", args.config))?
        .try_deserialize()
        .context("invalid configuration")?;

    if let Some(listen) = &args.listen {
        config.node.bind_addr.clone_from(listen);
    }
    if let Some(addr) = &args.advertise_addr {
        config.node.advertise_addr = Some(addr.clone());
    }
    if !args.peers.is_empty() {
        config.cluster.peers.clone_from(&args.peers);
    }
    if let Some(count) = args.partition_count {
        config.cluster.partition_count = count;
    }
    if let Some(count) = args.replica_count {
        config.cluster.replica_count = count;
    }
    if let Some(level) = &args.log_level {
        config.logging.level.clone_from(level);
    }
    config.validate()?;
    Ok(config)
}

fn init_tracing(level: &str, json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| level.to_string().into());
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = load_config(&args)?;
    init_tracing(&config.logging.level, args.log_json);

    info!("Starting kvmesh node {}", config.advertise_name());
    info!("Config file: {}", args.config);
    info!(
        "Partitions: {}, replicas: {}, quorum: {}, peers: {:?}",
        config.cluster.partition_count,
        config.cluster.replica_count,
        config.cluster.member_count_quorum,
        config.cluster.peers
    );

    let listener = TcpListener::bind(&config.node.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.node.bind_addr))?;

    let transport: Arc<dyn Transport> = Arc::new(HttpTransport::new(&config.transport)?);
    let node = Arc::new(Node::new(config, transport)?);
    let server = tokio::spawn(server::serve(Arc::clone(&node), listener));

    node.start().await;

    let signal_node = Arc::clone(&node);
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("Shutting down...");
        if let Err(e) = signal_node.shutdown().await {
            error!("Shutdown finished with error: {}", e);
        }
    });

    server.await??;
    info!("Node shut down gracefully");
    Ok(())
}
