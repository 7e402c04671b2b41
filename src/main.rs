//! Reservas - Coordinated Reservation Service
//!
//! Runs one node of the reservation cluster: Bully leader election, the
//! booking lock and the leader-routed booking API.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use reservas::api::{AppState, HttpServer};
use reservas::booking::collaborators::http_client;
use reservas::booking::{BookingPolicy, BookingRouter, Collaborators, ServiceEndpoints};
use reservas::cluster::{ClusterMembership, NodeSpec};
use reservas::config::CoordinatorConfig;
use reservas::election::{ElectionConfig, ElectionEngine, StatusReply};
use reservas::lock::LockManager;
use reservas::transport::HttpTransport;

/// Config file picked up when `--config` is not given
const DEFAULT_CONFIG: &str = "reservas.toml";

/// Reservas - coordinated reservation service
#[derive(Parser)]
#[command(name = "reservas")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file (environment variables only when absent)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the node
    Start,

    /// Show one node's election status
    Status {
        /// Node URL to query
        #[arg(short, long, default_value = "http://localhost:3001")]
        address: String,
    },

    /// Show the election status of every configured node
    Cluster,

    /// Initialize a new configuration file
    Init {
        /// Output path for configuration file
        #[arg(short, long, default_value = DEFAULT_CONFIG)]
        output: PathBuf,

        /// Node ID
        #[arg(long, default_value_t = 1)]
        node_id: u64,
    },

    /// Validate configuration
    Validate,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Start => {
            let config = load_config(cli.config.as_deref())?;
            init_logging(cli.log_level.as_deref().unwrap_or(config.logging.level.as_str()));
            run_start(config).await
        }
        Commands::Status { address } => {
            init_logging(cli.log_level.as_deref().unwrap_or("warn"));
            run_status(&address).await
        }
        Commands::Cluster => {
            init_logging(cli.log_level.as_deref().unwrap_or("warn"));
            let config = load_config(cli.config.as_deref())?;
            run_cluster(&config).await
        }
        Commands::Init { output, node_id } => run_init(&output, node_id),
        Commands::Validate => run_validate(cli.config.as_deref()),
    }
}

/// Initialize logging
fn init_logging(level: &str) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| level.into());

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Load the config file (explicit path, or `reservas.toml` if present) with
/// environment overrides; environment only when there is no file
fn load_config(path: Option<&Path>) -> anyhow::Result<CoordinatorConfig> {
    let path = path
        .map(Path::to_path_buf)
        .or_else(|| Some(PathBuf::from(DEFAULT_CONFIG)).filter(|p| p.exists()));

    match path {
        Some(path) => {
            let mut config = CoordinatorConfig::from_file(&path)
                .with_context(|| format!("failed to load {}", path.display()))?;
            config
                .apply_env()
                .context("invalid environment override")?;
            Ok(config)
        }
        None => CoordinatorConfig::from_env()
            .context("no config file; NODE_ID and SELF_URL must be set in the environment"),
    }
}

/// Start the node
async fn run_start(config: CoordinatorConfig) -> anyhow::Result<()> {
    tracing::info!("Starting reservas node {}", config.node.id);
    tracing::info!("  URL:     {}", config.node.url);
    tracing::info!("  Bind:    {}", config.node.bind_address);
    tracing::info!("  Peers:   {}", config.cluster.peers.join(", "));

    let cluster = ClusterMembership::new(config.self_spec(), config.peer_specs()?);
    let transport = Arc::new(HttpTransport::new(
        config.request_timeout(),
        config.heartbeat_timeout(),
    )?);
    let engine = Arc::new(ElectionEngine::new(
        cluster,
        transport,
        ElectionConfig::from(&config),
    ));

    let locks = Arc::new(LockManager::new(config.acquire_timeout()));

    let client = http_client(config.request_timeout())?;
    let endpoints = ServiceEndpoints::resolve(&config.services, &client)
        .await
        .context("failed to resolve collaborator services")?;
    tracing::info!(
        "Collaborators: clientes={} restaurantes={} replicacao={}",
        endpoints.clientes,
        endpoints.restaurantes,
        endpoints.replicacao.as_deref().unwrap_or("(disabled)")
    );
    let booking = Arc::new(BookingRouter::new(
        Arc::clone(&engine),
        Arc::clone(&locks),
        Collaborators::http(&endpoints, client.clone()),
        BookingPolicy {
            resource: config.lock.resource.clone(),
            low_capacity_threshold: config.lock.low_capacity_threshold,
        },
        client,
    ));

    let state = Arc::new(AppState {
        engine: Arc::clone(&engine),
        locks: Arc::clone(&locks),
        booking,
        default_resource: config.lock.resource.clone(),
    });
    let server = HttpServer::new(config.node.bind_address.clone(), config.api.cors_enabled, state);

    let cancel = CancellationToken::new();

    // Listen before electing so peers never see this node as down
    let listener = server.bind().await?;

    tokio::spawn(Arc::clone(&locks).follow_leadership(engine.subscribe()));
    let election = tokio::spawn(Arc::clone(&engine).start(cancel.child_token()));

    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("Received shutdown signal");
                cancel.cancel();
            }
        }
    });

    let served = server.serve(listener, cancel.clone()).await;
    cancel.cancel();
    if let Err(e) = election.await {
        tracing::warn!("Election task ended abnormally: {}", e);
    }
    served?;

    tracing::info!("Node {} stopped", config.node.id);
    Ok(())
}

/// Fetch `/status` from a node
async fn fetch_status(client: &reqwest::Client, url: &str) -> anyhow::Result<StatusReply> {
    let response = client
        .get(format!("{}/status", url.trim_end_matches('/')))
        .send()
        .await?;
    if !response.status().is_success() {
        bail!("status endpoint returned {}", response.status());
    }
    Ok(response.json().await?)
}

/// Show status for one node
async fn run_status(address: &str) -> anyhow::Result<()> {
    let client = http_client(Duration::from_secs(5))?;
    let status = fetch_status(&client, address)
        .await
        .with_context(|| format!("failed to get status from {}", address))?;
    println!("{}", serde_json::to_string_pretty(&status)?);
    Ok(())
}

/// Show every configured node
async fn run_cluster(config: &CoordinatorConfig) -> anyhow::Result<()> {
    let client = http_client(config.heartbeat_timeout())?;
    let mut nodes: Vec<NodeSpec> = config.peer_specs()?;
    if !nodes.iter().any(|n| n.id == config.node.id) {
        nodes.push(config.self_spec());
    }
    nodes.sort_by_key(|n| n.id);

    let statuses =
        futures::future::join_all(nodes.iter().map(|n| fetch_status(&client, &n.url))).await;

    println!();
    println!("Reservas Cluster Status (v{})", env!("CARGO_PKG_VERSION"));
    println!("========================================");
    println!();
    println!("{:<8} {:<32} {:<10} {:<12} {:<6}", "NODE", "URL", "STATE", "COORDINATOR", "ROUND");
    println!("{}", "-".repeat(72));

    for (node, status) in nodes.iter().zip(statuses) {
        match status {
            Ok(status) => {
                let state = format!("{:<10}", status.state.to_string());
                let state = if status.is_coordinator {
                    format!("\x1b[1;34m{}\x1b[0m", state)
                } else {
                    state
                };
                let coordinator = status
                    .coordinator_id
                    .map(|id| id.to_string())
                    .unwrap_or_else(|| "NONE".to_string());
                println!(
                    "{:<8} {:<32} {} {:<12} {:<6}",
                    node.id, node.url, state, coordinator, status.round
                );
            }
            Err(e) => {
                tracing::debug!("Node {} unreachable: {}", node.id, e);
                println!(
                    "{:<8} {:<32} \x1b[31m{:<10}\x1b[0m {:<12} {:<6}",
                    node.id, node.url, "OFFLINE", "-", "-"
                );
            }
        }
    }
    println!();
    Ok(())
}

/// Write a sample configuration file
fn run_init(output: &Path, node_id: u64) -> anyhow::Result<()> {
    if output.exists() {
        bail!("{} already exists", output.display());
    }
    std::fs::write(output, CoordinatorConfig::sample(node_id))
        .with_context(|| format!("failed to write {}", output.display()))?;

    println!("Configuration file created: {}", output.display());
    println!("\nEdit the cluster peers and service URLs to match your deployment.");
    println!("Then start with: reservas --config {} start", output.display());
    Ok(())
}

/// Validate configuration
fn run_validate(path: Option<&Path>) -> anyhow::Result<()> {
    match load_config(path) {
        Ok(config) => {
            println!("✓ Configuration is valid");
            println!("  Node ID:        {}", config.node.id);
            println!("  URL:            {}", config.node.url);
            println!("  Bind Address:   {}", config.node.bind_address);
            println!("  Peers:          {}", config.cluster.peers.len());
            println!("  Heartbeat:      {} ms", config.cluster.heartbeat_interval_ms);
            println!("  Lock Threshold: {} tables", config.lock.low_capacity_threshold);
            Ok(())
        }
        Err(e) => {
            eprintln!("✗ Configuration error: {:#}", e);
            Err(e)
        }
    }
}
