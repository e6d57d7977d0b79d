//! Sylve -- cluster control plane node.
//!
//! Crash-only design: every startup is a recovery.  A node that was
//! clustered when it stopped resumes consensus from its on-disk state;
//! SIGTERM/SIGINT stop the listener, then the consensus core.

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{error, info};

use sylve::cluster::fsm::FsmDispatcher;
use sylve::cluster::raft::RaftLauncher;
use sylve::cluster::{ClusterService, ClusterSettings, NodeIdentity};
use sylve::config::{Config, LoggingConfig};
use sylve::db::Database;

/// Command-line arguments for a Sylve node.
#[derive(Parser, Debug)]
#[command(name = "sylve", version, about = "Sylve cluster control plane")]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long, default_value = "sylve.example.yaml")]
    config: String,

    /// Override the API bind address (host:port).
    #[arg(short, long)]
    bind: Option<String>,
}

fn init_logging(logging: &LoggingConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&logging.level));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if logging.format.eq_ignore_ascii_case("json") {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = match sylve::config::load_config(&cli.config) {
        Ok(config) => config,
        Err(e) if !std::path::Path::new(&cli.config).exists() => {
            eprintln!("config {} not found ({e}); using defaults", cli.config);
            Config::default()
        }
        Err(e) => return Err(e),
    };
    init_logging(&config.logging);
    info!("Loaded configuration from {}", cli.config);

    let bind_addr = cli
        .bind
        .unwrap_or_else(|| format!("{}:{}", config.server.host, config.server.port));
    let api_port = bind_addr
        .rsplit_once(':')
        .and_then(|(_, p)| p.parse::<u16>().ok())
        .unwrap_or(config.server.port);

    if config.observability.metrics {
        sylve::metrics::init_metrics();
        sylve::metrics::describe_metrics();
        info!("Prometheus metrics initialized");
    }

    if let Some(parent) = std::path::Path::new(&config.database.path).parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::create_dir_all(&config.raft.data_dir)?;
    let db = Arc::new(Database::open(&config.database.path)?);
    info!("Database opened at {}", config.database.path);

    let identity = NodeIdentity::resolve(&db, &config)?;
    info!(node_id = %identity.node_id, hostname = %identity.hostname, "node identity");

    let dispatcher = Arc::new(FsmDispatcher::with_default_handlers(db.clone()));
    let launcher = Arc::new(RaftLauncher::new(dispatcher.clone(), config.raft.clone()));
    let cluster = Arc::new(ClusterService::new(
        db,
        dispatcher,
        launcher,
        identity,
        ClusterSettings::from_config(&config, api_port),
    )?);

    // Crash-only startup: resume whatever cluster state was persisted.
    if let Err(e) = cluster.init_raft().await {
        error!(error = %e, "failed to resume consensus; serving standalone reads");
    }
    let sync = cluster.spawn_node_sync(Duration::from_secs(
        config.cluster.node_sync_interval_secs.max(1),
    ));

    let shutdown_timeout = Duration::from_secs(config.server.shutdown_timeout);
    let state = Arc::new(sylve::AppState {
        config,
        cluster: cluster.clone(),
    });
    let app = sylve::server::app(state);

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!("Sylve listening on {}", bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    sync.abort();
    if tokio::time::timeout(shutdown_timeout, cluster.shutdown())
        .await
        .is_err()
    {
        error!("consensus did not stop within {:?}", shutdown_timeout);
    }
    info!("Sylve shut down");

    Ok(())
}

/// Wait for SIGTERM or SIGINT (Ctrl+C), then return to trigger graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received SIGINT, shutting down");
        },
        _ = terminate => {
            info!("Received SIGTERM, shutting down");
        },
    }
}
