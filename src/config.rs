//! Configuration loading and types for the Sylve cluster service.
//!
//! Configuration is read from a YAML file and deserialized into the
//! [`Config`] struct.  Each subsection governs a different part of the
//! system: the HTTP API listener, the per-node database, the Raft
//! consensus core, cluster membership behaviour, logging and metrics.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level configuration.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    /// HTTP API settings.
    #[serde(default)]
    pub server: ServerConfig,

    /// Per-node database settings.
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Raft consensus settings.
    #[serde(default)]
    pub raft: RaftConfig,

    /// Cluster membership settings.
    #[serde(default)]
    pub cluster: ClusterConfig,

    /// Logging settings.
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Observability settings.
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

/// HTTP listener configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Bind host address.
    #[serde(default = "default_host")]
    pub host: String,

    /// Bind port. Peers reach this node's API on the same port, so it must
    /// match across the cluster.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Graceful shutdown timeout in seconds.
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            shutdown_timeout: default_shutdown_timeout(),
        }
    }
}

/// Per-node SQLite database.
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// Path to the SQLite database file.
    #[serde(default = "default_database_path")]
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_database_path(),
        }
    }
}

/// Raft consensus tuning.
#[derive(Debug, Clone, Deserialize)]
pub struct RaftConfig {
    /// Directory holding `raft-log.db`, `raft-stable.db` and `snapshots/`.
    #[serde(default = "default_raft_dir")]
    pub data_dir: PathBuf,

    /// Upper bound a proposer waits for a command to commit and apply.
    #[serde(default = "default_apply_timeout_ms")]
    pub apply_timeout_ms: u64,

    #[serde(default = "default_heartbeat_ms")]
    pub heartbeat_interval_ms: u64,

    #[serde(default = "default_election_min_ms")]
    pub election_timeout_min_ms: u64,

    #[serde(default = "default_election_max_ms")]
    pub election_timeout_max_ms: u64,

    /// Number of applied entries after which a snapshot is taken.
    #[serde(default = "default_snapshot_threshold")]
    pub snapshot_threshold: u64,

    /// How long a freshly bootstrapped node waits to become leader.
    #[serde(default = "default_leader_wait_secs")]
    pub leader_wait_secs: u64,

    /// Timeout for a single Raft RPC to a peer.
    #[serde(default = "default_rpc_timeout_ms")]
    pub rpc_timeout_ms: u64,
}

impl RaftConfig {
    pub fn apply_timeout(&self) -> Duration {
        Duration::from_millis(self.apply_timeout_ms)
    }

    pub fn leader_wait(&self) -> Duration {
        Duration::from_secs(self.leader_wait_secs)
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout_ms)
    }
}

impl Default for RaftConfig {
    fn default() -> Self {
        Self {
            data_dir: default_raft_dir(),
            apply_timeout_ms: default_apply_timeout_ms(),
            heartbeat_interval_ms: default_heartbeat_ms(),
            election_timeout_min_ms: default_election_min_ms(),
            election_timeout_max_ms: default_election_max_ms(),
            snapshot_threshold: default_snapshot_threshold(),
            leader_wait_secs: default_leader_wait_secs(),
            rpc_timeout_ms: default_rpc_timeout_ms(),
        }
    }
}

/// Cluster membership behaviour.
#[derive(Debug, Clone, Deserialize)]
pub struct ClusterConfig {
    /// Override the persisted node UUID.
    #[serde(default)]
    pub node_id: Option<String>,

    /// Override the hostname reported to peers.
    #[serde(default)]
    pub hostname: Option<String>,

    /// Scheme used when talking to peer APIs (`http` or `https`).
    #[serde(default = "default_api_scheme")]
    pub api_scheme: String,

    /// Interval of the background topology refresh.
    #[serde(default = "default_node_sync_interval")]
    pub node_sync_interval_secs: u64,

    /// Ask each peer for its canonical hostname during topology refresh.
    #[serde(default = "default_true")]
    pub resolve_hostnames: bool,

    /// Probe S3 targets for bucket access and permissions before storing them.
    #[serde(default = "default_true")]
    pub validate_s3_targets: bool,

    /// Timeout for health probes sent to peers.
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_secs: u64,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            node_id: None,
            hostname: None,
            api_scheme: default_api_scheme(),
            node_sync_interval_secs: default_node_sync_interval(),
            resolve_hostnames: true,
            validate_s3_targets: true,
            probe_timeout_secs: default_probe_timeout(),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error.
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format: text or json.
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

/// Observability settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ObservabilityConfig {
    /// Enable Prometheus metrics collection and the `/metrics` endpoint.
    #[serde(default = "default_true")]
    pub metrics: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self { metrics: true }
    }
}

// -- Defaults ----------------------------------------------------------------

fn default_true() -> bool {
    true
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8181
}

fn default_shutdown_timeout() -> u64 {
    30
}

fn default_database_path() -> String {
    "./data/sylve.db".to_string()
}

fn default_raft_dir() -> PathBuf {
    PathBuf::from("./data/raft")
}

fn default_apply_timeout_ms() -> u64 {
    5_000
}

fn default_heartbeat_ms() -> u64 {
    250
}

fn default_election_min_ms() -> u64 {
    1_000
}

fn default_election_max_ms() -> u64 {
    2_000
}

fn default_snapshot_threshold() -> u64 {
    1_024
}

fn default_leader_wait_secs() -> u64 {
    10
}

fn default_rpc_timeout_ms() -> u64 {
    3_000
}

fn default_api_scheme() -> String {
    "http".to_string()
}

fn default_node_sync_interval() -> u64 {
    30
}

fn default_probe_timeout() -> u64 {
    5
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}

// -- Loader ------------------------------------------------------------------

/// Load and parse configuration from a YAML file at `path`.
pub fn load_config<P: AsRef<Path>>(path: P) -> anyhow::Result<Config> {
    let contents = std::fs::read_to_string(path.as_ref())?;
    let config: Config = serde_yaml::from_str(&contents)?;
    Ok(config)
}
