//! The per-node cluster lifecycle manager.
//!
//! [`ClusterService`] owns the node's cluster row, the running consensus
//! instance (if any) and the dispatcher that instance applies into.
//! Lifecycle operations live in `lifecycle.rs`, proposers in `proposer.rs`
//! and topology queries in `detail.rs`; all of them are methods on this
//! type.

use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use utoipa::ToSchema;

use super::consensus::{Consensus, ConsensusLauncher, LaunchOptions, RaftRole};
use super::error::ClusterError;
use super::fsm::FsmDispatcher;
use super::net;
use crate::config::Config;
use crate::db::models::ClusterRecord;
use crate::db::Database;

/// Settings the lifecycle manager needs from the configuration.
#[derive(Debug, Clone)]
pub struct ClusterSettings {
    pub raft_dir: PathBuf,
    /// Port the HTTP API listens on; peers are reached at `host:api_port`.
    pub api_port: u16,
    pub api_scheme: String,
    pub apply_timeout: Duration,
    pub leader_wait: Duration,
    pub resolve_hostnames: bool,
    pub validate_s3_targets: bool,
    pub probe_timeout: Duration,
}

impl ClusterSettings {
    pub fn from_config(config: &Config, api_port: u16) -> Self {
        Self {
            raft_dir: config.raft.data_dir.clone(),
            api_port,
            api_scheme: config.cluster.api_scheme.clone(),
            apply_timeout: config.raft.apply_timeout(),
            leader_wait: config.raft.leader_wait(),
            resolve_hostnames: config.cluster.resolve_hostnames,
            validate_s3_targets: config.cluster.validate_s3_targets,
            probe_timeout: Duration::from_secs(config.cluster.probe_timeout_secs),
        }
    }
}

/// Who this node is.
#[derive(Debug, Clone)]
pub struct NodeIdentity {
    pub node_id: String,
    pub hostname: String,
}

impl NodeIdentity {
    /// Resolve the node UUID and hostname, preferring configured overrides.
    pub fn resolve(db: &Database, config: &Config) -> anyhow::Result<Self> {
        let node_id = match &config.cluster.node_id {
            Some(id) if !id.trim().is_empty() => id.trim().to_string(),
            _ => db.node_uuid()?,
        };
        let hostname = config
            .cluster
            .hostname
            .clone()
            .filter(|h| !h.trim().is_empty())
            .unwrap_or_else(system_hostname);
        Ok(Self { node_id, hostname })
    }
}

fn system_hostname() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .or_else(|| std::fs::read_to_string("/etc/hostname").ok())
        .map(|h| h.trim().to_string())
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "localhost".to_string())
}

/// Body of `GET /api/health/basic`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct HealthBasic {
    pub hostname: String,
    pub node_id: String,
    pub clustered: bool,
}

/// Where a replicated write should go from this node.
pub enum WriteRoute {
    /// Not clustered: apply locally through the bypass path.
    Local,
    /// This node is the leader: propose through consensus.
    Replicate(Arc<dyn Consensus>),
    /// Proxy to the leader's HTTP API at `api` (`host:port`).
    Forward { api: String },
    LeaderUnknown,
    /// Clustered, but consensus is not running.
    Unavailable,
}

pub struct ClusterService {
    pub(super) db: Arc<Database>,
    pub(super) dispatcher: Arc<FsmDispatcher>,
    pub(super) launcher: Arc<dyn ConsensusLauncher>,
    pub(super) consensus: RwLock<Option<Arc<dyn Consensus>>>,
    pub(super) cluster: RwLock<ClusterRecord>,
    pub(super) identity: NodeIdentity,
    pub(super) settings: ClusterSettings,
    /// Serializes create / join / reset / resume.
    pub(super) transitions: tokio::sync::Mutex<()>,
    pub(super) http: reqwest::Client,
}

impl ClusterService {
    pub fn new(
        db: Arc<Database>,
        dispatcher: Arc<FsmDispatcher>,
        launcher: Arc<dyn ConsensusLauncher>,
        identity: NodeIdentity,
        settings: ClusterSettings,
    ) -> anyhow::Result<Self> {
        let cluster = db.load_cluster()?;
        let http = reqwest::Client::builder()
            .timeout(settings.probe_timeout)
            .build()?;
        Ok(Self {
            db,
            dispatcher,
            launcher,
            consensus: RwLock::new(None),
            cluster: RwLock::new(cluster),
            identity,
            settings,
            transitions: tokio::sync::Mutex::new(()),
            http,
        })
    }

    pub fn node_id(&self) -> &str {
        &self.identity.node_id
    }

    pub fn hostname(&self) -> &str {
        &self.identity.hostname
    }

    pub fn settings(&self) -> &ClusterSettings {
        &self.settings
    }

    pub fn dispatcher(&self) -> &Arc<FsmDispatcher> {
        &self.dispatcher
    }

    pub fn database(&self) -> &Arc<Database> {
        &self.db
    }

    pub fn http(&self) -> &reqwest::Client {
        &self.http
    }

    /// Snapshot of the cluster row.
    pub fn cluster(&self) -> ClusterRecord {
        self.cluster.read().expect("mutex poisoned").clone()
    }

    /// Replicated writes skip consensus while the node is not clustered.
    pub fn bypass(&self) -> bool {
        !self.cluster.read().expect("mutex poisoned").enabled
    }

    pub fn health(&self) -> HealthBasic {
        HealthBasic {
            hostname: self.identity.hostname.clone(),
            node_id: self.identity.node_id.clone(),
            clustered: !self.bypass(),
        }
    }

    /// Persist the cluster row, then update the in-memory copy.
    pub(super) fn store_cluster(&self, record: ClusterRecord) -> Result<(), ClusterError> {
        self.db.save_cluster(&record)?;
        *self.cluster.write().expect("mutex poisoned") = record;
        Ok(())
    }

    pub fn consensus(&self) -> Option<Arc<dyn Consensus>> {
        self.consensus.read().expect("mutex poisoned").clone()
    }

    pub(super) fn set_consensus(&self, consensus: Option<Arc<dyn Consensus>>) {
        *self.consensus.write().expect("mutex poisoned") = consensus;
    }

    pub fn write_route(&self) -> WriteRoute {
        if self.bypass() {
            return WriteRoute::Local;
        }
        let Some(consensus) = self.consensus() else {
            return WriteRoute::Unavailable;
        };
        if consensus.role() == RaftRole::Leader {
            return WriteRoute::Replicate(consensus);
        }
        match consensus
            .leader()
            .and_then(|l| net::api_address(&l.address, self.settings.api_port))
        {
            Some(api) => WriteRoute::Forward { api },
            None => WriteRoute::LeaderUnknown,
        }
    }

    /// Start a consensus instance for `record` and keep it as the current one.
    pub(super) async fn start_consensus(
        &self,
        record: &ClusterRecord,
        bootstrap: bool,
    ) -> Result<Arc<dyn Consensus>, ClusterError> {
        let opts = LaunchOptions {
            node_id: self.identity.node_id.clone(),
            bind_ip: record.bind_ip.clone(),
            bind_port: record.bind_port,
            bootstrap,
            data_dir: self.settings.raft_dir.clone(),
        };
        let consensus = self
            .launcher
            .launch(opts)
            .await
            .map_err(|e| ClusterError::Startup(e.to_string()))?;
        self.set_consensus(Some(consensus.clone()));
        Ok(consensus)
    }

    /// Resume clustering after a restart.
    ///
    /// A disabled node starts nothing.  With on-disk consensus state the
    /// node rejoins as a regular member; without it, the persisted
    /// bootstrap flag decides whether it seeds a new configuration.
    pub async fn init_raft(&self) -> Result<(), ClusterError> {
        let _guard = self.transitions.lock().await;
        let record = self.cluster();
        if !record.enabled {
            info!("clustering disabled; running standalone");
            return Ok(());
        }
        if self.consensus().is_some() {
            return Ok(());
        }

        let has_state = net::raft_state_exists(&self.settings.raft_dir);
        if !has_state {
            self.dispatcher.clear_applied()?;
        }
        let bootstrap = !has_state && record.raft_bootstrap.unwrap_or(false);
        info!(
            addr = %record.bind_address(),
            has_state,
            bootstrap,
            "resuming consensus"
        );
        self.start_consensus(&record, bootstrap).await?;
        Ok(())
    }

    /// Wait until `consensus` reports this node as leader.
    pub(super) async fn wait_for_leader(
        &self,
        consensus: &Arc<dyn Consensus>,
    ) -> Result<(), ClusterError> {
        let wait = self.settings.leader_wait;
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            if consensus.role() == RaftRole::Leader {
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(ClusterError::LeaderElectionTimeout(wait));
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    /// Fetch a peer's health document from `api` (`host:port`).
    pub async fn probe_health(&self, api: &str) -> anyhow::Result<HealthBasic> {
        let url = format!("{}://{}/api/health/basic", self.settings.api_scheme, api);
        let body: serde_json::Value = self
            .http
            .get(&url)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        let health = serde_json::from_value(body["data"].clone())?;
        Ok(health)
    }

    /// Stop consensus without touching the cluster row.
    pub async fn shutdown(&self) {
        let consensus = self.consensus.write().expect("mutex poisoned").take();
        if let Some(consensus) = consensus {
            if let Err(e) = consensus.shutdown().await {
                warn!(error = %e, "consensus shutdown failed");
            }
        }
    }

    /// Refresh the cached node table every `interval` while clustered.
    pub fn spawn_node_sync(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let service = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if service.bypass() || service.consensus().is_none() {
                    continue;
                }
                match service.populate_cluster_nodes().await {
                    Ok(()) => debug!("cluster nodes refreshed"),
                    Err(e) => warn!(error = %e, "cluster node sync failed"),
                }
            }
        })
    }
}
