//! Cluster lifecycle: create, join, accept-join and reset.
//!
//! ```text
//! Disabled ──create──▶ Bootstrapping ──▶ Clustered (leader/follower)
//!    ▲                                          │
//!    └──────────────────reset───────────────────┘
//! ```

use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;
use tracing::{info, warn};
use utoipa::ToSchema;

use super::command::{action, Command, Domain};
use super::consensus::{Consensus, RaftRole, Suffrage};
use super::domains::notes::{self, NoteCreate};
use super::domains::options::{self, OptionSet};
use super::domains::s3::{self, S3ConfigInput};
use super::error::ClusterError;
use super::net;
use super::service::ClusterService;
use crate::db::models::ClusterRecord;

/// Result of a successful accept-join.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum JoinOutcome {
    Added,
    AlreadyMember,
}

/// Body a joiner posts to the leader's accept-join endpoint.
#[derive(Debug, Clone, Serialize, Deserialize, garde::Validate, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct AcceptJoinRequest {
    #[garde(length(min = 1))]
    pub node_id: String,
    #[garde(ip)]
    pub node_ip: String,
    #[garde(range(min = 1024))]
    pub node_port: u16,
    #[garde(length(min = 1))]
    pub cluster_key: String,
}

fn validate_bind(ip: &str, port: u16) -> Result<(), ClusterError> {
    if !net::valid_ip(ip) {
        return Err(ClusterError::InvalidIp(ip.to_string()));
    }
    if port < 1024 {
        return Err(ClusterError::InvalidPort(u32::from(port)));
    }
    Ok(())
}

fn probe_port(ip: &str, port: u16) -> Result<(), ClusterError> {
    net::try_bind(ip, port).map_err(|e| ClusterError::PortUnavailable {
        addr: net::join_host_port(ip, port),
        reason: e.to_string(),
    })
}

impl ClusterService {
    /// Bootstrap a new single-voter cluster on `ip:port`.
    pub async fn create_cluster(&self, ip: &str, port: u16) -> Result<ClusterRecord, ClusterError> {
        validate_bind(ip, port)?;
        let guard = self.transitions.lock().await;

        if self.consensus().is_some() {
            return Err(ClusterError::RaftAlreadyInitialized);
        }
        probe_port(ip, port)?;
        if net::raft_state_exists(&self.settings.raft_dir) {
            return Err(ClusterError::RaftStateExists);
        }
        let current = self.cluster();
        if current.enabled {
            return Err(ClusterError::ClusterAlreadyExists);
        }

        let key = if current.key.is_empty() {
            net::generate_cluster_key()
        } else {
            current.key.clone()
        };
        let record = ClusterRecord {
            enabled: true,
            key: key.clone(),
            raft_bootstrap: Some(true),
            bind_ip: ip.to_string(),
            bind_port: port,
        };

        self.dispatcher.clear_applied()?;
        self.store_cluster(record.clone())?;
        let consensus = match self.start_consensus(&record, true).await {
            Ok(c) => c,
            Err(e) => {
                warn!(error = %e, "bootstrap failed; reverting cluster row");
                self.revert_cluster(ClusterRecord {
                    key,
                    ..ClusterRecord::disabled()
                })
                .await;
                return Err(e);
            }
        };
        info!(addr = %record.bind_address(), "cluster created");

        // The cluster exists from here on; later steps only warn.
        match self.wait_for_leader(&consensus).await {
            Ok(()) => match self.backfill(consensus.as_ref()).await {
                Ok(()) => {
                    if let Err(e) = consensus.trigger_snapshot().await {
                        warn!(error = %e, "post-bootstrap snapshot failed");
                    }
                }
                Err(e) => warn!(error = %e, "pre-cluster rows were not replicated"),
            },
            Err(e) => warn!(error = %e, "cluster created but no leader yet; skipping backfill"),
        }
        drop(guard);

        if let Err(e) = self.populate_cluster_nodes().await {
            warn!(error = %e, "initial node population failed");
        }
        Ok(record)
    }

    /// Re-propose rows created before clustering so they enter the log.
    async fn backfill(&self, consensus: &dyn Consensus) -> Result<(), ClusterError> {
        let (note_rows, option_rows, s3_rows) = self.dispatcher.read(|conn| {
            Ok((notes::list(conn)?, options::list(conn)?, s3::list(conn)?))
        })?;
        let total = note_rows.len() + option_rows.len() + s3_rows.len();
        if total == 0 {
            return Ok(());
        }

        let mut commands = Vec::with_capacity(total);
        for n in note_rows {
            commands.push(encode(Command::new(
                Domain::Note,
                action::CREATE,
                &NoteCreate {
                    id: Some(n.id),
                    title: n.title,
                    content: n.content,
                    created_at: Some(n.created_at),
                    updated_at: Some(n.updated_at),
                },
            ))?);
        }
        for o in option_rows {
            commands.push(encode(Command::new(
                Domain::Options,
                action::SET,
                &OptionSet {
                    keyboard_layout: o.keyboard_layout,
                    created_at: Some(o.created_at),
                    updated_at: Some(o.updated_at),
                },
            ))?);
        }
        for c in s3_rows {
            commands.push(encode(Command::new(
                Domain::S3Config,
                action::CREATE,
                &S3ConfigInput {
                    id: Some(c.id),
                    name: c.name,
                    endpoint: c.endpoint,
                    region: c.region,
                    bucket: c.bucket,
                    access_key: c.access_key,
                    secret_key: c.secret_key,
                },
            ))?);
        }

        for command in commands {
            self.submit(consensus, &command).await?;
        }
        info!(rows = total, "pre-cluster rows replicated");
        Ok(())
    }

    /// Start consensus passively so a leader can add this node.
    ///
    /// Any local replicated rows are discarded; the leader's state arrives
    /// through the log or a snapshot.  On failure the cluster row is reset
    /// to the disabled state.
    pub async fn start_as_joiner(&self, ip: &str, port: u16, key: &str) -> Result<(), ClusterError> {
        validate_bind(ip, port)?;
        if key.trim().is_empty() {
            return Err(ClusterError::InvalidClusterKey);
        }
        let _guard = self.transitions.lock().await;

        if self.cluster().enabled {
            return Err(ClusterError::ClusteredAlready);
        }
        if self.consensus().is_some() {
            return Err(ClusterError::RaftAlreadyInitialized);
        }
        probe_port(ip, port)?;

        net::clear_raft_state(&self.settings.raft_dir)?;
        self.dispatcher.reset()?;

        let record = ClusterRecord {
            enabled: true,
            key: key.to_string(),
            raft_bootstrap: Some(false),
            bind_ip: ip.to_string(),
            bind_port: port,
        };
        if let Err(e) = self.store_cluster(record.clone()) {
            self.revert_cluster(ClusterRecord::disabled()).await;
            return Err(e);
        }
        if let Err(e) = self.start_consensus(&record, false).await {
            warn!(error = %e, "joiner failed to start; reverting cluster row");
            self.revert_cluster(ClusterRecord::disabled()).await;
            return Err(e);
        }
        info!(addr = %record.bind_address(), "waiting to be added by the leader");
        Ok(())
    }

    /// Join the cluster led by the node whose API is at `leader_api`.
    ///
    /// Starts this node as a passive joiner, then asks the leader to add it.
    /// If the leader does not confirm, the joiner keeps running: it receives
    /// nothing until an accept-join succeeds, and calling this again with the
    /// same address only repeats the request.
    pub async fn join_cluster(
        &self,
        leader_api: &str,
        ip: &str,
        port: u16,
        key: &str,
    ) -> Result<(), ClusterError> {
        self.probe_health(leader_api)
            .await
            .map_err(|e| ClusterError::LeaderUnreachable(format!("{leader_api}: {e:#}")))?;
        if self.is_pending_joiner(ip, port) {
            self.update_join_key(key)?;
        } else {
            self.start_as_joiner(ip, port, key).await?;
        }

        let request = AcceptJoinRequest {
            node_id: self.node_id().to_string(),
            node_ip: ip.to_string(),
            node_port: port,
            cluster_key: key.to_string(),
        };
        if let Err(e) = self.request_accept(leader_api, &request).await {
            warn!(%leader_api, error = %e, "leader did not confirm join; joiner stays up for a retry");
            return Err(e);
        }
        info!(%leader_api, "joined cluster");
        Ok(())
    }

    /// Whether this node already runs as a joiner bound to `ip:port`.
    fn is_pending_joiner(&self, ip: &str, port: u16) -> bool {
        let record = self.cluster();
        record.enabled
            && record.raft_bootstrap == Some(false)
            && record.bind_ip == ip
            && record.bind_port == port
            && self.consensus().is_some()
    }

    fn update_join_key(&self, key: &str) -> Result<(), ClusterError> {
        if key.trim().is_empty() {
            return Err(ClusterError::InvalidClusterKey);
        }
        let mut record = self.cluster();
        if record.key != key {
            record.key = key.to_string();
            self.store_cluster(record)?;
        }
        Ok(())
    }

    async fn request_accept(
        &self,
        leader_api: &str,
        request: &AcceptJoinRequest,
    ) -> Result<(), ClusterError> {
        let url = format!(
            "{}://{}/api/cluster/accept-join",
            self.settings.api_scheme, leader_api
        );
        let resp = self
            .http
            .post(&url)
            // The leader may remove a stale entry and add a voter before answering.
            .timeout(self.settings.apply_timeout * 2 + self.settings.probe_timeout)
            .json(request)
            .send()
            .await
            .map_err(|e| ClusterError::LeaderUnreachable(e.to_string()))?;
        if resp.status().is_success() {
            return Ok(());
        }
        let status = resp.status();
        let body: serde_json::Value = resp.json().await.unwrap_or_default();
        let code = body["error"].as_str().unwrap_or("unknown_error");
        Err(ClusterError::Membership(format!(
            "leader rejected join ({status}): {code}"
        )))
    }

    async fn revert_cluster(&self, record: ClusterRecord) {
        self.shutdown().await;
        if let Err(e) = self.store_cluster(record) {
            warn!(error = %e, "failed to revert cluster row");
        }
        if let Err(e) = net::clear_raft_state(&self.settings.raft_dir) {
            warn!(error = %e, "failed to clear consensus state");
        }
    }

    /// Leader side of the join protocol.
    pub async fn accept_join(
        &self,
        node_id: &str,
        ip: &str,
        port: u16,
        key: &str,
    ) -> Result<JoinOutcome, ClusterError> {
        let cluster = self.cluster();
        if !cluster.enabled {
            return Err(ClusterError::ClusterNotFound);
        }
        if !bool::from(key.as_bytes().ct_eq(cluster.key.as_bytes())) {
            return Err(ClusterError::InvalidClusterKey);
        }
        validate_bind(ip, port)?;
        let consensus = self.consensus().ok_or(ClusterError::NotInitialized)?;
        if consensus.role() != RaftRole::Leader {
            let leader = consensus.leader();
            return Err(ClusterError::NotLeader {
                leader_address: leader.as_ref().map(|l| l.address.clone()),
                leader_id: leader.map(|l| l.id),
            });
        }

        let address = net::join_host_port(ip, port);
        if address == cluster.bind_address() {
            return Err(ClusterError::PortUnavailable {
                addr: address,
                reason: "address belongs to the leader".to_string(),
            });
        }
        let servers = consensus
            .configuration()
            .map_err(|e| ClusterError::Membership(e.to_string()))?;

        if servers
            .iter()
            .any(|s| s.id == node_id && s.address == address && s.suffrage == Suffrage::Voter)
        {
            info!(node = %node_id, %address, "node is already a voter");
            return Ok(JoinOutcome::AlreadyMember);
        }

        let timeout = self.settings.apply_timeout;
        for stale in servers
            .iter()
            .filter(|s| (s.id == node_id) != (s.address == address))
        {
            info!(node = %stale.id, address = %stale.address, "removing stale member");
            consensus
                .remove_server(&stale.id, timeout)
                .await
                .map_err(ClusterError::from_membership)?;
        }
        consensus
            .add_voter(node_id, &address, timeout)
            .await
            .map_err(ClusterError::from_membership)?;
        info!(node = %node_id, %address, "node joined");

        if let Err(e) = self.populate_cluster_nodes().await {
            warn!(error = %e, "node population after join failed");
        }
        Ok(JoinOutcome::Added)
    }

    /// Leave the cluster and return to the disabled state.
    ///
    /// The leader of a cluster with other voters is refused unless `force`
    /// is set, in which case it removes itself from the configuration first.
    pub async fn reset_raft_node(&self, force: bool) -> Result<(), ClusterError> {
        let _guard = self.transitions.lock().await;

        if let Some(consensus) = self.consensus() {
            if consensus.role() == RaftRole::Leader {
                let voters = consensus
                    .configuration()
                    .map(|servers| {
                        servers
                            .iter()
                            .filter(|s| s.suffrage == Suffrage::Voter)
                            .count()
                    })
                    .unwrap_or(1);
                if voters > 1 {
                    if !force {
                        return Err(ClusterError::LeaderResetUnsafe);
                    }
                    consensus
                        .remove_server(self.node_id(), self.settings.apply_timeout)
                        .await
                        .map_err(ClusterError::from_membership)?;
                }
            }
        }

        self.shutdown().await;
        self.store_cluster(ClusterRecord::disabled())?;
        net::clear_raft_state(&self.settings.raft_dir)?;
        self.dispatcher.clear_applied()?;
        info!(force, "node reset; clustering disabled");
        Ok(())
    }
}

fn encode(command: Result<Command, serde_json::Error>) -> Result<Command, ClusterError> {
    command.map_err(|e| ClusterError::Store(e.into()))
}

