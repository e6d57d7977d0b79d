//! Topology views: live configuration and the cached node table.

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use utoipa::ToSchema;

use super::consensus::Suffrage;
use super::error::ClusterError;
use super::net;
use super::service::ClusterService;
use crate::db::models::{ClusterNodeRecord, ClusterRecord, LiveNode};

/// One member of the live consensus configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct RaftNodeView {
    pub id: String,
    pub address: String,
    pub suffrage: Suffrage,
    pub is_leader: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ClusterDetails {
    pub cluster: ClusterRecord,
    pub node_id: String,
    pub nodes: Vec<RaftNodeView>,
    pub leader_id: Option<String>,
    pub leader_address: Option<String>,
    /// The configuration could not be read; `nodes` is empty.
    pub partial: bool,
}

impl ClusterService {
    /// Cluster row plus the live configuration, when available.
    pub fn details(&self) -> ClusterDetails {
        let mut details = ClusterDetails {
            cluster: self.cluster(),
            node_id: self.node_id().to_string(),
            nodes: Vec::new(),
            leader_id: None,
            leader_address: None,
            partial: false,
        };
        let Some(consensus) = self.consensus() else {
            return details;
        };

        let leader = consensus.leader();
        details.leader_id = leader.as_ref().map(|l| l.id.clone());
        details.leader_address = leader.as_ref().map(|l| l.address.clone());

        match consensus.configuration() {
            Ok(servers) => {
                details.nodes = servers
                    .into_iter()
                    .map(|s| RaftNodeView {
                        is_leader: details.leader_id.as_deref() == Some(s.id.as_str()),
                        id: s.id,
                        address: s.address,
                        suffrage: s.suffrage,
                    })
                    .collect();
            }
            Err(e) => {
                warn!(error = %e, "cluster configuration unavailable");
                details.partial = true;
            }
        }
        details
    }

    /// Rebuild the node table from the live configuration.
    ///
    /// Voters are marked online with their API address and hostname; cached
    /// nodes missing from the configuration are marked offline.
    pub async fn populate_cluster_nodes(&self) -> Result<(), ClusterError> {
        let consensus = self.consensus().ok_or(ClusterError::NotInitialized)?;
        let servers = consensus
            .configuration()
            .map_err(|e| ClusterError::Membership(e.to_string()))?;

        let mut live = Vec::new();
        for server in servers.into_iter().filter(|s| s.suffrage == Suffrage::Voter) {
            let Some(api) = net::api_address(&server.address, self.settings.api_port) else {
                warn!(address = %server.address, "skipping member with unparsable address");
                continue;
            };
            let fallback = net::split_host(&server.address)
                .unwrap_or(server.address.as_str())
                .to_string();

            let hostname = if server.id == self.node_id() {
                self.hostname().to_string()
            } else if self.settings.resolve_hostnames {
                match self.probe_health(&api).await {
                    Ok(h) if !h.hostname.is_empty() => h.hostname,
                    Ok(_) => fallback,
                    Err(e) => {
                        debug!(%api, error = %e, "hostname probe failed");
                        fallback
                    }
                }
            } else {
                fallback
            };

            live.push(LiveNode {
                node_uuid: server.id,
                hostname,
                api,
            });
        }

        self.db.reconcile_nodes(&live)?;
        Ok(())
    }

    /// The cached node table.
    pub fn nodes(&self) -> Result<Vec<ClusterNodeRecord>, ClusterError> {
        Ok(self.db.list_nodes()?)
    }
}
