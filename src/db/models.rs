//! Row types for the per-node database.
//!
//! The cluster-wide tables (`cluster_notes`, `cluster_options`,
//! `cluster_s3_configs`) are replicated through the command log once the
//! node is clustered; everything else here is local to the node.

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// The node's single cluster configuration row.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ClusterRecord {
    pub enabled: bool,
    /// Shared secret a joiner must present to the leader.
    pub key: String,
    /// `Some(true)` when this node seeded the cluster, `Some(false)` when it
    /// joined one, `None` when never clustered.
    pub raft_bootstrap: Option<bool>,
    #[serde(rename = "raftIP")]
    pub bind_ip: String,
    #[serde(rename = "raftPort")]
    pub bind_port: u16,
}

impl ClusterRecord {
    /// The declustered state a node returns to after a reset or failed join.
    pub fn disabled() -> Self {
        Self::default()
    }

    /// `ip:port` the consensus transport listens on.
    pub fn bind_address(&self) -> String {
        crate::cluster::net::join_host_port(&self.bind_ip, self.bind_port)
    }
}

/// Presence of a peer in the cached topology.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    Online,
    Offline,
}

impl NodeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeStatus::Online => "online",
            NodeStatus::Offline => "offline",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "online" => NodeStatus::Online,
            _ => NodeStatus::Offline,
        }
    }
}

/// Cached view of a peer, rebuilt from the live consensus configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ClusterNodeRecord {
    pub id: i64,
    #[serde(rename = "nodeUUID")]
    pub node_uuid: String,
    pub status: NodeStatus,
    pub hostname: String,
    /// `host:port` of the peer's HTTP API.
    pub api: String,
    pub created_at: String,
    pub updated_at: String,
}

/// A peer as seen in the current configuration, before it is cached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiveNode {
    pub node_uuid: String,
    pub hostname: String,
    pub api: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct NoteRecord {
    pub id: i64,
    pub title: String,
    pub content: String,
    pub created_at: String,
    pub updated_at: String,
}

/// Cluster-wide options; always stored as row `id = 1`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct OptionRecord {
    pub id: i64,
    pub keyboard_layout: String,
    pub created_at: String,
    pub updated_at: String,
}

/// An S3 backup target shared by the whole cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct S3ConfigRecord {
    pub id: i64,
    pub name: String,
    pub endpoint: String,
    pub region: String,
    pub bucket: String,
    pub access_key: String,
    pub secret_key: String,
}
