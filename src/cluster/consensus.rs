//! The seam between the lifecycle manager and the consensus core.
//!
//! [`ClusterService`](super::service::ClusterService) only talks to a
//! `dyn Consensus`.  The production implementation is
//! [`RaftNode`](super::raft::RaftNode); tests use the in-process double in
//! `cluster::mock`.

use std::fmt;
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use utoipa::ToSchema;

use super::fsm::ApplyOutcome;

pub type ConsensusFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, ConsensusError>> + Send + 'a>>;

/// Voting status of a configuration member.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum Suffrage {
    Voter,
    Nonvoter,
}

/// One member of the current configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerInfo {
    /// Node UUID.
    pub id: String,
    /// Raft bind address (`ip:port`).
    pub address: String,
    pub suffrage: Suffrage,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RaftRole {
    Follower,
    Candidate,
    Leader,
    Learner,
    Shutdown,
}

impl fmt::Display for RaftRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RaftRole::Follower => "follower",
            RaftRole::Candidate => "candidate",
            RaftRole::Leader => "leader",
            RaftRole::Learner => "learner",
            RaftRole::Shutdown => "shutdown",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaderInfo {
    pub id: String,
    pub address: String,
}

#[derive(Debug, Error)]
pub enum ConsensusError {
    #[error("this node is not the leader")]
    NotLeader { leader: Option<LeaderInfo> },

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("commit failed: {0}")]
    Commit(String),

    #[error("configuration unavailable: {0}")]
    ConfigurationUnavailable(String),

    #[error("failed to start consensus core: {0}")]
    Startup(String),

    #[error("consensus core stopped: {0}")]
    Fatal(String),
}

/// A running consensus instance.
pub trait Consensus: Send + Sync {
    /// Append `command` to the log and wait until it is applied locally.
    fn apply(&self, command: Vec<u8>, timeout: Duration) -> ConsensusFuture<'_, ApplyOutcome>;

    /// Add (or re-add) `id` at `address` as a voter.
    fn add_voter(&self, id: &str, address: &str, timeout: Duration) -> ConsensusFuture<'_, ()>;

    /// Remove `id` from the configuration entirely.
    fn remove_server(&self, id: &str, timeout: Duration) -> ConsensusFuture<'_, ()>;

    fn configuration(&self) -> Result<Vec<ServerInfo>, ConsensusError>;

    fn leader(&self) -> Option<LeaderInfo>;

    fn role(&self) -> RaftRole;

    fn trigger_snapshot(&self) -> ConsensusFuture<'_, ()>;

    /// Stop the core and release its transport.
    fn shutdown(&self) -> ConsensusFuture<'_, ()>;
}

/// Parameters for starting a consensus instance.
#[derive(Debug, Clone)]
pub struct LaunchOptions {
    pub node_id: String,
    pub bind_ip: String,
    pub bind_port: u16,
    /// Seed a single-voter configuration containing only this node.
    pub bootstrap: bool,
    pub data_dir: PathBuf,
}

/// Starts consensus instances.
pub trait ConsensusLauncher: Send + Sync {
    fn launch(&self, opts: LaunchOptions) -> ConsensusFuture<'_, Arc<dyn Consensus>>;
}
