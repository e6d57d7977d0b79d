//! Lifecycle and proposer errors.
//!
//! Every variant carries a machine-readable snake_case code and an HTTP
//! status, so handlers can return `Err(ClusterError::..)?` directly.

use std::time::Duration;

use axum::http::StatusCode;
use thiserror::Error;

use super::consensus::ConsensusError;
use super::fsm::FsmError;

#[derive(Debug, Error)]
pub enum ClusterError {
    // -- Precondition ---------------------------------------------------------
    #[error("a consensus instance is already running on this node")]
    RaftAlreadyInitialized,

    #[error("consensus state from a previous cluster exists on disk")]
    RaftStateExists,

    #[error("a cluster is already configured on this node")]
    ClusterAlreadyExists,

    #[error("this node is already part of a cluster")]
    ClusteredAlready,

    #[error("invalid IP address: {0}")]
    InvalidIp(String),

    #[error("invalid port number: {0}")]
    InvalidPort(u32),

    #[error("cannot bind {addr}: {reason}")]
    PortUnavailable { addr: String, reason: String },

    #[error("no cluster is configured on this node")]
    ClusterNotFound,

    #[error("invalid cluster key")]
    InvalidClusterKey,

    #[error("consensus is not running on this node")]
    NotInitialized,

    #[error("this node is not the leader")]
    NotLeader {
        leader_address: Option<String>,
        leader_id: Option<String>,
    },

    #[error("refusing to reset the leader of a multi-node cluster")]
    LeaderResetUnsafe,

    #[error("no leader elected within {0:?}")]
    LeaderElectionTimeout(Duration),

    #[error("{0}")]
    InvalidS3Config(String),

    #[error("leader health check failed: {0}")]
    LeaderUnreachable(String),

    // -- Commit-level ---------------------------------------------------------
    #[error("apply did not complete within {0:?}; the entry may still commit")]
    CommitTimeout(Duration),

    #[error("apply failed: {0}")]
    Commit(String),

    // -- Handler-level --------------------------------------------------------
    #[error("{0}")]
    HandlerFailed(String),

    // -- Internal -------------------------------------------------------------
    #[error("failed to start consensus: {0}")]
    Startup(String),

    #[error("membership change failed: {0}")]
    Membership(String),

    #[error(transparent)]
    Fsm(FsmError),

    #[error(transparent)]
    Store(#[from] anyhow::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl ClusterError {
    pub fn code(&self) -> &'static str {
        match self {
            ClusterError::RaftAlreadyInitialized => "raft_already_initialized",
            ClusterError::RaftStateExists => "raft_state_already_exists",
            ClusterError::ClusterAlreadyExists => "cluster_already_exists",
            ClusterError::ClusteredAlready => "clustered_already",
            ClusterError::InvalidIp(_) => "invalid_ip_address",
            ClusterError::InvalidPort(_) => "invalid_port_number",
            ClusterError::PortUnavailable { .. } => "port_unavailable",
            ClusterError::ClusterNotFound => "cluster_not_found",
            ClusterError::InvalidClusterKey => "invalid_cluster_key",
            ClusterError::NotInitialized => "raft_not_initialized",
            ClusterError::NotLeader { .. } => "not_leader",
            ClusterError::LeaderResetUnsafe => "leader_reset_unsafe",
            ClusterError::LeaderElectionTimeout(_) => "leader_election_timeout",
            ClusterError::InvalidS3Config(_) => "s3_config_invalid",
            ClusterError::LeaderUnreachable(_) => "leader_unreachable",
            ClusterError::CommitTimeout(_) => "raft_apply_timeout",
            ClusterError::Commit(_) => "raft_apply_failed",
            ClusterError::HandlerFailed(_) => "fsm_apply_failed",
            ClusterError::Startup(_) => "raft_start_failed",
            ClusterError::Membership(_) => "raft_membership_failed",
            ClusterError::Fsm(_) => "fsm_error",
            ClusterError::Store(_) => "store_error",
            ClusterError::Io(_) => "io_error",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            ClusterError::InvalidIp(_)
            | ClusterError::InvalidPort(_)
            | ClusterError::InvalidS3Config(_) => StatusCode::BAD_REQUEST,
            ClusterError::InvalidClusterKey => StatusCode::FORBIDDEN,
            ClusterError::ClusterNotFound => StatusCode::NOT_FOUND,
            ClusterError::RaftAlreadyInitialized
            | ClusterError::RaftStateExists
            | ClusterError::ClusterAlreadyExists
            | ClusterError::ClusteredAlready
            | ClusterError::PortUnavailable { .. }
            | ClusterError::NotLeader { .. }
            | ClusterError::LeaderResetUnsafe => StatusCode::CONFLICT,
            ClusterError::HandlerFailed(_) => StatusCode::UNPROCESSABLE_ENTITY,
            ClusterError::LeaderUnreachable(_) => StatusCode::BAD_GATEWAY,
            ClusterError::NotInitialized => StatusCode::SERVICE_UNAVAILABLE,
            ClusterError::LeaderElectionTimeout(_) | ClusterError::CommitTimeout(_) => {
                StatusCode::GATEWAY_TIMEOUT
            }
            ClusterError::Commit(_)
            | ClusterError::Startup(_)
            | ClusterError::Membership(_)
            | ClusterError::Fsm(_)
            | ClusterError::Store(_)
            | ClusterError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Map a failed `apply` to the commit-level error classes.
    pub fn from_commit(err: ConsensusError) -> Self {
        match err {
            ConsensusError::Timeout(d) => ClusterError::CommitTimeout(d),
            ConsensusError::NotLeader { leader } => ClusterError::NotLeader {
                leader_address: leader.as_ref().map(|l| l.address.clone()),
                leader_id: leader.map(|l| l.id),
            },
            other => ClusterError::Commit(other.to_string()),
        }
    }

    /// Map a failed membership change.
    pub fn from_membership(err: ConsensusError) -> Self {
        match err {
            ConsensusError::NotLeader { leader } => ClusterError::NotLeader {
                leader_address: leader.as_ref().map(|l| l.address.clone()),
                leader_id: leader.map(|l| l.id),
            },
            other => ClusterError::Membership(other.to_string()),
        }
    }
}

impl From<FsmError> for ClusterError {
    fn from(err: FsmError) -> Self {
        match err {
            FsmError::Handler { .. } | FsmError::NoHandler(_) | FsmError::Decode(_) => {
                ClusterError::HandlerFailed(err.to_string())
            }
            other => ClusterError::Fsm(other),
        }
    }
}
