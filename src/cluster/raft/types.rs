//! openraft type configuration.

use std::fmt;
use std::io::Cursor;

use openraft::{Entry, RaftTypeConfig};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::cluster::fsm::ApplyOutcome;

pub type NodeId = u64;

#[derive(Debug, Clone, Copy, Default, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
pub struct TypeConfig;

impl RaftTypeConfig for TypeConfig {
    /// Encoded [`Command`](crate::cluster::command::Command) envelope.
    type D = Vec<u8>;
    type R = ApplyOutcome;
    type NodeId = NodeId;
    type Node = PeerNode;
    type Entry = Entry<Self>;
    type SnapshotData = Cursor<Vec<u8>>;
    type AsyncRuntime = openraft::TokioRuntime;
    type Responder = openraft::impls::OneshotResponder<Self>;
}

pub type SylveRaft = openraft::Raft<TypeConfig>;
pub type LogId = openraft::LogId<NodeId>;
pub type Vote = openraft::Vote<NodeId>;
pub type StoredMembership = openraft::StoredMembership<NodeId, PeerNode>;
pub type SnapshotMeta = openraft::SnapshotMeta<NodeId, PeerNode>;
pub type StorageError = openraft::StorageError<NodeId>;

/// Membership metadata for one peer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerNode {
    /// Node UUID as shown in the API.
    pub node_id: String,
    /// Raft bind address (`ip:port`).
    pub addr: String,
}

impl fmt::Display for PeerNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.node_id, self.addr)
    }
}

/// Numeric Raft id for a node UUID: the first 8 bytes of its SHA-256.
pub fn raft_node_id(node_uuid: &str) -> NodeId {
    let digest = Sha256::digest(node_uuid.as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(bytes)
}

/// Wrap any error as `std::io::Error` so it fits `StorageIOError`.
pub(crate) fn io_err(e: impl fmt::Display) -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::Other, e.to_string())
}
