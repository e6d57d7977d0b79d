//! Raft consensus core built on openraft.
//!
//! Entries are replicated over JSON/HTTP between the nodes' cluster bind
//! addresses and applied through the shared [`FsmDispatcher`].
//!
//! [`FsmDispatcher`]: crate::cluster::fsm::FsmDispatcher

pub mod log_store;
pub mod network;
pub mod node;
pub mod rpc;
pub mod state_machine;
pub mod types;

pub use node::{RaftLauncher, RaftNode};
pub use types::{raft_node_id, NodeId, PeerNode, TypeConfig};
