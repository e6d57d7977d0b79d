//! Sylve cluster control plane.
//!
//! A node runs standalone until it creates or joins a cluster.  Clustered
//! nodes replicate a small set of relational tables (notes, options, S3
//! backup targets) through a Raft log; every member applies the same
//! commands in the same order through a registry of domain handlers.

use std::sync::Arc;

pub mod cluster;
pub mod config;
pub mod db;
pub mod errors;
pub mod handlers;
pub mod metrics;
pub mod server;
pub mod storage;

use crate::cluster::ClusterService;
use crate::config::Config;

/// Shared application state passed to all handlers via `axum::extract::State`.
pub struct AppState {
    pub config: Config,
    /// Lifecycle manager, proposers and topology queries.
    pub cluster: Arc<ClusterService>,
}
