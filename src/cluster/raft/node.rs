//! [`Consensus`] implementation backed by openraft.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use openraft::error::{ClientWriteError, InitializeError, RaftError};
use openraft::{ChangeMembers, Config, Raft, RaftMetrics, ServerState, SnapshotPolicy};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::log_store::SqliteLogStore;
use super::network::HttpNetwork;
use super::rpc;
use super::state_machine::StateMachineStore;
use super::types::{raft_node_id, NodeId, PeerNode, SylveRaft};
use crate::cluster::consensus::{
    Consensus, ConsensusError, ConsensusFuture, ConsensusLauncher, LaunchOptions, LeaderInfo,
    RaftRole, ServerInfo, Suffrage,
};
use crate::cluster::fsm::{ApplyOutcome, FsmDispatcher};
use crate::cluster::net::join_host_port;
use crate::config::RaftConfig;

type WriteError = RaftError<NodeId, ClientWriteError<NodeId, PeerNode>>;

pub struct RaftNode {
    node_id: NodeId,
    raft: SylveRaft,
    rpc_shutdown: Mutex<Option<oneshot::Sender<()>>>,
    rpc_task: Mutex<Option<JoinHandle<()>>>,
}

impl RaftNode {
    /// Open the stores, start the RPC listener and the Raft core.
    pub async fn start(
        opts: LaunchOptions,
        dispatcher: Arc<FsmDispatcher>,
        settings: &RaftConfig,
    ) -> Result<Arc<Self>, ConsensusError> {
        let node_id = raft_node_id(&opts.node_id);
        let addr = join_host_port(&opts.bind_ip, opts.bind_port);

        let config = Config {
            cluster_name: "sylve".to_string(),
            heartbeat_interval: settings.heartbeat_interval_ms,
            election_timeout_min: settings.election_timeout_min_ms,
            election_timeout_max: settings.election_timeout_max_ms,
            snapshot_policy: SnapshotPolicy::LogsSinceLast(settings.snapshot_threshold),
            ..Default::default()
        }
        .validate()
        .map_err(startup)?;

        let log_store = SqliteLogStore::open(&opts.data_dir).map_err(startup)?;
        let state_machine = StateMachineStore::new(dispatcher, &opts.data_dir).map_err(startup)?;
        let network = HttpNetwork::new(settings.rpc_timeout()).map_err(startup)?;

        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .map_err(startup)?;

        let raft = Raft::new(node_id, Arc::new(config), network, log_store, state_machine)
            .await
            .map_err(startup)?;

        let (tx, rx) = oneshot::channel::<()>();
        let app = rpc::router(raft.clone());
        let task = tokio::spawn(async move {
            let serve = axum::serve(listener, app).with_graceful_shutdown(async {
                let _ = rx.await;
            });
            if let Err(e) = serve.await {
                warn!(error = %e, "raft rpc server stopped");
            }
        });

        let node = Arc::new(Self {
            node_id,
            raft,
            rpc_shutdown: Mutex::new(Some(tx)),
            rpc_task: Mutex::new(Some(task)),
        });

        if opts.bootstrap {
            let mut members = BTreeMap::new();
            members.insert(
                node_id,
                PeerNode {
                    node_id: opts.node_id.clone(),
                    addr: addr.clone(),
                },
            );
            match node.raft.initialize(members).await {
                Ok(()) => info!(raft_id = node_id, %addr, "cluster bootstrapped"),
                Err(RaftError::APIError(InitializeError::NotAllowed(_))) => {
                    debug!("raft already initialized; skipping bootstrap")
                }
                Err(e) => {
                    let err = ConsensusError::Startup(e.to_string());
                    node.stop().await;
                    return Err(err);
                }
            }
        }

        info!(raft_id = node_id, %addr, bootstrap = opts.bootstrap, "raft node started");
        Ok(node)
    }

    fn metrics(&self) -> RaftMetrics<NodeId, PeerNode> {
        self.raft.metrics().borrow().clone()
    }

    fn peer(&self, id: NodeId) -> Option<PeerNode> {
        let metrics = self.metrics();
        let found = metrics
            .membership_config
            .membership()
            .nodes()
            .find(|(nid, _)| **nid == id)
            .map(|(_, node)| node.clone());
        found
    }

    async fn stop(&self) {
        if let Some(tx) = self.rpc_shutdown.lock().expect("mutex poisoned").take() {
            let _ = tx.send(());
        }
        if let Err(e) = self.raft.shutdown().await {
            warn!(error = %e, "raft shutdown reported an error");
        }
        let task = self.rpc_task.lock().expect("mutex poisoned").take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }

    fn write_error(&self, err: WriteError) -> ConsensusError {
        match err {
            RaftError::APIError(ClientWriteError::ForwardToLeader(fwd)) => {
                ConsensusError::NotLeader {
                    leader: fwd.leader_node.map(|n| LeaderInfo {
                        id: n.node_id,
                        address: n.addr,
                    }),
                }
            }
            RaftError::APIError(other) => ConsensusError::Commit(other.to_string()),
            RaftError::Fatal(fatal) => ConsensusError::Fatal(fatal.to_string()),
        }
    }

    async fn with_timeout<T>(
        &self,
        timeout: Duration,
        fut: impl std::future::Future<Output = Result<T, ConsensusError>>,
    ) -> Result<T, ConsensusError> {
        match tokio::time::timeout(timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(ConsensusError::Timeout(timeout)),
        }
    }
}

impl Consensus for RaftNode {
    fn apply(&self, command: Vec<u8>, timeout: Duration) -> ConsensusFuture<'_, ApplyOutcome> {
        Box::pin(self.with_timeout(timeout, async move {
            match self.raft.client_write(command).await {
                Ok(resp) => Ok(resp.data),
                Err(e) => Err(self.write_error(e)),
            }
        }))
    }

    fn add_voter(&self, id: &str, address: &str, timeout: Duration) -> ConsensusFuture<'_, ()> {
        let uuid = id.to_string();
        let addr = address.to_string();
        Box::pin(self.with_timeout(timeout, async move {
            let nid = raft_node_id(&uuid);
            let node = PeerNode {
                node_id: uuid.clone(),
                addr: addr.clone(),
            };
            self.raft
                .add_learner(nid, node, true)
                .await
                .map_err(|e| self.write_error(e))?;
            self.raft
                .change_membership(ChangeMembers::AddVoterIds(BTreeSet::from([nid])), false)
                .await
                .map_err(|e| self.write_error(e))?;
            info!(node = %uuid, %addr, "voter added");
            Ok(())
        }))
    }

    fn remove_server(&self, id: &str, timeout: Duration) -> ConsensusFuture<'_, ()> {
        let uuid = id.to_string();
        Box::pin(self.with_timeout(timeout, async move {
            let nid = raft_node_id(&uuid);
            let is_voter = self
                .metrics()
                .membership_config
                .membership()
                .voter_ids()
                .any(|v| v == nid);
            let change = if is_voter {
                ChangeMembers::RemoveVoters(BTreeSet::from([nid]))
            } else {
                ChangeMembers::RemoveNodes(BTreeSet::from([nid]))
            };
            self.raft
                .change_membership(change, false)
                .await
                .map_err(|e| self.write_error(e))?;
            info!(node = %uuid, "server removed");
            Ok(())
        }))
    }

    fn configuration(&self) -> Result<Vec<ServerInfo>, ConsensusError> {
        let metrics = self.metrics();
        if metrics.state == ServerState::Shutdown {
            return Err(ConsensusError::ConfigurationUnavailable(
                "raft is shut down".to_string(),
            ));
        }
        let membership = metrics.membership_config.membership();
        let voters: BTreeSet<NodeId> = membership.voter_ids().collect();
        Ok(membership
            .nodes()
            .map(|(nid, node)| ServerInfo {
                id: node.node_id.clone(),
                address: node.addr.clone(),
                suffrage: if voters.contains(nid) {
                    Suffrage::Voter
                } else {
                    Suffrage::Nonvoter
                },
            })
            .collect())
    }

    fn leader(&self) -> Option<LeaderInfo> {
        let leader = self.metrics().current_leader?;
        self.peer(leader).map(|node| LeaderInfo {
            id: node.node_id,
            address: node.addr,
        })
    }

    fn role(&self) -> RaftRole {
        match self.metrics().state {
            ServerState::Leader => RaftRole::Leader,
            ServerState::Follower => RaftRole::Follower,
            ServerState::Candidate => RaftRole::Candidate,
            ServerState::Learner => RaftRole::Learner,
            ServerState::Shutdown => RaftRole::Shutdown,
        }
    }

    fn trigger_snapshot(&self) -> ConsensusFuture<'_, ()> {
        Box::pin(async move {
            self.raft
                .trigger()
                .snapshot()
                .await
                .map_err(|e| ConsensusError::Fatal(e.to_string()))
        })
    }

    fn shutdown(&self) -> ConsensusFuture<'_, ()> {
        Box::pin(async move {
            self.stop().await;
            info!(raft_id = self.node_id, "raft node stopped");
            Ok(())
        })
    }
}

/// Launches [`RaftNode`]s that apply entries through `dispatcher`.
pub struct RaftLauncher {
    dispatcher: Arc<FsmDispatcher>,
    config: RaftConfig,
}

impl RaftLauncher {
    pub fn new(dispatcher: Arc<FsmDispatcher>, config: RaftConfig) -> Self {
        Self { dispatcher, config }
    }
}

impl ConsensusLauncher for RaftLauncher {
    fn launch(&self, opts: LaunchOptions) -> ConsensusFuture<'_, Arc<dyn Consensus>> {
        Box::pin(async move {
            let node = RaftNode::start(opts, self.dispatcher.clone(), &self.config).await?;
            Ok(node as Arc<dyn Consensus>)
        })
    }
}

fn startup(e: impl std::fmt::Display) -> ConsensusError {
    ConsensusError::Startup(e.to_string())
}
