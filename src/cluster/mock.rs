//! In-process consensus double for multi-node tests.
//!
//! A [`MockNetwork`] holds one shared log.  Every node launched through a
//! [`MockLauncher`] on that network applies committed entries to its own
//! dispatcher, in log order, as soon as the leader appends them.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tempfile::TempDir;

use super::consensus::{
    Consensus, ConsensusError, ConsensusFuture, ConsensusLauncher, LaunchOptions, LeaderInfo,
    RaftRole, ServerInfo, Suffrage,
};
use super::fsm::{ApplyOutcome, EntryKind, FsmDispatcher};
use super::net::join_host_port;
use super::service::{ClusterService, ClusterSettings, NodeIdentity};
use crate::db::Database;

struct Member {
    dispatcher: Arc<FsmDispatcher>,
    address: String,
    running: bool,
    /// Log entries this member has applied.
    applied: usize,
}

#[derive(Default)]
struct Shared {
    members: HashMap<String, Member>,
    voters: Vec<String>,
    leader: Option<String>,
    log: Vec<Vec<u8>>,
    fail_configuration: bool,
    /// Bootstrapped nodes never win an election.
    no_election: bool,
}

impl Shared {
    fn catch_up(&mut self, id: &str) -> Option<ApplyOutcome> {
        let log = &self.log;
        let member = self.members.get_mut(id)?;
        let mut last = None;
        while member.applied < log.len() {
            let outcome = member
                .dispatcher
                .apply(EntryKind::Command(&log[member.applied]), None)
                .unwrap_or_else(|e| ApplyOutcome {
                    error: Some(e.to_string()),
                });
            member.applied += 1;
            last = Some(outcome);
        }
        last
    }

    fn leader_info(&self) -> Option<LeaderInfo> {
        let id = self.leader.as_ref()?;
        self.members.get(id).map(|m| LeaderInfo {
            id: id.clone(),
            address: m.address.clone(),
        })
    }
}

#[derive(Clone, Default)]
pub struct MockNetwork {
    shared: Arc<Mutex<Shared>>,
}

impl MockNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn launcher(&self, dispatcher: Arc<FsmDispatcher>) -> MockLauncher {
        MockLauncher {
            network: self.clone(),
            dispatcher,
        }
    }

    /// Make every `configuration()` call fail.
    pub fn fail_configuration(&self, fail: bool) {
        self.shared.lock().unwrap().fail_configuration = fail;
    }

    /// Leave bootstrapped nodes without a leader.
    pub fn withhold_leadership(&self, withhold: bool) {
        self.shared.lock().unwrap().no_election = withhold;
    }

    pub fn log_len(&self) -> usize {
        self.shared.lock().unwrap().log.len()
    }

    pub fn voters(&self) -> Vec<String> {
        self.shared.lock().unwrap().voters.clone()
    }
}

pub struct MockLauncher {
    network: MockNetwork,
    dispatcher: Arc<FsmDispatcher>,
}

impl ConsensusLauncher for MockLauncher {
    fn launch(&self, opts: LaunchOptions) -> ConsensusFuture<'_, Arc<dyn Consensus>> {
        let mut shared = self.network.shared.lock().unwrap();
        shared.members.insert(
            opts.node_id.clone(),
            Member {
                dispatcher: self.dispatcher.clone(),
                address: join_host_port(&opts.bind_ip, opts.bind_port),
                running: true,
                applied: 0,
            },
        );
        if opts.bootstrap {
            shared.voters = vec![opts.node_id.clone()];
            if !shared.no_election {
                shared.leader = Some(opts.node_id.clone());
            }
        }
        drop(shared);

        let node: Arc<dyn Consensus> = Arc::new(MockConsensus {
            id: opts.node_id,
            network: self.network.clone(),
        });
        Box::pin(std::future::ready(Ok(node)))
    }
}

/// A launcher whose nodes never start.
pub struct FailingLauncher;

impl ConsensusLauncher for FailingLauncher {
    fn launch(&self, _opts: LaunchOptions) -> ConsensusFuture<'_, Arc<dyn Consensus>> {
        Box::pin(std::future::ready(Err(ConsensusError::Startup(
            "transport refused".to_string(),
        ))))
    }
}

pub struct MockConsensus {
    id: String,
    network: MockNetwork,
}

impl MockConsensus {
    fn not_leader(&self, shared: &Shared) -> Option<ConsensusError> {
        if shared.leader.as_deref() == Some(self.id.as_str()) {
            None
        } else {
            Some(ConsensusError::NotLeader {
                leader: shared.leader_info(),
            })
        }
    }
}

impl Consensus for MockConsensus {
    fn apply(&self, command: Vec<u8>, _timeout: Duration) -> ConsensusFuture<'_, ApplyOutcome> {
        let mut shared = self.network.shared.lock().unwrap();
        if let Some(err) = self.not_leader(&shared) {
            return Box::pin(std::future::ready(Err(err)));
        }
        shared.log.push(command);

        let followers: Vec<String> = shared
            .voters
            .iter()
            .filter(|v| **v != self.id)
            .filter(|v| shared.members.get(*v).map_or(false, |m| m.running))
            .cloned()
            .collect();
        for id in followers {
            shared.catch_up(&id);
        }
        let outcome = shared.catch_up(&self.id).unwrap_or_default();
        Box::pin(std::future::ready(Ok(outcome)))
    }

    fn add_voter(&self, id: &str, address: &str, _timeout: Duration) -> ConsensusFuture<'_, ()> {
        let mut shared = self.network.shared.lock().unwrap();
        if let Some(err) = self.not_leader(&shared) {
            return Box::pin(std::future::ready(Err(err)));
        }
        let Some(member) = shared.members.get_mut(id) else {
            return Box::pin(std::future::ready(Err(ConsensusError::Commit(format!(
                "unknown peer {id}"
            )))));
        };
        member.address = address.to_string();
        if !shared.voters.iter().any(|v| v == id) {
            shared.voters.push(id.to_string());
        }
        shared.catch_up(id);
        Box::pin(std::future::ready(Ok(())))
    }

    fn remove_server(&self, id: &str, _timeout: Duration) -> ConsensusFuture<'_, ()> {
        let mut shared = self.network.shared.lock().unwrap();
        if let Some(err) = self.not_leader(&shared) {
            return Box::pin(std::future::ready(Err(err)));
        }
        shared.voters.retain(|v| v != id);
        if shared.leader.as_deref() == Some(id) {
            shared.leader = shared.voters.first().cloned();
        }
        Box::pin(std::future::ready(Ok(())))
    }

    fn configuration(&self) -> Result<Vec<ServerInfo>, ConsensusError> {
        let shared = self.network.shared.lock().unwrap();
        if shared.fail_configuration {
            return Err(ConsensusError::ConfigurationUnavailable(
                "injected failure".to_string(),
            ));
        }
        Ok(shared
            .voters
            .iter()
            .filter_map(|id| {
                shared.members.get(id).map(|m| ServerInfo {
                    id: id.clone(),
                    address: m.address.clone(),
                    suffrage: Suffrage::Voter,
                })
            })
            .collect())
    }

    fn leader(&self) -> Option<LeaderInfo> {
        self.network.shared.lock().unwrap().leader_info()
    }

    fn role(&self) -> RaftRole {
        let shared = self.network.shared.lock().unwrap();
        match shared.members.get(&self.id) {
            Some(m) if !m.running => RaftRole::Shutdown,
            None => RaftRole::Shutdown,
            Some(_) if shared.leader.as_deref() == Some(self.id.as_str()) => RaftRole::Leader,
            Some(_) if shared.voters.contains(&self.id) => RaftRole::Follower,
            Some(_) => RaftRole::Learner,
        }
    }

    fn trigger_snapshot(&self) -> ConsensusFuture<'_, ()> {
        Box::pin(std::future::ready(Ok(())))
    }

    fn shutdown(&self) -> ConsensusFuture<'_, ()> {
        let mut shared = self.network.shared.lock().unwrap();
        if let Some(member) = shared.members.get_mut(&self.id) {
            member.running = false;
        }
        if shared.leader.as_deref() == Some(self.id.as_str()) {
            shared.leader = None;
        }
        Box::pin(std::future::ready(Ok(())))
    }
}

/// A [`ClusterService`] over an in-memory database and a temporary raft dir.
pub struct TestNode {
    pub service: Arc<ClusterService>,
    _dir: TempDir,
}

pub fn test_settings(dir: &TempDir, api_port: u16) -> ClusterSettings {
    ClusterSettings {
        raft_dir: dir.path().join("raft"),
        api_port,
        api_scheme: "http".to_string(),
        apply_timeout: Duration::from_secs(2),
        leader_wait: Duration::from_secs(2),
        resolve_hostnames: false,
        validate_s3_targets: false,
        probe_timeout: Duration::from_secs(2),
    }
}

/// Build a node named `name` whose consensus comes from `launcher`.
pub fn test_node(
    name: &str,
    api_port: u16,
    launcher: impl FnOnce(Arc<FsmDispatcher>) -> Arc<dyn ConsensusLauncher>,
) -> TestNode {
    let dir = tempfile::tempdir().unwrap();
    let db = Arc::new(Database::open(":memory:").unwrap());
    let dispatcher = Arc::new(FsmDispatcher::with_default_handlers(db.clone()));
    let identity = NodeIdentity {
        node_id: format!("{name}-0000-4000-8000-000000000000"),
        hostname: name.to_string(),
    };
    let service = ClusterService::new(
        db,
        dispatcher.clone(),
        launcher(dispatcher),
        identity,
        test_settings(&dir, api_port),
    )
    .unwrap();
    TestNode {
        service: Arc::new(service),
        _dir: dir,
    }
}

/// A TCP port that was free a moment ago.
pub fn free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}
