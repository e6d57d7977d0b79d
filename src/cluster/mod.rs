//! Cluster coordination and replication.
//!
//! A node starts standalone. Once it creates or joins a cluster, writes to
//! the replicated tables go through a Raft log and are applied on every
//! member by the [`fsm::FsmDispatcher`]; until then they are applied
//! locally through the same handlers.

pub mod command;
pub mod consensus;
pub mod detail;
pub mod domains;
pub mod error;
pub mod fsm;
pub mod lifecycle;
pub mod net;
pub mod proposer;
pub mod raft;
pub mod registry;
pub mod service;

#[cfg(test)]
pub(crate) mod mock;

pub use error::ClusterError;
pub use service::{ClusterService, ClusterSettings, NodeIdentity, WriteRoute};

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::consensus::RaftRole;
    use super::domains::notes;
    use super::lifecycle::JoinOutcome;
    use super::mock::{free_port, test_node, FailingLauncher, MockNetwork, TestNode};
    use super::*;
    use crate::db::models::NodeStatus;

    const API_PORT: u16 = 8181;

    fn node(name: &str, net: &MockNetwork) -> TestNode {
        test_node(name, API_PORT, |d| Arc::new(net.launcher(d)))
    }

    fn note_titles(service: &ClusterService) -> Vec<(i64, String, String)> {
        service
            .dispatcher()
            .read(|conn| {
                Ok(notes::list(conn)?
                    .into_iter()
                    .map(|n| (n.id, n.title, n.created_at))
                    .collect())
            })
            .unwrap()
    }

    /// A two-node cluster: `a` leads, `b` joined.
    async fn pair(net: &MockNetwork) -> (TestNode, TestNode) {
        let a = node("aaaaaaaa", net);
        let b = node("bbbbbbbb", net);
        let record = a.service.create_cluster("127.0.0.1", free_port()).await.unwrap();
        let b_port = free_port();
        b.service
            .start_as_joiner("127.0.0.1", b_port, &record.key)
            .await
            .unwrap();
        let outcome = a
            .service
            .accept_join(b.service.node_id(), "127.0.0.1", b_port, &record.key)
            .await
            .unwrap();
        assert_eq!(outcome, JoinOutcome::Added);
        (a, b)
    }

    #[tokio::test]
    async fn test_standalone_writes_bypass_consensus() {
        let net = MockNetwork::new();
        let a = node("aaaaaaaa", &net);
        assert!(a.service.bypass());
        assert!(matches!(a.service.write_route(), WriteRoute::Local));

        a.service.propose_note_create("first", "body", true).await.unwrap();
        assert_eq!(note_titles(&a.service).len(), 1);
        assert_eq!(net.log_len(), 0);

        let err = a.service.propose_note_create("x", "y", false).await.unwrap_err();
        assert!(matches!(err, ClusterError::NotInitialized));
    }

    #[tokio::test]
    async fn test_create_cluster_backfills_existing_rows() {
        let net = MockNetwork::new();
        let a = node("aaaaaaaa", &net);
        a.service.propose_note_create("old-1", "body", true).await.unwrap();
        a.service.propose_note_create("old-2", "body", true).await.unwrap();
        a.service.propose_option_set("us", true).await.unwrap();
        let before = note_titles(&a.service);

        let record = a.service.create_cluster("127.0.0.1", free_port()).await.unwrap();
        assert!(record.enabled);
        assert_eq!(record.raft_bootstrap, Some(true));
        assert_eq!(record.key.len(), 32);
        assert_eq!(net.log_len(), 3);
        assert_eq!(note_titles(&a.service), before);
        assert_eq!(a.service.consensus().unwrap().role(), RaftRole::Leader);

        let cached = a.service.nodes().unwrap();
        assert_eq!(cached.len(), 1);
        assert_eq!(cached[0].api, format!("127.0.0.1:{API_PORT}"));
    }

    #[tokio::test]
    async fn test_second_create_is_rejected() {
        let net = MockNetwork::new();
        let a = node("aaaaaaaa", &net);
        a.service.create_cluster("127.0.0.1", free_port()).await.unwrap();
        let err = a
            .service
            .create_cluster("127.0.0.1", free_port())
            .await
            .unwrap_err();
        assert_eq!(err.code(), "raft_already_initialized");
    }

    #[tokio::test]
    async fn test_create_rejects_leftover_raft_state() {
        let net = MockNetwork::new();
        let a = node("aaaaaaaa", &net);
        let dir = &a.service.settings().raft_dir;
        std::fs::create_dir_all(dir).unwrap();
        std::fs::write(dir.join(net::LOG_DB), b"stale").unwrap();

        let err = a
            .service
            .create_cluster("127.0.0.1", free_port())
            .await
            .unwrap_err();
        assert_eq!(err.code(), "raft_state_already_exists");
        assert!(a.service.bypass());
    }

    #[tokio::test]
    async fn test_create_validates_address() {
        let net = MockNetwork::new();
        let a = node("aaaaaaaa", &net);
        let err = a.service.create_cluster("not-an-ip", 9000).await.unwrap_err();
        assert_eq!(err.code(), "invalid_ip_address");
        let err = a.service.create_cluster("127.0.0.1", 80).await.unwrap_err();
        assert_eq!(err.code(), "invalid_port_number");
    }

    #[tokio::test]
    async fn test_create_without_leader_keeps_the_cluster() {
        let net = MockNetwork::new();
        net.withhold_leadership(true);
        let a = node("aaaaaaaa", &net);
        a.service.propose_note_create("old-1", "body", true).await.unwrap();

        let record = a.service.create_cluster("127.0.0.1", free_port()).await.unwrap();
        assert!(record.enabled);
        assert!(a.service.cluster().enabled);
        assert!(a.service.consensus().is_some());
        assert_eq!(net.log_len(), 0);
        assert!(matches!(a.service.write_route(), WriteRoute::LeaderUnknown));
    }

    #[tokio::test]
    async fn test_accept_join_refuses_the_leader_address() {
        let net = MockNetwork::new();
        let a = node("aaaaaaaa", &net);
        let record = a.service.create_cluster("127.0.0.1", free_port()).await.unwrap();

        let err = a
            .service
            .accept_join("cccccccc", &record.bind_ip, record.bind_port, &record.key)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "port_unavailable");
        assert_eq!(net.voters(), vec![a.service.node_id().to_string()]);
        assert_eq!(a.service.consensus().unwrap().role(), RaftRole::Leader);
    }

    #[tokio::test]
    async fn test_join_is_idempotent_and_replicates() {
        let net = MockNetwork::new();
        let (a, b) = pair(&net).await;
        let key = a.service.cluster().key;

        let b_addr = b.service.cluster().bind_address();
        let (ip, port) = b_addr.rsplit_once(':').unwrap();
        let again = a
            .service
            .accept_join(b.service.node_id(), ip, port.parse().unwrap(), &key)
            .await
            .unwrap();
        assert_eq!(again, JoinOutcome::AlreadyMember);
        assert_eq!(net.voters().len(), 2);

        a.service.propose_note_create("one", "body", false).await.unwrap();
        a.service.propose_note_create("two", "body", false).await.unwrap();
        let leader_rows = note_titles(&a.service);
        assert_eq!(leader_rows.len(), 2);
        assert_eq!(note_titles(&b.service), leader_rows);

        assert_eq!(b.service.consensus().unwrap().role(), RaftRole::Follower);
        match b.service.write_route() {
            WriteRoute::Forward { api } => assert_eq!(api, format!("127.0.0.1:{API_PORT}")),
            _ => panic!("follower should forward writes"),
        }
    }

    #[tokio::test]
    async fn test_accept_join_checks_key_and_leadership() {
        let net = MockNetwork::new();
        let (a, b) = pair(&net).await;
        let key = a.service.cluster().key;

        let err = a
            .service
            .accept_join("cccccccc", "127.0.0.1", free_port(), "wrong-key")
            .await
            .unwrap_err();
        assert_eq!(err.code(), "invalid_cluster_key");

        let err = b
            .service
            .accept_join("cccccccc", "127.0.0.1", free_port(), &key)
            .await
            .unwrap_err();
        match err {
            ClusterError::NotLeader { leader_id, .. } => {
                assert_eq!(leader_id.as_deref(), Some(a.service.node_id()))
            }
            other => panic!("expected not_leader, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_joiner_rolls_back_when_consensus_fails() {
        let b = test_node("bbbbbbbb", API_PORT, |_| Arc::new(FailingLauncher));
        let err = b
            .service
            .start_as_joiner("127.0.0.1", free_port(), "some-key")
            .await
            .unwrap_err();
        assert_eq!(err.code(), "raft_start_failed");
        assert!(b.service.bypass());
        assert!(b.service.consensus().is_none());
        assert_eq!(b.service.cluster().raft_bootstrap, None);
    }

    #[tokio::test]
    async fn test_joiner_rejects_empty_key() {
        let net = MockNetwork::new();
        let b = node("bbbbbbbb", &net);
        let err = b
            .service
            .start_as_joiner("127.0.0.1", free_port(), "  ")
            .await
            .unwrap_err();
        assert_eq!(err.code(), "invalid_cluster_key");
    }

    #[tokio::test]
    async fn test_details_are_partial_without_configuration() {
        let net = MockNetwork::new();
        let (a, _b) = pair(&net).await;

        let details = a.service.details();
        assert!(!details.partial);
        assert_eq!(details.nodes.len(), 2);
        assert_eq!(details.nodes.iter().filter(|n| n.is_leader).count(), 1);

        net.fail_configuration(true);
        let details = a.service.details();
        assert!(details.partial);
        assert!(details.nodes.is_empty());
        assert!(details.cluster.enabled);
    }

    #[tokio::test]
    async fn test_populate_marks_removed_nodes_offline() {
        let net = MockNetwork::new();
        let (a, b) = pair(&net).await;
        a.service.populate_cluster_nodes().await.unwrap();
        assert!(a
            .service
            .nodes()
            .unwrap()
            .iter()
            .all(|n| n.status == NodeStatus::Online));

        let consensus = a.service.consensus().unwrap();
        consensus
            .remove_server(b.service.node_id(), Duration::from_secs(1))
            .await
            .unwrap();
        a.service.populate_cluster_nodes().await.unwrap();

        let nodes = a.service.nodes().unwrap();
        let gone = nodes
            .iter()
            .find(|n| n.node_uuid == b.service.node_id())
            .unwrap();
        assert_eq!(gone.status, NodeStatus::Offline);
    }

    #[tokio::test]
    async fn test_leader_reset_requires_force() {
        let net = MockNetwork::new();
        let (a, b) = pair(&net).await;

        let err = a.service.reset_raft_node(false).await.unwrap_err();
        assert_eq!(err.code(), "leader_reset_unsafe");
        assert!(!a.service.bypass());

        a.service.reset_raft_node(true).await.unwrap();
        assert!(a.service.bypass());
        assert!(a.service.consensus().is_none());
        assert_eq!(net.voters(), vec![b.service.node_id().to_string()]);
        assert_eq!(b.service.consensus().unwrap().role(), RaftRole::Leader);
    }

    #[tokio::test]
    async fn test_follower_reset_returns_to_standalone() {
        let net = MockNetwork::new();
        let (_a, b) = pair(&net).await;
        b.service.reset_raft_node(false).await.unwrap();
        assert!(b.service.bypass());
        assert!(!net::raft_state_exists(&b.service.settings().raft_dir));

        b.service.propose_note_create("local", "body", true).await.unwrap();
        assert_eq!(note_titles(&b.service).len(), 1);
    }
}
