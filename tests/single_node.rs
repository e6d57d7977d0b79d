//! End-to-end tests against a real openraft node on loopback.

use std::net::TcpListener;
use std::sync::Arc;
use std::time::Duration;

use sylve::cluster::domains::notes;
use sylve::cluster::fsm::FsmDispatcher;
use sylve::cluster::raft::RaftLauncher;
use sylve::cluster::{ClusterService, ClusterSettings, NodeIdentity, WriteRoute};
use sylve::config::RaftConfig;
use sylve::db::Database;
use tempfile::TempDir;

const NODE_ID: &str = "5f0c1c8e-7d4f-4a55-9a47-000000000001";

fn free_port() -> u16 {
    TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

fn service(dir: &TempDir) -> Arc<ClusterService> {
    let db_path = dir.path().join("sylve.db");
    let db = Arc::new(Database::open(db_path.to_str().unwrap()).unwrap());
    let raft = RaftConfig {
        data_dir: dir.path().join("raft"),
        ..RaftConfig::default()
    };
    let settings = ClusterSettings {
        raft_dir: raft.data_dir.clone(),
        api_port: 8181,
        api_scheme: "http".to_string(),
        apply_timeout: Duration::from_secs(5),
        leader_wait: Duration::from_secs(10),
        resolve_hostnames: false,
        validate_s3_targets: false,
        probe_timeout: Duration::from_secs(2),
    };
    let dispatcher = Arc::new(FsmDispatcher::with_default_handlers(db.clone()));
    let launcher = Arc::new(RaftLauncher::new(dispatcher.clone(), raft));
    let identity = NodeIdentity {
        node_id: NODE_ID.to_string(),
        hostname: "sylve-test".to_string(),
    };
    Arc::new(ClusterService::new(db, dispatcher, launcher, identity, settings).unwrap())
}

fn titles(service: &ClusterService) -> Vec<String> {
    service
        .dispatcher()
        .read(|conn| Ok(notes::list(conn)?.into_iter().map(|n| n.title).collect()))
        .unwrap()
}

async fn wait_until_leader(service: &ClusterService) {
    for _ in 0..100 {
        if matches!(service.write_route(), WriteRoute::Replicate(_)) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    panic!("node never became leader");
}

#[tokio::test]
async fn test_bootstrap_replicates_and_survives_restart() {
    let dir = TempDir::new().unwrap();
    let port = free_port();

    let node = service(&dir);
    node.propose_note_create("before", "standalone row", true)
        .await
        .unwrap();
    let record = node.create_cluster("127.0.0.1", port).await.unwrap();
    assert!(record.enabled);
    assert!(!node.bypass());
    assert_eq!(titles(&node), vec!["before".to_string()]);

    node.propose_note_create("during", "replicated row", false)
        .await
        .unwrap();
    assert_eq!(titles(&node), vec!["before".to_string(), "during".to_string()]);

    let details = node.details();
    assert_eq!(details.nodes.len(), 1);
    assert!(details.nodes[0].is_leader);
    assert_eq!(details.leader_id.as_deref(), Some(NODE_ID));

    node.shutdown().await;
    drop(node);

    let restarted = service(&dir);
    assert!(restarted.cluster().enabled);
    restarted.init_raft().await.unwrap();
    wait_until_leader(&restarted).await;

    // Entries already applied before the restart are not applied twice.
    assert_eq!(
        titles(&restarted),
        vec!["before".to_string(), "during".to_string()]
    );

    restarted
        .propose_note_create("after", "post-restart row", false)
        .await
        .unwrap();
    assert_eq!(titles(&restarted).len(), 3);

    restarted.reset_raft_node(false).await.unwrap();
    assert!(restarted.bypass());
    assert!(restarted.consensus().is_none());
}

#[tokio::test]
async fn test_write_without_cluster_requires_bypass() {
    let dir = TempDir::new().unwrap();
    let node = service(&dir);
    let err = node
        .propose_note_create("nope", "no consensus", false)
        .await
        .unwrap_err();
    assert_eq!(err.code(), "raft_not_initialized");
}
