//! Axum router construction.
//!
//! The [`app`] function wires every API endpoint to its handler and
//! returns a ready-to-serve [`axum::Router`].  Replicated write endpoints
//! sit behind the leader-forwarding layer; lifecycle endpoints always act
//! on the receiving node.

use std::sync::Arc;

use axum::{
    middleware,
    response::IntoResponse,
    routing::{delete, get, post, put},
    Json, Router,
};
use tower_http::trace::TraceLayer;
use utoipa::OpenApi;

use crate::handlers::{cluster, forward, health, notes, options, storage};
use crate::metrics::{metrics_handler, metrics_middleware};
use crate::AppState;

// -- OpenAPI specification ----------------------------------------------------

#[derive(OpenApi)]
#[openapi(
    info(
        title = "Sylve Cluster API",
        version = "0.1.0",
        description = "Cluster lifecycle and replicated configuration"
    ),
    paths(
        health::basic_health,
        cluster::get_cluster,
        cluster::create_cluster,
        cluster::join_cluster,
        cluster::accept_join,
        cluster::reset_node,
        cluster::list_nodes,
        notes::list_notes,
        notes::create_note,
        notes::update_note,
        notes::delete_note,
        notes::bulk_delete_notes,
        options::get_options,
        options::set_options,
        storage::list_s3_configs,
        storage::create_s3_config,
        storage::delete_s3_config,
    ),
    tags(
        (name = "Health", description = "Node identity"),
        (name = "Cluster", description = "Cluster lifecycle and topology"),
        (name = "Notes", description = "Replicated notes"),
        (name = "Options", description = "Replicated cluster options"),
        (name = "Storage", description = "Replicated S3 backup targets"),
    )
)]
struct ApiDoc;

async fn openapi_json() -> impl IntoResponse {
    Json(ApiDoc::openapi())
}

/// Build the axum [`Router`] with every API route.
pub fn app(state: Arc<AppState>) -> Router {
    let replicated = Router::new()
        .route("/api/info/notes", get(notes::list_notes).post(notes::create_note))
        .route("/api/info/notes/bulk-delete", post(notes::bulk_delete_notes))
        .route(
            "/api/info/notes/:id",
            put(notes::update_note).delete(notes::delete_note),
        )
        .route(
            "/api/cluster/options",
            get(options::get_options).put(options::set_options),
        )
        .route(
            "/api/cluster/storage/s3",
            get(storage::list_s3_configs).post(storage::create_s3_config),
        )
        .route("/api/cluster/storage/s3/:id", delete(storage::delete_s3_config))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            forward::forward_to_leader,
        ));

    let mut router = Router::new()
        .route("/api/health/basic", get(health::basic_health))
        .route(
            "/api/cluster",
            get(cluster::get_cluster).post(cluster::create_cluster),
        )
        .route("/api/cluster/join", post(cluster::join_cluster))
        .route("/api/cluster/accept-join", post(cluster::accept_join))
        .route("/api/cluster/reset-node", delete(cluster::reset_node))
        .route("/api/cluster/nodes", get(cluster::list_nodes))
        .merge(replicated)
        .route("/openapi.json", get(openapi_json));

    if state.config.observability.metrics {
        router = router.route("/metrics", get(metrics_handler));
    }

    // Layer ordering: the trace span wraps the handler, metrics wrap both.
    router
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(middleware::from_fn(metrics_middleware))
}

// -- Tests --------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::consensus::RaftRole;
    use crate::cluster::mock::{free_port, test_node, MockNetwork, TestNode};
    use crate::config::Config;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    fn state_for(node: &TestNode) -> Arc<AppState> {
        Arc::new(AppState {
            config: Config::default(),
            cluster: node.service.clone(),
        })
    }

    async fn send(app: Router, req: Request<Body>) -> (StatusCode, serde_json::Value) {
        let resp = app.oneshot(req).await.unwrap();
        let status = resp.status();
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap();
        let body = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
        (status, body)
    }

    fn json_req(method: &str, uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn get_req(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    /// Cluster leader `a` serving its API on the returned port.
    async fn served_leader(net: &MockNetwork) -> (TestNode, u16) {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let api_port = listener.local_addr().unwrap().port();

        let a = test_node("aaaaaaaa", api_port, |d| Arc::new(net.launcher(d)));
        a.service.create_cluster("127.0.0.1", free_port()).await.unwrap();

        let leader_app = app(state_for(&a));
        tokio::spawn(async move {
            axum::serve(listener, leader_app).await.unwrap();
        });
        (a, api_port)
    }

    /// Leader `a` serving its API on `api_port`, follower `b` joined to it.
    async fn served_pair(net: &MockNetwork) -> (TestNode, TestNode, u16) {
        let (a, api_port) = served_leader(net).await;
        let b = test_node("bbbbbbbb", api_port, |d| Arc::new(net.launcher(d)));
        let key = a.service.cluster().key;
        let b_port = free_port();
        b.service
            .start_as_joiner("127.0.0.1", b_port, &key)
            .await
            .unwrap();
        a.service
            .accept_join(b.service.node_id(), "127.0.0.1", b_port, &key)
            .await
            .unwrap();
        (a, b, api_port)
    }

    #[tokio::test]
    async fn test_basic_health() {
        let node = test_node("aaaaaaaa", 8181, |d| Arc::new(MockNetwork::new().launcher(d)));
        let (status, body) = send(app(state_for(&node)), get_req("/api/health/basic")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "success");
        assert_eq!(body["data"]["hostname"], "aaaaaaaa");
        assert_eq!(body["data"]["nodeId"], node.service.node_id());
        assert_eq!(body["data"]["clustered"], false);
    }

    #[tokio::test]
    async fn test_standalone_note_lifecycle() {
        let node = test_node("aaaaaaaa", 8181, |d| Arc::new(MockNetwork::new().launcher(d)));
        let router = app(state_for(&node));

        let (status, _) = send(
            router.clone(),
            json_req(
                "POST",
                "/api/info/notes",
                serde_json::json!({"title": "hello", "content": "world"}),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);

        let (status, _) = send(
            router.clone(),
            json_req(
                "PUT",
                "/api/info/notes/1",
                serde_json::json!({"title": "hello2", "content": "world2"}),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let (_, body) = send(router.clone(), get_req("/api/info/notes")).await;
        assert_eq!(body["data"][0]["id"], 1);
        assert_eq!(body["data"][0]["title"], "hello2");

        let (status, _) = send(
            router.clone(),
            Request::builder()
                .method("DELETE")
                .uri("/api/info/notes/1")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let (_, body) = send(router, get_req("/api/info/notes")).await;
        assert_eq!(body["data"], serde_json::json!([]));
    }

    #[tokio::test]
    async fn test_note_validation() {
        let node = test_node("aaaaaaaa", 8181, |d| Arc::new(MockNetwork::new().launcher(d)));
        let router = app(state_for(&node));

        let (status, body) = send(
            router.clone(),
            json_req(
                "POST",
                "/api/info/notes",
                serde_json::json!({"title": "hi", "content": "world"}),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "invalid_request");

        let (status, body) = send(
            router,
            json_req("POST", "/api/info/notes", serde_json::json!({"title": 5})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["status"], "error");
    }

    #[tokio::test]
    async fn test_s3_missing_field_code() {
        let node = test_node("aaaaaaaa", 8181, |d| Arc::new(MockNetwork::new().launcher(d)));
        let (status, body) = send(
            app(state_for(&node)),
            json_req(
                "POST",
                "/api/cluster/storage/s3",
                serde_json::json!({"name": "offsite", "endpoint": "http://minio:9000"}),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "s3_config_invalid");
        assert_eq!(body["message"], "region_is_required");
    }

    #[tokio::test]
    async fn test_create_cluster_rejects_low_port() {
        let node = test_node("aaaaaaaa", 8181, |d| Arc::new(MockNetwork::new().launcher(d)));
        let (status, _) = send(
            app(state_for(&node)),
            json_req(
                "POST",
                "/api/cluster",
                serde_json::json!({"ip": "127.0.0.1", "port": 80}),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(node.service.bypass());
    }

    #[tokio::test]
    async fn test_join_through_leader_api() {
        let net = MockNetwork::new();
        let (a, api_port) = served_leader(&net).await;
        let b = test_node("bbbbbbbb", api_port, |d| Arc::new(net.launcher(d)));
        let key = a.service.cluster().key;

        let (status, body) = send(
            app(state_for(&b)),
            json_req(
                "POST",
                "/api/cluster/join",
                serde_json::json!({
                    "nodeId": b.service.node_id(),
                    "nodeIp": "127.0.0.1",
                    "nodePort": free_port(),
                    "leaderApi": format!("127.0.0.1:{api_port}"),
                    "clusterKey": key,
                }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK, "body: {body}");
        assert_eq!(net.voters().len(), 2);
        assert_eq!(b.service.consensus().unwrap().role(), RaftRole::Follower);
        assert_eq!(b.service.cluster().key, key);

        let (_, details) = send(app(state_for(&a)), get_req("/api/cluster")).await;
        assert_eq!(details["data"]["nodes"].as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_join_rejected_by_leader_keeps_joiner_for_retry() {
        let net = MockNetwork::new();
        let (a, api_port) = served_leader(&net).await;
        let b = test_node("bbbbbbbb", api_port, |d| Arc::new(net.launcher(d)));
        let key = a.service.cluster().key;
        let leader_api = format!("127.0.0.1:{api_port}");
        let b_port = free_port();

        let err = b
            .service
            .join_cluster(&format!("127.0.0.1:{}", free_port()), "127.0.0.1", b_port, &key)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "leader_unreachable");
        assert!(b.service.bypass());

        let err = b
            .service
            .join_cluster(&leader_api, "127.0.0.1", b_port, "wrong-key")
            .await
            .unwrap_err();
        assert_eq!(err.code(), "raft_membership_failed");
        assert!(err.to_string().contains("invalid_cluster_key"), "{err}");
        assert!(!b.service.bypass());
        assert!(b.service.consensus().is_some());
        assert_eq!(net.voters().len(), 1);

        b.service
            .join_cluster(&leader_api, "127.0.0.1", b_port, &key)
            .await
            .unwrap();
        assert_eq!(net.voters().len(), 2);
        assert_eq!(b.service.cluster().key, key);

        b.service
            .join_cluster(&leader_api, "127.0.0.1", b_port, &key)
            .await
            .unwrap();
        assert_eq!(net.voters().len(), 2);
    }

    #[tokio::test]
    async fn test_follower_write_is_forwarded_to_leader() {
        let net = MockNetwork::new();
        let (a, b, _) = served_pair(&net).await;
        let follower = app(state_for(&b));

        let (status, body) = send(
            follower.clone(),
            json_req(
                "POST",
                "/api/info/notes",
                serde_json::json!({"title": "from-b", "content": "replicated"}),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED, "body: {body}");

        let (_, on_b) = send(follower, get_req("/api/info/notes")).await;
        let (_, on_a) = send(app(state_for(&a)), get_req("/api/info/notes")).await;
        assert_eq!(on_a["data"][0]["title"], "from-b");
        assert_eq!(on_a["data"], on_b["data"]);
    }

    #[tokio::test]
    async fn test_forwarded_write_to_follower_is_refused() {
        let net = MockNetwork::new();
        let (_a, b, _) = served_pair(&net).await;
        let req = Request::builder()
            .method("POST")
            .uri("/api/info/notes")
            .header("content-type", "application/json")
            .header(forward::FORWARDED_HEADER, "1")
            .body(Body::from(r#"{"title":"loop","content":"loop"}"#))
            .unwrap();
        let (status, body) = send(app(state_for(&b)), req).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["error"], "leader_changed");
    }

    #[tokio::test]
    async fn test_accept_join_on_follower_names_leader() {
        let net = MockNetwork::new();
        let (a, b, _) = served_pair(&net).await;
        let key = b.service.cluster().key;
        let (status, body) = send(
            app(state_for(&b)),
            json_req(
                "POST",
                "/api/cluster/accept-join",
                serde_json::json!({
                    "nodeId": "cccccccc",
                    "nodeIp": "127.0.0.1",
                    "nodePort": free_port(),
                    "clusterKey": key,
                }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["error"], "not_leader");
        assert_eq!(body["data"]["leaderId"], a.service.node_id());
    }

    #[tokio::test]
    async fn test_write_without_leader_is_unavailable() {
        let net = MockNetwork::new();
        let (a, b, _) = served_pair(&net).await;
        a.service.shutdown().await;

        let (status, body) = send(
            app(state_for(&b)),
            json_req(
                "PUT",
                "/api/cluster/options",
                serde_json::json!({"keyboardLayout": "de"}),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["error"], "leader_unknown");

        let (status, _) = send(app(state_for(&b)), get_req("/api/cluster/options")).await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_cluster_details_and_openapi() {
        let net = MockNetwork::new();
        let (a, _b, _) = served_pair(&net).await;
        let (status, body) = send(app(state_for(&a)), get_req("/api/cluster")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["nodes"].as_array().unwrap().len(), 2);
        assert_eq!(body["data"]["partial"], false);

        let (status, body) = send(app(state_for(&a)), get_req("/openapi.json")).await;
        assert_eq!(status, StatusCode::OK);
        assert!(body["paths"]["/api/cluster/accept-join"].is_object());
    }
}
