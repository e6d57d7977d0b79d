//! Cluster lifecycle and topology endpoints.

use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde::Deserialize;
use tracing::info;
use utoipa::{IntoParams, ToSchema};

use super::validated;
use crate::cluster::detail::ClusterDetails;
use crate::cluster::lifecycle::{AcceptJoinRequest, JoinOutcome};
use crate::cluster::net;
use crate::db::models::{ClusterNodeRecord, ClusterRecord};
use crate::errors::{ApiError, ApiResponse};
use crate::AppState;

// -- Request bodies -----------------------------------------------------------

#[derive(Debug, Deserialize, garde::Validate, ToSchema)]
pub struct CreateClusterRequest {
    #[garde(ip)]
    pub ip: String,
    #[garde(range(min = 1024, max = 65535))]
    pub port: u32,
}

#[derive(Debug, Deserialize, garde::Validate, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct JoinClusterRequest {
    #[garde(length(min = 1))]
    pub node_id: String,
    #[garde(ip)]
    pub node_ip: String,
    #[garde(range(min = 1024, max = 65535))]
    pub node_port: u32,
    /// `host:port` of the leader's HTTP API.
    #[garde(length(min = 3))]
    pub leader_api: String,
    #[garde(length(min = 1))]
    pub cluster_key: String,
}

#[derive(Debug, Default, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct ResetQuery {
    /// Let a leader with other voters leave anyway.
    #[serde(default)]
    pub force: bool,
}

/// Ports are range-checked by garde before this narrowing.
fn port(value: u32) -> Result<u16, ApiError> {
    u16::try_from(value).map_err(|_| ApiError::BadRequest(format!("invalid port {value}")))
}

// -- Handlers -----------------------------------------------------------------

#[utoipa::path(
    get,
    path = "/api/cluster",
    tag = "Cluster",
    operation_id = "GetCluster",
    responses((status = 200, description = "Cluster details", body = ClusterDetails))
)]
pub async fn get_cluster(State(state): State<Arc<AppState>>) -> Json<ApiResponse<ClusterDetails>> {
    ApiResponse::success("cluster_fetched", state.cluster.details())
}

#[utoipa::path(
    post,
    path = "/api/cluster",
    tag = "Cluster",
    operation_id = "CreateCluster",
    request_body = CreateClusterRequest,
    responses(
        (status = 201, description = "Cluster created", body = ClusterRecord),
        (status = 400, description = "Invalid address"),
        (status = 409, description = "Already clustered or port busy")
    )
)]
pub async fn create_cluster(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<CreateClusterRequest>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let req = validated(payload)?;
    let record = state.cluster.create_cluster(&req.ip, port(req.port)?).await?;
    Ok((
        StatusCode::CREATED,
        ApiResponse::success("cluster_created", record),
    ))
}

#[utoipa::path(
    post,
    path = "/api/cluster/join",
    tag = "Cluster",
    operation_id = "JoinCluster",
    request_body = JoinClusterRequest,
    responses(
        (status = 200, description = "Joined"),
        (status = 400, description = "Invalid request"),
        (status = 502, description = "Leader unreachable")
    )
)]
pub async fn join_cluster(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<JoinClusterRequest>, JsonRejection>,
) -> Result<Json<ApiResponse<()>>, ApiError> {
    let req = validated(payload)?;
    if net::split_host(&req.leader_api).is_none() {
        return Err(ApiError::BadRequest(
            "leader_api_must_be_in_host_port_format".to_string(),
        ));
    }
    if req.node_id != state.cluster.node_id() {
        return Err(ApiError::BadRequest("node_id_mismatch".to_string()));
    }
    state
        .cluster
        .join_cluster(&req.leader_api, &req.node_ip, port(req.node_port)?, &req.cluster_key)
        .await?;
    Ok(ApiResponse::done("cluster_joined"))
}

#[utoipa::path(
    post,
    path = "/api/cluster/accept-join",
    tag = "Cluster",
    operation_id = "AcceptJoin",
    request_body = AcceptJoinRequest,
    responses(
        (status = 200, description = "Node added or already a member", body = JoinOutcome),
        (status = 403, description = "Wrong cluster key"),
        (status = 409, description = "This node is not the leader")
    )
)]
pub async fn accept_join(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<AcceptJoinRequest>, JsonRejection>,
) -> Result<Json<ApiResponse<JoinOutcome>>, ApiError> {
    let req = validated(payload)?;
    let outcome = state
        .cluster
        .accept_join(&req.node_id, &req.node_ip, req.node_port, &req.cluster_key)
        .await?;
    Ok(ApiResponse::success("node_added_to_cluster", outcome))
}

#[utoipa::path(
    delete,
    path = "/api/cluster/reset-node",
    tag = "Cluster",
    operation_id = "ResetRaftNode",
    params(ResetQuery),
    responses(
        (status = 200, description = "Node reset"),
        (status = 409, description = "Leader of a multi-node cluster")
    )
)]
pub async fn reset_node(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ResetQuery>,
) -> Result<Json<ApiResponse<()>>, ApiError> {
    state.cluster.reset_raft_node(query.force).await?;
    info!(force = query.force, "raft node reset via api");
    Ok(ApiResponse::done("raft_node_reset"))
}

#[utoipa::path(
    get,
    path = "/api/cluster/nodes",
    tag = "Cluster",
    operation_id = "ListClusterNodes",
    responses((status = 200, description = "Cached topology", body = Vec<ClusterNodeRecord>))
)]
pub async fn list_nodes(
    State(state): State<Arc<AppState>>,
) -> Result<Json<ApiResponse<Vec<ClusterNodeRecord>>>, ApiError> {
    Ok(ApiResponse::success("nodes_fetched", state.cluster.nodes()?))
}
