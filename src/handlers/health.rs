use std::sync::Arc;

use axum::extract::State;
use axum::Json;

use crate::cluster::service::HealthBasic;
use crate::errors::ApiResponse;
use crate::AppState;

/// `GET /api/health/basic` -- identity of this node.
#[utoipa::path(
    get,
    path = "/api/health/basic",
    tag = "Health",
    operation_id = "BasicHealth",
    responses(
        (status = 200, description = "Node identity", body = HealthBasic)
    )
)]
pub async fn basic_health(State(state): State<Arc<AppState>>) -> Json<ApiResponse<HealthBasic>> {
    ApiResponse::success("basic_health", state.cluster.health())
}
