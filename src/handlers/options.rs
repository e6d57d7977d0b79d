use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::Json;
use serde::Deserialize;
use utoipa::ToSchema;

use super::validated;
use crate::cluster::domains::options;
use crate::db::models::OptionRecord;
use crate::errors::{ApiError, ApiResponse};
use crate::AppState;

#[derive(Debug, Deserialize, garde::Validate, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct OptionsInput {
    #[garde(length(min = 1, max = 64))]
    pub keyboard_layout: String,
}

#[utoipa::path(
    get,
    path = "/api/cluster/options",
    tag = "Options",
    operation_id = "GetOptions",
    responses((status = 200, description = "Cluster options, if set", body = OptionRecord))
)]
pub async fn get_options(
    State(state): State<Arc<AppState>>,
) -> Result<Json<ApiResponse<Option<OptionRecord>>>, ApiError> {
    let row = state.cluster.dispatcher().read(options::get)?;
    Ok(ApiResponse::success("options_fetched", row))
}

#[utoipa::path(
    put,
    path = "/api/cluster/options",
    tag = "Options",
    operation_id = "SetOptions",
    request_body = OptionsInput,
    responses((status = 200, description = "Options saved"))
)]
pub async fn set_options(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<OptionsInput>, JsonRejection>,
) -> Result<Json<ApiResponse<()>>, ApiError> {
    let input = validated(payload)?;
    let bypass = state.cluster.bypass();
    state
        .cluster
        .propose_option_set(&input.keyboard_layout, bypass)
        .await?;
    Ok(ApiResponse::done("options_saved"))
}
