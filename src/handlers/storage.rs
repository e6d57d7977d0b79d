//! Cluster-wide S3 backup targets.

use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use super::validated;
use crate::cluster::domains::s3::{self, S3ConfigInput};
use crate::db::models::S3ConfigRecord;
use crate::errors::{ApiError, ApiResponse};
use crate::AppState;

/// Field presence is checked by the proposer so each gap gets its own code.
#[derive(Debug, Deserialize, garde::Validate, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct S3ConfigRequest {
    #[garde(length(min = 1, max = 128))]
    pub name: String,
    #[serde(default)]
    #[garde(skip)]
    pub endpoint: String,
    #[serde(default)]
    #[garde(skip)]
    pub region: String,
    #[serde(default)]
    #[garde(skip)]
    pub bucket: String,
    #[serde(default)]
    #[garde(skip)]
    pub access_key: String,
    #[serde(default)]
    #[garde(skip)]
    pub secret_key: String,
}

/// An S3 target as listed by the API; the secret never leaves the node.
#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct S3ConfigView {
    pub id: i64,
    pub name: String,
    pub endpoint: String,
    pub region: String,
    pub bucket: String,
    pub access_key: String,
}

impl From<S3ConfigRecord> for S3ConfigView {
    fn from(r: S3ConfigRecord) -> Self {
        Self {
            id: r.id,
            name: r.name,
            endpoint: r.endpoint,
            region: r.region,
            bucket: r.bucket,
            access_key: r.access_key,
        }
    }
}

#[utoipa::path(
    get,
    path = "/api/cluster/storage/s3",
    tag = "Storage",
    operation_id = "ListS3Configs",
    responses((status = 200, description = "S3 targets", body = Vec<S3ConfigView>))
)]
pub async fn list_s3_configs(
    State(state): State<Arc<AppState>>,
) -> Result<Json<ApiResponse<Vec<S3ConfigView>>>, ApiError> {
    let rows = state.cluster.dispatcher().read(s3::list)?;
    Ok(ApiResponse::success(
        "s3_configs_listed",
        rows.into_iter().map(S3ConfigView::from).collect(),
    ))
}

#[utoipa::path(
    post,
    path = "/api/cluster/storage/s3",
    tag = "Storage",
    operation_id = "CreateS3Config",
    request_body = S3ConfigRequest,
    responses(
        (status = 201, description = "S3 target stored"),
        (status = 400, description = "Missing field or failed permission probe")
    )
)]
pub async fn create_s3_config(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<S3ConfigRequest>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let req = validated(payload)?;
    let input = S3ConfigInput {
        id: None,
        name: req.name,
        endpoint: req.endpoint,
        region: req.region,
        bucket: req.bucket,
        access_key: req.access_key,
        secret_key: req.secret_key,
    };
    let bypass = state.cluster.bypass();
    state.cluster.propose_s3_config(input, bypass).await?;
    Ok((StatusCode::CREATED, ApiResponse::done("s3_config_created")))
}

#[utoipa::path(
    delete,
    path = "/api/cluster/storage/s3/{id}",
    tag = "Storage",
    operation_id = "DeleteS3Config",
    params(("id" = i64, Path, description = "S3 target id")),
    responses((status = 200, description = "S3 target deleted"))
)]
pub async fn delete_s3_config(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<Json<ApiResponse<()>>, ApiError> {
    let bypass = state.cluster.bypass();
    state.cluster.propose_s3_config_delete(id, bypass).await?;
    Ok(ApiResponse::done("s3_config_deleted"))
}
