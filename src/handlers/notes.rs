//! Cluster-wide notes.

use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde::Deserialize;
use utoipa::ToSchema;

use super::validated;
use crate::cluster::domains::notes;
use crate::db::models::NoteRecord;
use crate::errors::{ApiError, ApiResponse};
use crate::AppState;

#[derive(Debug, Deserialize, garde::Validate, ToSchema)]
pub struct NoteInput {
    #[garde(length(min = 3))]
    pub title: String,
    #[garde(length(min = 3))]
    pub content: String,
}

#[derive(Debug, Deserialize, garde::Validate, ToSchema)]
pub struct BulkDeleteInput {
    #[garde(length(min = 1))]
    pub ids: Vec<i64>,
}

#[utoipa::path(
    get,
    path = "/api/info/notes",
    tag = "Notes",
    operation_id = "ListNotes",
    responses((status = 200, description = "All notes", body = Vec<NoteRecord>))
)]
pub async fn list_notes(
    State(state): State<Arc<AppState>>,
) -> Result<Json<ApiResponse<Vec<NoteRecord>>>, ApiError> {
    let rows = state.cluster.dispatcher().read(notes::list)?;
    Ok(ApiResponse::success("notes_listed", rows))
}

#[utoipa::path(
    post,
    path = "/api/info/notes",
    tag = "Notes",
    operation_id = "CreateNote",
    request_body = NoteInput,
    responses(
        (status = 201, description = "Note created"),
        (status = 400, description = "Invalid note")
    )
)]
pub async fn create_note(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<NoteInput>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let note = validated(payload)?;
    let bypass = state.cluster.bypass();
    state
        .cluster
        .propose_note_create(&note.title, &note.content, bypass)
        .await?;
    Ok((StatusCode::CREATED, ApiResponse::done("note_created")))
}

#[utoipa::path(
    put,
    path = "/api/info/notes/{id}",
    tag = "Notes",
    operation_id = "UpdateNote",
    params(("id" = i64, Path, description = "Note id")),
    request_body = NoteInput,
    responses(
        (status = 200, description = "Note updated"),
        (status = 422, description = "Note does not exist")
    )
)]
pub async fn update_note(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    payload: Result<Json<NoteInput>, JsonRejection>,
) -> Result<Json<ApiResponse<()>>, ApiError> {
    let note = validated(payload)?;
    let bypass = state.cluster.bypass();
    state
        .cluster
        .propose_note_update(id, &note.title, &note.content, bypass)
        .await?;
    Ok(ApiResponse::done("note_updated"))
}

#[utoipa::path(
    delete,
    path = "/api/info/notes/{id}",
    tag = "Notes",
    operation_id = "DeleteNote",
    params(("id" = i64, Path, description = "Note id")),
    responses((status = 200, description = "Note deleted"))
)]
pub async fn delete_note(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<Json<ApiResponse<()>>, ApiError> {
    let bypass = state.cluster.bypass();
    state.cluster.propose_note_delete(id, bypass).await?;
    Ok(ApiResponse::done("note_deleted"))
}

#[utoipa::path(
    post,
    path = "/api/info/notes/bulk-delete",
    tag = "Notes",
    operation_id = "BulkDeleteNotes",
    request_body = BulkDeleteInput,
    responses((status = 200, description = "Notes deleted"))
)]
pub async fn bulk_delete_notes(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<BulkDeleteInput>, JsonRejection>,
) -> Result<Json<ApiResponse<()>>, ApiError> {
    let req = validated(payload)?;
    let bypass = state.cluster.bypass();
    state.cluster.propose_note_bulk_delete(&req.ids, bypass).await?;
    Ok(ApiResponse::done("notes_deleted"))
}
