//! HTTP handlers for the cluster API.
//!
//! Request bodies are deserialized with `axum::Json` and validated with
//! `garde`; every failure is rendered as the JSON envelope from
//! [`crate::errors`].

pub mod cluster;
pub mod forward;
pub mod health;
pub mod notes;
pub mod options;
pub mod storage;

use axum::extract::rejection::JsonRejection;
use axum::Json;

use crate::errors::ApiError;

/// Unwrap a JSON body and run its `garde` rules.
pub(crate) fn validated<T>(payload: Result<Json<T>, JsonRejection>) -> Result<T, ApiError>
where
    T: garde::Validate,
    T::Context: Default,
{
    let Json(body) = payload.map_err(|e| ApiError::BadRequest(e.body_text()))?;
    body.validate()?;
    Ok(body)
}
