//! HTTP API error and response envelope.
//!
//! Every JSON endpoint answers with the same envelope:
//!
//! ```json
//! {"status": "success" | "error", "message": "...", "error": "...", "data": ...}
//! ```
//!
//! [`ApiError`] implements [`axum::response::IntoResponse`] so handlers can
//! return `Err(ClusterError::NotLeader { .. }.into())` directly.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::error;
use utoipa::ToSchema;

use crate::cluster::ClusterError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum ResponseStatus {
    Success,
    Error,
}

/// The JSON envelope shared by all API responses.
#[derive(Debug, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub status: ResponseStatus,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
}

impl<T: Serialize> ApiResponse<T> {
    pub fn success(message: impl Into<String>, data: T) -> Json<Self> {
        Json(Self {
            status: ResponseStatus::Success,
            message: message.into(),
            error: None,
            data: Some(data),
        })
    }
}

impl ApiResponse<()> {
    /// A success envelope without a `data` field.
    pub fn done(message: impl Into<String>) -> Json<Self> {
        Json(Self {
            status: ResponseStatus::Success,
            message: message.into(),
            error: None,
            data: None,
        })
    }
}

/// Errors surfaced by the HTTP layer.
#[derive(Debug, Error)]
pub enum ApiError {
    /// Malformed or invalid request body.
    #[error("{0}")]
    BadRequest(String),

    #[error(transparent)]
    Cluster(#[from] ClusterError),

    /// A follower cannot forward because no leader is known.
    #[error("no leader is currently known")]
    LeaderUnknown,

    /// A forwarded request reached a node that is not the leader either.
    #[error("leadership changed while forwarding")]
    LeaderChanged,

    /// Forwarding to the leader failed.
    #[error("forwarding to leader failed: {0}")]
    BadGateway(String),

    #[error("resource not found")]
    NotFound,

    #[error("internal error: {0:#}")]
    Internal(#[from] anyhow::Error),
}

impl ApiError {
    pub fn code(&self) -> &'static str {
        match self {
            ApiError::BadRequest(_) => "invalid_request",
            ApiError::Cluster(e) => e.code(),
            ApiError::LeaderUnknown => "leader_unknown",
            ApiError::LeaderChanged => "leader_changed",
            ApiError::BadGateway(_) => "leader_forward_failed",
            ApiError::NotFound => "not_found",
            ApiError::Internal(_) => "internal_error",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Cluster(e) => e.status_code(),
            ApiError::LeaderUnknown | ApiError::LeaderChanged => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::BadGateway(_) => StatusCode::BAD_GATEWAY,
            ApiError::NotFound => StatusCode::NOT_FOUND,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Structured detail carried in `data`, for errors the caller can act on.
    fn detail(&self) -> Option<serde_json::Value> {
        match self {
            ApiError::Cluster(ClusterError::NotLeader {
                leader_address,
                leader_id,
            }) => Some(serde_json::json!({
                "leaderAddress": leader_address,
                "leaderId": leader_id,
            })),
            _ => None,
        }
    }
}

impl From<garde::Report> for ApiError {
    fn from(report: garde::Report) -> Self {
        ApiError::BadRequest(report.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            error!(code = self.code(), error = %self, "request failed");
        }
        let body = ApiResponse {
            status: ResponseStatus::Error,
            message: self.to_string(),
            error: Some(self.code().to_string()),
            data: self.detail(),
        };
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn body_json(resp: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_cluster_error_envelope() {
        let resp = ApiError::from(ClusterError::InvalidClusterKey).into_response();
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);
        let body = body_json(resp).await;
        assert_eq!(body["status"], "error");
        assert_eq!(body["error"], "invalid_cluster_key");
        assert!(body.get("data").is_none());
    }

    #[tokio::test]
    async fn test_not_leader_carries_leader_hint() {
        let err = ClusterError::NotLeader {
            leader_address: Some("10.0.0.1:8180".into()),
            leader_id: Some("node-a".into()),
        };
        let resp = ApiError::from(err).into_response();
        assert_eq!(resp.status(), StatusCode::CONFLICT);
        let body = body_json(resp).await;
        assert_eq!(body["error"], "not_leader");
        assert_eq!(body["data"]["leaderAddress"], "10.0.0.1:8180");
        assert_eq!(body["data"]["leaderId"], "node-a");
    }

    #[tokio::test]
    async fn test_leader_unknown_is_unavailable() {
        let resp = ApiError::LeaderUnknown.into_response();
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body_json(resp).await["error"], "leader_unknown");
    }

    #[test]
    fn test_success_envelope_shape() {
        let Json(resp) = ApiResponse::success("ok", vec![1, 2]);
        let value = serde_json::to_value(&resp).unwrap();
        assert_eq!(value["status"], "success");
        assert_eq!(value["data"], serde_json::json!([1, 2]));
        assert!(value.get("error").is_none());
    }
}
