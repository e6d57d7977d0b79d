//! Leader forwarding for replicated writes.
//!
//! Only the leader may propose.  A write reaching a follower is proxied
//! verbatim to the leader's HTTP API (`host(leader raft addr):api_port`).
//! Proxied requests carry [`FORWARDED_HEADER`]; a node that receives one
//! while still not being the leader answers 503 `leader_changed` instead of
//! forwarding again.

use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::{header, HeaderName, Method};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use tracing::{debug, warn};

use crate::cluster::{ClusterError, WriteRoute};
use crate::errors::ApiError;
use crate::metrics::LEADER_FORWARD_TOTAL;
use crate::AppState;

pub const FORWARDED_HEADER: &str = "x-sylve-forwarded";

/// Largest request body that will be proxied.
const MAX_FORWARD_BODY: usize = 8 * 1024 * 1024;

/// Headers that describe a single hop and must not be copied.
fn hop_by_hop(name: &HeaderName) -> bool {
    matches!(
        name.as_str(),
        "host"
            | "connection"
            | "keep-alive"
            | "proxy-connection"
            | "transfer-encoding"
            | "te"
            | "trailer"
            | "upgrade"
            | "content-length"
    )
}

/// Route-layer middleware placed on every replicated write endpoint.
pub async fn forward_to_leader(
    State(state): State<Arc<AppState>>,
    req: Request,
    next: Next,
) -> Response {
    if matches!(*req.method(), Method::GET | Method::HEAD | Method::OPTIONS) {
        return next.run(req).await;
    }

    match state.cluster.write_route() {
        WriteRoute::Local | WriteRoute::Replicate(_) => next.run(req).await,
        WriteRoute::Unavailable => ApiError::Cluster(ClusterError::NotInitialized).into_response(),
        WriteRoute::LeaderUnknown => ApiError::LeaderUnknown.into_response(),
        WriteRoute::Forward { api } => {
            if req.headers().contains_key(FORWARDED_HEADER) {
                warn!(path = %req.uri().path(), "forwarded write reached a non-leader");
                return ApiError::LeaderChanged.into_response();
            }
            match proxy(&state, &api, req).await {
                Ok(resp) => {
                    metrics::counter!(LEADER_FORWARD_TOTAL, "result" => "ok").increment(1);
                    resp
                }
                Err(e) => {
                    metrics::counter!(LEADER_FORWARD_TOTAL, "result" => "error").increment(1);
                    warn!(leader = %api, error = %e, "forwarding to leader failed");
                    ApiError::BadGateway(e.to_string()).into_response()
                }
            }
        }
    }
}

async fn proxy(state: &AppState, api: &str, req: Request) -> anyhow::Result<Response> {
    let (parts, body) = req.into_parts();
    let path = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let url = format!("{}://{}{}", state.cluster.settings().api_scheme, api, path);
    debug!(method = %parts.method, %url, "forwarding write to leader");

    let bytes = axum::body::to_bytes(body, MAX_FORWARD_BODY).await?;
    let mut upstream = state
        .cluster
        .http()
        .request(parts.method.clone(), &url)
        .header(FORWARDED_HEADER, "1")
        .body(bytes);
    for (name, value) in parts.headers.iter() {
        if !hop_by_hop(name) {
            upstream = upstream.header(name, value);
        }
    }

    let resp = upstream.send().await?;
    let status = resp.status();
    let headers = resp.headers().clone();
    let body = resp.bytes().await?;

    let mut out = Response::builder().status(status);
    for (name, value) in headers.iter() {
        if !hop_by_hop(name) {
            out = out.header(name, value);
        }
    }
    let out = out
        .header(header::CONTENT_LENGTH, body.len())
        .body(Body::from(body))?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hop_by_hop_headers_are_dropped() {
        assert!(hop_by_hop(&header::HOST));
        assert!(hop_by_hop(&header::TRANSFER_ENCODING));
        assert!(!hop_by_hop(&header::CONTENT_TYPE));
        assert!(!hop_by_hop(&HeaderName::from_static(FORWARDED_HEADER)));
    }
}
