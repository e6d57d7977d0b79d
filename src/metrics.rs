//! Prometheus metrics for Sylve.
//!
//! Installs a global Prometheus recorder using `metrics-exporter-prometheus`,
//! defines metric name constants, provides the HTTP RED middleware and
//! exposes the `/metrics` endpoint handler.

use axum::http::{Request, StatusCode};
use axum::response::{IntoResponse, Response};
use metrics::{counter, describe_counter, describe_histogram, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::OnceLock;
use std::time::Instant;

// -- Metric name constants ----------------------------------------------------

/// Total HTTP requests (counter). Labels: method, path, status.
pub const HTTP_REQUESTS_TOTAL: &str = "sylve_http_requests_total";

/// HTTP request duration in seconds (histogram). Labels: method, path.
pub const HTTP_REQUEST_DURATION_SECONDS: &str = "sylve_http_request_duration_seconds";

/// Log entries applied by the state machine (counter). Labels: domain, result.
pub const FSM_APPLY_TOTAL: &str = "sylve_fsm_apply_total";

pub const FSM_SNAPSHOT_TOTAL: &str = "sylve_fsm_snapshot_total";

pub const FSM_RESTORE_TOTAL: &str = "sylve_fsm_restore_total";

/// Time from proposal to local apply (histogram). Labels: domain, action.
pub const PROPOSE_DURATION_SECONDS: &str = "sylve_propose_duration_seconds";

/// Writes proxied from a follower to the leader (counter). Labels: result.
pub const LEADER_FORWARD_TOTAL: &str = "sylve_leader_forward_total";

// -- Global recorder installation ---------------------------------------------

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Install the global Prometheus recorder. Idempotent.
///
/// If another recorder is already installed (e.g. by a test harness), a
/// detached recorder is kept so `/metrics` still renders.
pub fn init_metrics() -> &'static PrometheusHandle {
    PROMETHEUS_HANDLE.get_or_init(|| {
        let builder = PrometheusBuilder::new();
        let recorder = builder.build_recorder();
        let handle = recorder.handle();
        if metrics::set_global_recorder(recorder).is_err() {
            tracing::warn!("metrics recorder already installed; /metrics will be empty");
        }
        handle
    })
}

/// Register metric descriptions with the global recorder.
pub fn describe_metrics() {
    describe_counter!(HTTP_REQUESTS_TOTAL, "Total HTTP requests");
    describe_histogram!(
        HTTP_REQUEST_DURATION_SECONDS,
        "HTTP request duration in seconds"
    );
    describe_counter!(FSM_APPLY_TOTAL, "Replicated log entries applied");
    describe_counter!(FSM_SNAPSHOT_TOTAL, "State machine snapshots taken");
    describe_counter!(FSM_RESTORE_TOTAL, "State machine snapshot restores");
    describe_histogram!(
        PROPOSE_DURATION_SECONDS,
        "Seconds from proposal to local apply"
    );
    describe_counter!(LEADER_FORWARD_TOTAL, "Writes forwarded to the leader");
}

// -- Metrics middleware -------------------------------------------------------

/// Axum middleware that records HTTP RED metrics for every request.
///
/// Excludes `/metrics` from self-instrumentation.
pub async fn metrics_middleware(
    req: Request<axum::body::Body>,
    next: axum::middleware::Next,
) -> Response {
    if req.uri().path() == "/metrics" {
        return next.run(req).await;
    }
    let method = req.method().to_string();
    let path = normalize_path(req.uri().path());

    let start = Instant::now();
    let response = next.run(req).await;
    let duration = start.elapsed().as_secs_f64();
    let status = response.status().as_u16().to_string();

    counter!(HTTP_REQUESTS_TOTAL, "method" => method.clone(), "path" => path.clone(), "status" => status).increment(1);
    histogram!(HTTP_REQUEST_DURATION_SECONDS, "method" => method, "path" => path).record(duration);

    response
}

// -- Path normalization -------------------------------------------------------

/// Collapse numeric path segments into `{id}` to keep label cardinality low.
///
/// - `/api/notes/12` -> `/api/notes/{id}`
/// - `/api/cluster` -> `/api/cluster`
fn normalize_path(path: &str) -> String {
    if path == "/" {
        return path.to_string();
    }
    path.split('/')
        .map(|seg| {
            if !seg.is_empty() && seg.bytes().all(|b| b.is_ascii_digit()) {
                "{id}"
            } else {
                seg
            }
        })
        .collect::<Vec<_>>()
        .join("/")
}

// -- Metrics endpoint handler -------------------------------------------------

/// `GET /metrics` -- Render Prometheus exposition format text.
pub async fn metrics_handler() -> impl IntoResponse {
    let body = init_metrics().render();
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4")],
        body,
    )
}

// -- Tests --------------------------------------------------------------------
