//! Health check handlers for the producer pipeline.
//!
//! - Liveness probes (`/health`, `/healthz`)
//! - Readiness probes (`/ready`, `/readyz`): log writer reachable and queue open
//! - Prometheus metrics (`/metrics`)
//! - Counter snapshot as JSON (`/stats`)

use axum::{
    extract::State,
    http::{header, StatusCode},
    response::IntoResponse,
    routing::get,
    Json,
};
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::Arc;

use crate::metrics::{self, PipelineMetrics};
use crate::queue::BoundedQueue;
use crate::writer::LogWriter;

/// Shared state for health endpoints.
#[derive(Clone)]
pub struct HealthState {
    pub app_name: String,
    pub app_version: String,
    pub metrics: Arc<PipelineMetrics>,
    pub queue: Arc<BoundedQueue>,
    pub writer: Arc<dyn LogWriter>,
}

impl HealthState {
    pub fn new(
        app_name: impl Into<String>,
        app_version: impl Into<String>,
        metrics: Arc<PipelineMetrics>,
        queue: Arc<BoundedQueue>,
        writer: Arc<dyn LogWriter>,
    ) -> Self {
        Self {
            app_name: app_name.into(),
            app_version: app_version.into(),
            metrics,
            queue,
            writer,
        }
    }
}

/// Health response for liveness probes.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    /// Status (always "healthy" if responding).
    pub status: &'static str,
    pub name: String,
    pub version: String,
}

/// Liveness probe handler.
///
/// Always returns OK if the server is running.
pub async fn health_handler(State(state): State<HealthState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        name: state.app_name,
        version: state.app_version,
    })
}

/// Readiness probe handler.
///
/// Ready while the queue accepts records and the log writer answers its
/// health check.
pub async fn ready_handler(
    State(state): State<HealthState>,
) -> Result<(StatusCode, Json<Value>), (StatusCode, Json<Value>)> {
    let writer_check = match state.writer.health_check().await {
        Ok(true) => Ok("ok".to_string()),
        Ok(false) => Err("unhealthy".to_string()),
        Err(e) => Err(format!("error: {}", e)),
    };
    let queue_open = !state.queue.is_closed();

    let body = |status: &str, writer: &str| {
        let mut checks = serde_json::Map::new();
        checks.insert(state.writer.name().to_string(), json!(writer));
        checks.insert(
            "queue".to_string(),
            json!(if queue_open { "open" } else { "closed" }),
        );
        Json(json!({ "status": status, "checks": checks }))
    };

    match writer_check {
        Ok(ok) if queue_open => Ok((StatusCode::OK, body("ready", &ok))),
        Ok(ok) => Err((StatusCode::SERVICE_UNAVAILABLE, body("not_ready", &ok))),
        Err(e) => Err((StatusCode::SERVICE_UNAVAILABLE, body("not_ready", &e))),
    }
}

/// Prometheus metrics endpoint handler.
pub async fn metrics_handler() -> impl IntoResponse {
    match metrics::prometheus_handle() {
        Some(handle) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
            handle.render(),
        )
            .into_response(),
        None => (
            StatusCode::SERVICE_UNAVAILABLE,
            [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
            "Metrics not initialized. Call metrics::init_metrics() at startup.".to_string(),
        )
            .into_response(),
    }
}

/// Current counters, queue depth and partition skew.
pub async fn stats_handler(State(state): State<HealthState>) -> Json<Value> {
    let snapshot = state.metrics.snapshot();
    Json(json!({
        "in_flight": snapshot.in_flight(),
        "skew": snapshot.skew(),
        "queue": {
            "depth": state.queue.len(),
            "capacity": state.queue.capacity(),
            "closed": state.queue.is_closed(),
        },
        "counters": snapshot,
    }))
}

/// Create the health router.
///
/// - `GET /health`, `GET /healthz` - liveness
/// - `GET /ready`, `GET /readyz` - readiness
/// - `GET /metrics` - Prometheus metrics
/// - `GET /stats` - JSON counter snapshot
pub fn health_router(state: HealthState) -> axum::Router {
    axum::Router::new()
        .route("/health", get(health_handler))
        .route("/healthz", get(health_handler))
        .route("/ready", get(ready_handler))
        .route("/readyz", get(ready_handler))
        .route("/metrics", get(metrics_handler))
        .route("/stats", get(stats_handler))
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FullQueuePolicy;
    use crate::record::Record;
    use crate::writer::MemoryLogWriter;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    fn state() -> HealthState {
        let metrics = Arc::new(PipelineMetrics::new("tweets", 2));
        let queue = Arc::new(BoundedQueue::new(4, FullQueuePolicy::Reject, metrics.clone()));
        HealthState::new(
            "firehose-connector",
            "0.1.0",
            metrics,
            queue,
            Arc::new(MemoryLogWriter::new()),
        )
    }

    async fn get_json(router: axum::Router, uri: &str) -> (StatusCode, Value) {
        let response = router
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[test]
    fn test_health_response_serialization() {
        let response = HealthResponse {
            status: "healthy",
            name: "firehose-connector".to_string(),
            version: "1.0.0".to_string(),
        };

        let json = serde_json::to_string(&response).unwrap();
        assert!(json.contains("\"status\":\"healthy\""));
        assert!(json.contains("\"name\":\"firehose-connector\""));
    }

    #[tokio::test]
    async fn test_liveness() {
        let (status, body) = get_json(health_router(state()), "/healthz").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["version"], "0.1.0");
    }

    #[tokio::test]
    async fn test_ready_until_queue_closes() {
        let state = state();
        let (status, body) = get_json(health_router(state.clone()), "/ready").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["checks"]["memory"], "ok");

        state.queue.close();
        let (status, body) = get_json(health_router(state), "/readyz").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["checks"]["queue"], "closed");
    }

    #[tokio::test]
    async fn test_stats() {
        let state = state();
        state.queue.offer(Record::from("a")).await;
        state.metrics.record_published(1);

        let (status, body) = get_json(health_router(state), "/stats").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["queue"]["depth"], 1);
        assert_eq!(body["counters"]["received"], 1);
        assert_eq!(body["counters"]["published_by_partition"], json!([0, 1]));
    }
}
