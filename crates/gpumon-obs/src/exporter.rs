//! Optional `/metrics` and `/healthz` endpoint

use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use gpumon_common::StopSignal;
use tokio::net::TcpListener;
use tracing::{debug, info};

use crate::PipelineMetrics;

pub fn router(metrics: PipelineMetrics) -> Router {
    Router::new()
        .route("/healthz", get(|| async { "ok" }))
        .route("/metrics", get(metrics_text))
        .with_state(metrics)
}

async fn metrics_text(State(metrics): State<PipelineMetrics>) -> impl IntoResponse {
    match metrics.render() {
        Ok(body) => (StatusCode::OK, [(header::CONTENT_TYPE, "text/plain; version=0.0.4")], body),
        Err(e) => {
            debug!(target: "obs", "render failed: {e}");
            (StatusCode::INTERNAL_SERVER_ERROR, [(header::CONTENT_TYPE, "text/plain")], e.to_string())
        }
    }
}

/// Serves until `stop` fires.
pub async fn serve(listener: TcpListener, metrics: PipelineMetrics, stop: StopSignal) -> std::io::Result<()> {
    if let Ok(addr) = listener.local_addr() {
        info!(target: "obs", "metrics on http://{addr}/metrics");
    }
    axum::serve(listener, router(metrics))
        .with_graceful_shutdown(async move { stop.stopped().await })
        .await
}
