//! Observer HTTP interface: `GET /snapshot` serves the Broadcaster's
//! latest published Snapshot as JSON, `GET /metrics` renders the
//! process's Prometheus metrics, `GET /health` is a liveness probe.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json};
use axum::routing::get;
use axum::Router;
use metrics_exporter_prometheus::PrometheusHandle;
use serde_json::json;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::broadcaster::SnapshotBroadcaster;

#[derive(Clone)]
struct ObserverState {
    broadcaster: Arc<SnapshotBroadcaster>,
    metrics: PrometheusHandle,
}

pub fn router(broadcaster: Arc<SnapshotBroadcaster>, metrics: PrometheusHandle) -> Router {
    let state = ObserverState { broadcaster, metrics };

    Router::new()
        .route("/snapshot", get(get_snapshot))
        .route("/metrics", get(get_metrics))
        .route("/health", get(|| async { StatusCode::OK }))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn serve(
    addr: SocketAddr,
    broadcaster: Arc<SnapshotBroadcaster>,
    metrics: PrometheusHandle,
) -> anyhow::Result<()> {
    let app = router(broadcaster, metrics);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("observer listening on {addr}");
    axum::serve(listener, app).await?;
    Ok(())
}

async fn get_snapshot(State(state): State<ObserverState>) -> impl IntoResponse {
    match state.broadcaster.latest() {
        Some(snapshot) => (StatusCode::OK, Json(json!(*snapshot))).into_response(),
        None => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "status": "not_ready" })),
        )
            .into_response(),
    }
}

async fn get_metrics(State(state): State<ObserverState>) -> impl IntoResponse {
    state.metrics.render()
}
