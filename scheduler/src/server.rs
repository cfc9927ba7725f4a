//! HTTP surface: health/capacity probe and the build-done signal.

use crate::dispatcher::BuildDispatcher;
use crate::pool::ContainerPool;
use axum::{
    extract::{Path, State},
    routing::{get, post},
    Json, Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::info;

#[derive(Clone)]
pub struct AppState {
    pub dispatcher: Arc<BuildDispatcher>,
    pub pool: Arc<ContainerPool>,
}

pub fn create_app(state: AppState) -> Router {
    Router::new()
        .route("/healthcheck", get(healthcheck))
        .route("/builds/:build_id/done", post(build_done))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// GET /healthcheck — capacity probe for the pool.
async fn healthcheck(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "ok": true,
        "containers": state.pool.total(),
        "available": state.pool.count_available(),
    }))
}

/// POST /builds/:build_id/done — the external "build finished" signal.
/// Stops the build without the timeout-notification path; stopping an
/// unknown build is a no-op, not an error.
async fn build_done(
    State(state): State<AppState>,
    Path(build_id): Path<String>,
) -> Json<serde_json::Value> {
    let stopped = state.dispatcher.stop_build_by_id(&build_id);
    Json(serde_json::json!({ "stopped": stopped }))
}

pub async fn serve(addr: SocketAddr, state: AppState) -> anyhow::Result<()> {
    let app = create_app(state);
    info!("scheduler API listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}
