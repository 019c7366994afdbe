use std::sync::Arc;

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;

use crate::workers::transcoder::{StatsSnapshot, WorkerStats};

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    #[serde(flatten)]
    pub stats: StatsSnapshot,
}

pub fn configure_routes() -> Router<Arc<WorkerStats>> {
    Router::new().route("/health", get(health))
}

/// Liveness only. The counters help spot a worker that is stuck or
/// failing every job.
async fn health(State(stats): State<Arc<WorkerStats>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        stats: stats.snapshot(),
    })
}
