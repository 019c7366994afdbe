use std::sync::Arc;

use axum::Router;
use tower_http::trace::TraceLayer;

use crate::media::Transcoder;
use crate::modules::resource::repository::ResourceRepository;
use crate::state::AppState;
use crate::workers::pipeline::{Pipeline, PipelineSettings};
use crate::workers::transcoder::{TranscoderWorker, WorkerStats};

pub fn create_health_app(stats: Arc<WorkerStats>) -> Router {
    crate::routes::configure_routes()
        .layer(TraceLayer::new_for_http())
        .with_state(stats)
}

pub fn create_worker(state: &AppState, transcoder: Arc<dyn Transcoder>) -> TranscoderWorker {
    let catalog = ResourceRepository::new(state.db.clone(), state.config.catalog_table.clone());
    let pipeline = Pipeline::new(
        state.storage.clone(),
        transcoder,
        Arc::new(catalog),
        PipelineSettings {
            scratch_root: state.config.scratch_dir.clone(),
            rollback_on_abort: state.config.rollback_on_abort,
        },
    );
    TranscoderWorker::new(state.queue.clone(), pipeline, state.config.visibility_timeout)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{Body, to_bytes};
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    #[tokio::test]
    async fn health_reports_counters() {
        let app = create_health_app(Arc::new(WorkerStats::default()));

        let response = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = to_bytes(response.into_body(), 1024).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["status"], "ok");
        assert_eq!(json["jobs_succeeded"], 0);
        assert_eq!(json["jobs_failed"], 0);
        assert_eq!(json["messages_rejected"], 0);
        assert!(json.get("last_poll_unix").is_some());
    }

    #[tokio::test]
    async fn unknown_paths_are_not_found() {
        let app = create_health_app(Arc::new(WorkerStats::default()));

        let response = app
            .oneshot(Request::builder().uri("/api/v1/videos").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
