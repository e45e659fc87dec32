use crate::handlers;
use crate::state::AppState;
use axum::{routing::{get, post}, Router};

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/health", get(handlers::health))
        .route(
            "/api/heatmap",
            post(handlers::ingest).fallback(handlers::ingest_method_not_allowed),
        )
        .route("/api/heatmap/snapshot", get(handlers::snapshot))
        .route("/api/heatmap/summary", get(handlers::summary))
        .with_state(state)
}
