//! Router configuration for the web server.

use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Router,
};
use tower_http::cors::CorsLayer;

use super::handlers;
use super::AppState;

/// Create the main router with all routes.
pub fn create_router(state: AppState) -> Router {
    let body_limit = state.settings.max_upload_bytes;

    let excel = Router::new()
        .route("/upload", post(handlers::upload_workbook))
        .route("/progress/:job_id", get(handlers::job_progress))
        .route("/download/:job_id", get(handlers::download_output));

    Router::new()
        .nest("/excel", excel)
        .route("/health", get(handlers::health))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(CorsLayer::permissive())
        .with_state(state)
}
