//! Route modules for the crash report server

pub mod health;
pub mod report;

use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::state::AppState;

/// Build the application router
pub fn app(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let max_upload_bytes = state.config().protocol.max_upload_bytes;

    Router::new()
        .nest("/health", health::router())
        .nest("/api/v1/health", health::router())
        .nest("/api/v1/report", report::router(max_upload_bytes))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}
