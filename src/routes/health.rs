//! Health check endpoints

use axum::{extract::State, routing::get, Json, Router};
use serde::Serialize;

use crate::conversation::ProtocolError;
use crate::state::AppState;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub service: &'static str,
    pub open_sessions: usize,
    /// Rows in the upload log, in-flight reservations included
    pub logged_reports: i64,
}

/// Also a database round trip: a broken upload log answers 500
pub async fn health_check(
    State(state): State<AppState>,
) -> Result<Json<HealthResponse>, ProtocolError> {
    Ok(Json(HealthResponse {
        status: "healthy",
        version: env!("CARGO_PKG_VERSION"),
        service: "crash-report-server",
        open_sessions: state.protocol().sessions().session_count().await,
        logged_reports: state.upload_log().count().await?,
    }))
}

pub fn router() -> Router<AppState> {
    Router::new().route("/", get(health_check))
}
