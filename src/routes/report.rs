//! Report Routes
//!
//! Both phases of the conversation share one endpoint:
//! - POST /api/v1/report        - phase 1, signed JSON envelope
//! - POST /api/v1/report?r=...  - phase 2, multipart upload of the encrypted archive

use axum::{
    extract::{DefaultBodyLimit, FromRequest, Multipart, Query, Request, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::post,
    Json, Router,
};
use serde::Deserialize;

use crate::conversation::{
    token_prefix, Envelope, PhaseOneOutcome, ProtocolError, UploadSubmission, UploadedFile,
    NOTHING_TO_DO_MESSAGE, SUCCESS_MESSAGE,
};
use crate::state::AppState;

/// Room for multipart framing on top of the archive itself
const MULTIPART_OVERHEAD_BYTES: usize = 64 * 1024;

// ============================================================================
// Error Response
// ============================================================================

impl IntoResponse for ProtocolError {
    fn into_response(self) -> Response {
        let status = self.status_code();

        match &self {
            // Nothing is disclosed to a client that cannot sign its request
            ProtocolError::Authentication => return status.into_response(),
            ProtocolError::Storage(_)
            | ProtocolError::Database(_)
            | ProtocolError::KeyGeneration(_)
            | ProtocolError::UnsupportedAlgorithm(_)
            | ProtocolError::Internal(_) => {
                tracing::error!(error = %self, "Report request failed");
            }
            _ => {
                tracing::debug!(error = %self, status = %status, "Report request rejected");
            }
        }

        (status, self.to_string()).into_response()
    }
}

// ============================================================================
// Router
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct ReportQuery {
    pub r: Option<String>,
}

/// Create the report router
pub fn router(max_upload_bytes: usize) -> Router<AppState> {
    Router::new()
        .route("/", post(submit))
        .layer(DefaultBodyLimit::max(
            max_upload_bytes.saturating_add(MULTIPART_OVERHEAD_BYTES),
        ))
}

// ============================================================================
// Handlers
// ============================================================================

/// POST /api/v1/report
///
/// Dispatches on the presence of the token parameter.
async fn submit(
    State(state): State<AppState>,
    Query(query): Query<ReportQuery>,
    request: Request,
) -> Result<Response, ProtocolError> {
    match query.r {
        Some(token) => upload(state, token, request).await,
        None => challenge(state, request).await,
    }
}

/// Phase 1: verify the envelope and hand out a key and upload URL
async fn challenge(state: AppState, request: Request) -> Result<Response, ProtocolError> {
    let Json(envelope) = Json::<Envelope>::from_request(request, &state)
        .await
        .map_err(|e| ProtocolError::ProtocolFormat(e.body_text()))?;

    match state.protocol().begin(&envelope).await? {
        PhaseOneOutcome::Challenge(reply) => Ok(Json(reply).into_response()),
        PhaseOneOutcome::NothingToDo => Ok((StatusCode::OK, NOTHING_TO_DO_MESSAGE).into_response()),
    }
}

/// Phase 2: accept the encrypted archive for `token`
async fn upload(state: AppState, token: String, request: Request) -> Result<Response, ProtocolError> {
    let multipart = Multipart::from_request(request, &state)
        .await
        .map_err(|e| ProtocolError::UploadShape(e.body_text()))?;

    let submission = read_submission(multipart).await;
    tracing::debug!(
        token = %token_prefix(&token),
        files = submission.files.len(),
        "Received report upload"
    );

    state.protocol().complete(&token, submission).await?;

    Ok((StatusCode::OK, SUCCESS_MESSAGE).into_response())
}

/// Collect the file parts of a multipart body.
///
/// A broken body is recorded rather than returned so the validator reports it
/// alongside the other shape checks.
async fn read_submission(mut multipart: Multipart) -> UploadSubmission {
    let mut submission = UploadSubmission::default();

    loop {
        let field = match multipart.next_field().await {
            Ok(Some(field)) => field,
            Ok(None) => break,
            Err(e) => {
                tracing::warn!("Failed to read multipart field: {}", e);
                submission.transport_error = Some(e.body_text());
                break;
            }
        };

        // Plain form values are not files
        let Some(file_name) = field.file_name().map(str::to_string) else {
            continue;
        };
        let field_name = field.name().unwrap_or_default().to_string();

        match field.bytes().await {
            Ok(data) => submission.files.push(UploadedFile {
                field_name,
                file_name,
                data: data.to_vec(),
            }),
            Err(e) => {
                tracing::warn!("Failed to read multipart file data: {}", e);
                submission.transport_error = Some(e.body_text());
                break;
            }
        }
    }

    submission
}

// ============================================================================
// Tests
// ============================================================================
