//! Types for the crash report conversation protocol

use chrono::{DateTime, Utc};
use rsa::{RsaPrivateKey, RsaPublicKey};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::digest::DigestService;

// ============================================================================
// Constants
// ============================================================================

/// Session timeout: 15 minutes from phase-1 completion
pub const SESSION_TIMEOUT_MINUTES: i64 = 15;

/// Maximum size of an uploaded (encrypted) archive: 10MB
pub const MAX_UPLOAD_BYTES: usize = 10 * 1024 * 1024;

/// Multipart field that carries the encrypted archive
pub const UPLOAD_FIELD_NAME: &str = "zipfile";

/// Required extension of the uploaded file name
pub const UPLOAD_EXTENSION: &str = ".zip";

/// Query parameter carrying the conversation token
pub const TOKEN_QUERY_PARAM: &str = "r";

/// Archive entry holding the client's debug information
pub const DEBUG_INFO_ENTRY: &str = "debuginfo.txt";

/// Archive entry holding the stack trace text
pub const STACK_TRACE_ENTRY: &str = "exception.txt";

/// Plain-text acknowledgment for a committed report
pub const SUCCESS_MESSAGE: &str = "Success.";

/// Plain-text acknowledgment when the report is already on file
pub const NOTHING_TO_DO_MESSAGE: &str = "Nothing to do.";

// ============================================================================
// Envelope
// ============================================================================

/// Signed JSON structure exchanged in phase 1, in both directions
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub body: Map<String, Value>,
    pub digest: String,
}

impl Envelope {
    /// Build an envelope whose digest covers the canonical form of `body`
    pub fn sign(body: Map<String, Value>, digest: &DigestService) -> Result<Self, ProtocolError> {
        let digest = digest.digest_body(&body)?;
        Ok(Self { body, digest })
    }

    /// Recompute the body digest and compare it with the one carried
    pub fn verify(&self, digest: &DigestService) -> Result<bool, ProtocolError> {
        let expected = digest.digest_body(&self.body)?;
        Ok(DigestService::digests_match(&expected, &self.digest))
    }
}

/// Validated phase-1 request body
#[derive(Debug, Clone, PartialEq)]
pub struct ChallengeRequest {
    pub version: String,
    pub client_time: Value,
    pub checksum: String,
}

impl ChallengeRequest {
    /// Extract the required fields from an envelope body.
    ///
    /// `version` and `checksum` accept JSON strings or numbers and are
    /// normalized to strings. `clienttime` must be a scalar and is echoed back
    /// untouched.
    pub fn from_body(body: &Map<String, Value>) -> Result<Self, ProtocolError> {
        let version = required_text(body, "version")?;
        let checksum = required_text(body, "checksum")?;

        let client_time = match body.get("clienttime") {
            None | Some(Value::Null) => {
                return Err(ProtocolError::ProtocolFormat(
                    "missing field: clienttime".to_string(),
                ))
            }
            Some(Value::Array(_)) | Some(Value::Object(_)) => {
                return Err(ProtocolError::ProtocolFormat(
                    "clienttime must be a scalar".to_string(),
                ))
            }
            Some(value) => value.clone(),
        };

        Ok(Self {
            version,
            client_time,
            checksum,
        })
    }
}

fn required_text(body: &Map<String, Value>, field: &str) -> Result<String, ProtocolError> {
    let text = match body.get(field) {
        None | Some(Value::Null) => {
            return Err(ProtocolError::ProtocolFormat(format!("missing field: {}", field)))
        }
        Some(Value::String(s)) => s.trim().to_string(),
        Some(Value::Number(n)) => n.to_string(),
        Some(_) => {
            return Err(ProtocolError::ProtocolFormat(format!(
                "{} must be a string or number",
                field
            )))
        }
    };

    if text.is_empty() {
        return Err(ProtocolError::ProtocolFormat(format!("empty field: {}", field)));
    }
    Ok(text)
}

/// Body of the server's phase-1 reply
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChallengeResponse {
    pub public_key: String,
    #[serde(rename = "clienttime")]
    pub client_time: Value,
    #[serde(rename = "servertime")]
    pub server_time: i64,
    pub url: String,
}

impl ChallengeResponse {
    /// Convert into an envelope body map
    pub fn into_body(self) -> Result<Map<String, Value>, ProtocolError> {
        match serde_json::to_value(self) {
            Ok(Value::Object(map)) => Ok(map),
            Ok(_) => Err(ProtocolError::Internal(
                "challenge response did not serialize to an object".to_string(),
            )),
            Err(e) => Err(ProtocolError::Internal(e.to_string())),
        }
    }
}

/// Result of a phase-1 exchange
#[derive(Debug, Clone)]
pub enum PhaseOneOutcome {
    /// A session was opened; send this envelope back
    Challenge(Envelope),
    /// The report is already on file
    NothingToDo,
}

// ============================================================================
// Conversation Session
// ============================================================================

/// Conversation state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    /// Phase-1 request accepted, no key material issued yet
    Init,
    /// Key pair issued, waiting for the upload
    Challenged,
    /// Token verified in phase 2
    Authenticated,
    /// Report stored
    Committed,
    /// Terminal failure
    Rejected,
    /// Phase 2 arrived after the deadline
    Expired,
}

impl SessionState {
    /// Whether a transition from `self` to `next` is allowed
    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (Init, Challenged)
                | (Init, Rejected)
                | (Challenged, Authenticated)
                | (Challenged, Rejected)
                | (Challenged, Expired)
                | (Authenticated, Committed)
                | (Authenticated, Rejected)
        )
    }
}

/// Server-side state of one conversation, keyed by its token
#[derive(Clone)]
pub struct ConversationSession {
    pub token: String,
    pub public_key: RsaPublicKey,
    /// PEM form sent to the client; the token is derived from it
    pub public_key_pem: String,
    pub private_key: RsaPrivateKey,
    pub created_at: DateTime<Utc>,
    pub tool_name: String,
    pub version: String,
    pub expected_checksum: String,
    pub client_time: Value,
    state: SessionState,
}

impl ConversationSession {
    pub fn new(
        token: String,
        key_pair: KeyPair,
        tool_name: String,
        request: &ChallengeRequest,
    ) -> Self {
        Self {
            token,
            public_key: key_pair.public_key,
            public_key_pem: key_pair.public_key_pem,
            private_key: key_pair.private_key,
            created_at: Utc::now(),
            tool_name,
            version: request.version.clone(),
            expected_checksum: request.checksum.clone(),
            client_time: request.client_time.clone(),
            state: SessionState::Init,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Move to `next`, refusing transitions the state machine does not allow
    pub fn advance(&mut self, next: SessionState) -> Result<(), ProtocolError> {
        if !self.state.can_transition_to(next) {
            return Err(ProtocolError::Internal(format!(
                "invalid session transition {:?} -> {:?}",
                self.state, next
            )));
        }
        self.state = next;
        Ok(())
    }

    /// A session is expired once `timeout` has elapsed since creation
    pub fn is_expired_at(&self, now: DateTime<Utc>, timeout: chrono::Duration) -> bool {
        now >= self.created_at + timeout
    }

    pub fn record_key(&self) -> RecordKey {
        RecordKey {
            tool_name: self.tool_name.clone(),
            version: self.version.clone(),
            checksum: self.expected_checksum.clone(),
        }
    }

    /// Short token prefix for log lines
    pub fn token_prefix(&self) -> &str {
        token_prefix(&self.token)
    }
}

impl std::fmt::Debug for ConversationSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConversationSession")
            .field("token", &self.token_prefix())
            .field("created_at", &self.created_at)
            .field("tool_name", &self.tool_name)
            .field("version", &self.version)
            .field("expected_checksum", &self.expected_checksum)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

/// First 16 characters of a token, enough to correlate log lines
pub fn token_prefix(token: &str) -> &str {
    match token.char_indices().nth(16) {
        Some((idx, _)) => &token[..idx],
        None => token,
    }
}

/// Freshly generated key material for one conversation
#[derive(Clone)]
pub struct KeyPair {
    pub private_key: RsaPrivateKey,
    pub public_key: RsaPublicKey,
    pub public_key_pem: String,
}

// ============================================================================
// Upload Types
// ============================================================================

/// One file part of a multipart submission
#[derive(Debug, Clone)]
pub struct UploadedFile {
    pub field_name: String,
    pub file_name: String,
    pub data: Vec<u8>,
}

/// Everything phase 2 received from the transport
#[derive(Debug, Clone, Default)]
pub struct UploadSubmission {
    pub files: Vec<UploadedFile>,
    /// Set when the multipart stream could not be read to the end
    pub transport_error: Option<String>,
}

/// Contents extracted from a decrypted report archive
#[derive(Debug, Clone, PartialEq)]
pub struct ExtractedReport {
    pub debug_info: String,
    pub stack_trace: String,
}

/// Result of a committed phase 2
#[derive(Debug, Clone)]
pub struct CommitReceipt {
    pub record: RecordKey,
    pub archive_location: String,
}

// ============================================================================
// Upload Records
// ============================================================================

/// Unique key of an upload record
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RecordKey {
    pub tool_name: String,
    pub version: String,
    pub checksum: String,
}

impl RecordKey {
    pub fn new(
        tool_name: impl Into<String>,
        version: impl Into<String>,
        checksum: impl Into<String>,
    ) -> Self {
        Self {
            tool_name: tool_name.into(),
            version: version.into(),
            checksum: checksum.into(),
        }
    }
}

// ============================================================================
// Error Types
// ============================================================================

/// Conversation protocol errors
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("Badly formed request: {0}")]
    ProtocolFormat(String),

    #[error("Digest mismatch")]
    Authentication,

    #[error("Report already uploaded")]
    Duplicate,

    #[error("Invalid upload: {0}")]
    UploadShape(String),

    #[error("Session error: {0}")]
    Session(String),

    #[error("Unsupported digest algorithm: {0}")]
    UnsupportedAlgorithm(String),

    #[error("Key generation failed: {0}")]
    KeyGeneration(String),

    #[error("Crypto error: {0}")]
    Crypto(String),

    #[error("Checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    #[error("Invalid archive: {0}")]
    Archive(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ProtocolError {
    /// Get HTTP status code for this error
    pub fn status_code(&self) -> axum::http::StatusCode {
        use axum::http::StatusCode;
        match self {
            Self::ProtocolFormat(_) => StatusCode::BAD_REQUEST,
            Self::Authentication => StatusCode::FORBIDDEN,
            Self::Duplicate => StatusCode::CONFLICT,
            Self::UploadShape(_) => StatusCode::BAD_REQUEST,
            Self::Session(_) => StatusCode::GONE,
            Self::UnsupportedAlgorithm(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::KeyGeneration(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Crypto(_) => StatusCode::BAD_REQUEST,
            Self::ChecksumMismatch { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            Self::Archive(_) => StatusCode::BAD_REQUEST,
            Self::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Database(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<sqlx::Error> for ProtocolError {
    fn from(e: sqlx::Error) -> Self {
        ProtocolError::Database(e.to_string())
    }
}

// ============================================================================
// Tests
// ============================================================================
