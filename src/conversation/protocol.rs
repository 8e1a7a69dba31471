//! Conversation Protocol
//!
//! Phase 1: verify the signed envelope, short-circuit known reports, issue a
//! fresh public key and a token-bearing upload URL.
//!
//! Phase 2: check the upload shape, consume the session, reserve the record,
//! decrypt and verify the archive, then complete or roll back the
//! reservation.

use std::sync::Arc;

use chrono::Utc;

use super::archive::extract_report;
use super::dedup::DeduplicationStore;
use super::digest::DigestService;
use super::keys::KeyExchangeService;
use super::session::SessionManager;
use super::types::{
    token_prefix, ChallengeRequest, ChallengeResponse, CommitReceipt, ConversationSession,
    Envelope, PhaseOneOutcome, ProtocolError, RecordKey, SessionState, UploadSubmission,
    TOKEN_QUERY_PARAM,
};
use super::validator::UploadValidator;
use crate::config::ProtocolConfig;
use crate::storage::ArchiveStore;

/// Interval of the session/reservation maintenance task
const MAINTENANCE_INTERVAL_SECS: u64 = 300;

#[derive(Clone)]
pub struct ConversationProtocol {
    inner: Arc<ConversationProtocolInner>,
}

struct ConversationProtocolInner {
    digest: DigestService,
    keys: KeyExchangeService,
    validator: UploadValidator,
    sessions: SessionManager,
    store: Arc<dyn DeduplicationStore>,
    archives: Arc<dyn ArchiveStore>,
    tool_name: String,
    token_salt: String,
    upload_url: String,
}

impl ConversationProtocol {
    /// Build the protocol handler. Fails if the digest algorithm is unsupported.
    pub fn new(
        config: &ProtocolConfig,
        store: Arc<dyn DeduplicationStore>,
        archives: Arc<dyn ArchiveStore>,
    ) -> Result<Self, ProtocolError> {
        let digest = DigestService::new(&config.digest_method, config.shared_salt.clone())?;

        Ok(Self {
            inner: Arc::new(ConversationProtocolInner {
                digest,
                keys: KeyExchangeService::new(),
                validator: UploadValidator::new(config.max_upload_bytes),
                sessions: SessionManager::new(config.session_timeout()),
                store,
                archives,
                tool_name: config.tool_name.clone(),
                token_salt: config.token_salt.clone(),
                upload_url: config.upload_url.clone(),
            }),
        })
    }

    pub fn digest(&self) -> &DigestService {
        &self.inner.digest
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.inner.sessions
    }

    pub fn tool_name(&self) -> &str {
        &self.inner.tool_name
    }

    /// Token for a public key: its digest under the token salt
    pub fn token_for(&self, public_key_pem: &str) -> Result<String, ProtocolError> {
        self.inner
            .digest
            .digest_with_salt(public_key_pem, &self.inner.token_salt)
    }

    /// Phase-2 URL for `token`
    pub fn upload_url(&self, token: &str) -> String {
        let base = &self.inner.upload_url;
        let separator = if base.contains('?') { '&' } else { '?' };
        format!(
            "{}{}{}={}",
            base,
            separator,
            TOKEN_QUERY_PARAM,
            urlencoding::encode(token)
        )
    }

    // ========================================================================
    // Phase 1
    // ========================================================================

    /// Handle a phase-1 envelope
    pub async fn begin(&self, envelope: &Envelope) -> Result<PhaseOneOutcome, ProtocolError> {
        let request = ChallengeRequest::from_body(&envelope.body)?;

        if !envelope.verify(&self.inner.digest)? {
            tracing::warn!(version = %request.version, "Phase 1 digest mismatch, dropping request");
            return Err(ProtocolError::Authentication);
        }

        let key = RecordKey::new(
            self.inner.tool_name.clone(),
            request.version.clone(),
            request.checksum.clone(),
        );
        if let Some(seen_at) = self.inner.store.check_for_record(&key).await? {
            tracing::info!(
                version = %key.version,
                checksum = %key.checksum,
                seen_at = %seen_at,
                "Report already on file"
            );
            return Ok(PhaseOneOutcome::NothingToDo);
        }

        let key_pair = self.inner.keys.generate_key_pair_async().await?;
        let token = self.token_for(&key_pair.public_key_pem)?;
        let public_key_pem = key_pair.public_key_pem.clone();

        let mut session = ConversationSession::new(
            token.clone(),
            key_pair,
            self.inner.tool_name.clone(),
            &request,
        );
        session.advance(SessionState::Challenged)?;

        let response = ChallengeResponse {
            public_key: public_key_pem,
            client_time: request.client_time.clone(),
            server_time: session.created_at.timestamp(),
            url: self.upload_url(&token),
        };
        let reply = Envelope::sign(response.into_body()?, &self.inner.digest)?;

        self.inner.sessions.create_session(session).await?;

        Ok(PhaseOneOutcome::Challenge(reply))
    }

    // ========================================================================
    // Phase 2
    // ========================================================================

    /// Handle a phase-2 upload for `token`
    pub async fn complete(
        &self,
        token: &str,
        submission: UploadSubmission,
    ) -> Result<CommitReceipt, ProtocolError> {
        let file = self.inner.validator.validate(submission)?;

        let mut session = self.inner.sessions.take_session(token).await.map_err(|e| {
            tracing::info!(token = %token_prefix(token), "Upload for unknown session");
            e
        })?;

        if session.is_expired_at(Utc::now(), self.inner.sessions.timeout()) {
            session.advance(SessionState::Expired)?;
            tracing::info!(
                token = %session.token_prefix(),
                created_at = %session.created_at,
                "Upload arrived after session timeout"
            );
            return Err(ProtocolError::Session("session expired".to_string()));
        }

        let expected_token = self.token_for(&session.public_key_pem)?;
        if !DigestService::digests_match(&expected_token, token) {
            session.advance(SessionState::Rejected)?;
            tracing::warn!(
                token = %token_prefix(token),
                "Token does not match session key, session destroyed"
            );
            return Err(ProtocolError::Session("token does not match session".to_string()));
        }
        session.advance(SessionState::Authenticated)?;

        // Reserve, commit and roll back in a task of their own, so a client
        // that hangs up mid-upload cannot leave the reservation behind
        let protocol = self.clone();
        tokio::spawn(async move { protocol.reserve_and_commit(session, file.data).await })
            .await
            .map_err(|e| ProtocolError::Internal(format!("commit task failed: {}", e)))?
    }

    async fn reserve_and_commit(
        &self,
        mut session: ConversationSession,
        ciphertext: Vec<u8>,
    ) -> Result<CommitReceipt, ProtocolError> {
        let key = session.record_key();
        if !self.inner.store.check_and_create_record(&key).await? {
            session.advance(SessionState::Rejected)?;
            tracing::info!(
                version = %key.version,
                checksum = %key.checksum,
                "Lost reservation race, report already uploaded"
            );
            return Err(ProtocolError::Duplicate);
        }

        match self.commit(&session, &key, ciphertext).await {
            Ok(archive_location) => {
                session.advance(SessionState::Committed)?;
                tracing::info!(
                    token = %session.token_prefix(),
                    version = %key.version,
                    checksum = %key.checksum,
                    archive = %archive_location,
                    "Crash report stored"
                );
                Ok(CommitReceipt {
                    record: key,
                    archive_location,
                })
            }
            Err(e) => {
                if let Err(rollback_err) = self.inner.store.remove_record(&key).await {
                    tracing::error!(
                        version = %key.version,
                        checksum = %key.checksum,
                        error = %rollback_err,
                        "Failed to roll back reservation"
                    );
                }
                session.advance(SessionState::Rejected)?;
                Err(e)
            }
        }
    }

    /// Steps run while holding the reservation. Any error leaves the archive
    /// store as it was; the caller removes the reservation.
    async fn commit(
        &self,
        session: &ConversationSession,
        key: &RecordKey,
        ciphertext: Vec<u8>,
    ) -> Result<String, ProtocolError> {
        let location = self.inner.archives.persist(&ciphertext).await?;

        let result: Result<(), ProtocolError> = async {
            let plain = self
                .inner
                .keys
                .decrypt_async(ciphertext, session.private_key.clone())
                .await?;
            let report = extract_report(&plain)?;

            let actual = self.inner.digest.checksum(&report.stack_trace)?;
            if !DigestService::digests_match(&session.expected_checksum, &actual) {
                tracing::warn!(
                    token = %session.token_prefix(),
                    expected = %session.expected_checksum,
                    actual = %actual,
                    "Uploaded stack trace does not match promised checksum"
                );
                return Err(ProtocolError::ChecksumMismatch {
                    expected: session.expected_checksum.clone(),
                    actual,
                });
            }

            self.inner.store.update_record(key, &report, &location).await
        }
        .await;

        if let Err(e) = result {
            if let Err(discard_err) = self.inner.archives.discard(&location).await {
                tracing::error!(
                    archive = %location,
                    error = %discard_err,
                    "Failed to discard archive"
                );
            }
            return Err(e);
        }

        Ok(location)
    }

    // ========================================================================
    // Maintenance
    // ========================================================================

    /// Reap expired sessions and reservations nobody will complete
    pub async fn run_maintenance(&self) -> Result<(), ProtocolError> {
        self.inner.sessions.cleanup_expired().await;

        let cutoff = Utc::now() - self.inner.sessions.timeout();
        self.inner.store.purge_stale_reservations(cutoff).await?;
        Ok(())
    }

    /// Start background maintenance task
    pub fn start_maintenance_task(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(std::time::Duration::from_secs(MAINTENANCE_INTERVAL_SECS));

            loop {
                interval.tick().await;
                if let Err(e) = self.run_maintenance().await {
                    tracing::error!(error = %e, "Maintenance pass failed");
                }
            }
        })
    }
}
