//! Conversation Session Manager
//!
//! Holds the sessions opened by phase 1, keyed by token:
//! - In-memory storage behind an async RwLock
//! - `take_session` removes on lookup, so a session serves one phase 2 at most
//! - Expired sessions are reaped by the maintenance task

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::RwLock;

use super::types::{ConversationSession, ProtocolError, SessionState};

// ============================================================================
// Session Manager
// ============================================================================

/// Manages conversation sessions
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<SessionManagerInner>,
}

struct SessionManagerInner {
    /// Open sessions indexed by token
    sessions: RwLock<HashMap<String, ConversationSession>>,

    /// Phase 2 must arrive within this long of phase 1
    timeout: chrono::Duration,
}

impl SessionManager {
    /// Create a new session manager
    pub fn new(timeout: chrono::Duration) -> Self {
        Self {
            inner: Arc::new(SessionManagerInner {
                sessions: RwLock::new(HashMap::new()),
                timeout,
            }),
        }
    }

    pub fn timeout(&self) -> chrono::Duration {
        self.inner.timeout
    }

    // ========================================================================
    // Session Lifecycle
    // ========================================================================

    /// Store a session opened by phase 1
    pub async fn create_session(&self, session: ConversationSession) -> Result<(), ProtocolError> {
        if session.state() != SessionState::Challenged {
            return Err(ProtocolError::Internal(format!(
                "refusing to store session in state {:?}",
                session.state()
            )));
        }

        let mut sessions = self.inner.sessions.write().await;
        if sessions.contains_key(&session.token) {
            return Err(ProtocolError::Internal("token collision".to_string()));
        }

        tracing::info!(
            token = %session.token_prefix(),
            version = %session.version,
            checksum = %session.expected_checksum,
            "Opened conversation session"
        );

        sessions.insert(session.token.clone(), session);
        Ok(())
    }

    /// Remove and return the session for `token`.
    ///
    /// Whatever happens afterwards, the session cannot be used again.
    pub async fn take_session(&self, token: &str) -> Result<ConversationSession, ProtocolError> {
        let mut sessions = self.inner.sessions.write().await;
        sessions
            .remove(token)
            .ok_or_else(|| ProtocolError::Session("unknown or expired token".to_string()))
    }

    pub async fn contains(&self, token: &str) -> bool {
        let sessions = self.inner.sessions.read().await;
        sessions.contains_key(token)
    }

    pub async fn session_count(&self) -> usize {
        let sessions = self.inner.sessions.read().await;
        sessions.len()
    }

    // ========================================================================
    // Cleanup
    // ========================================================================

    /// Drop sessions past the timeout.
    ///
    /// Returns the number of sessions cleaned up
    pub async fn cleanup_expired(&self) -> usize {
        let now = Utc::now();
        let timeout = self.inner.timeout;

        let mut sessions = self.inner.sessions.write().await;
        let before = sessions.len();
        sessions.retain(|_, session| {
            let expired = session.is_expired_at(now, timeout);
            if expired {
                tracing::debug!(
                    token = %session.token_prefix(),
                    version = %session.version,
                    "Reaped expired conversation session"
                );
            }
            !expired
        });
        let count = before - sessions.len();

        if count > 0 {
            tracing::info!(count = count, "Cleaned up expired conversation sessions");
        }

        count
    }
}

// ============================================================================
// Tests
// ============================================================================
