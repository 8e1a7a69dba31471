//! Application state management

use std::sync::Arc;

use sqlx::SqlitePool;

use crate::config::Config;
use crate::conversation::{ConversationProtocol, ProtocolError};
use crate::db::SqliteUploadLog;
use crate::storage::ArchiveStore;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    pub config: Config,
    pub upload_log: SqliteUploadLog,
    pub protocol: ConversationProtocol,
}

impl AppState {
    /// Create a new application state
    ///
    /// The upload log is created once here over `db` and shared by every
    /// request.
    pub fn new(
        config: Config,
        db: SqlitePool,
        archives: Arc<dyn ArchiveStore>,
    ) -> Result<Self, ProtocolError> {
        let upload_log = SqliteUploadLog::new(db);
        let protocol =
            ConversationProtocol::new(&config.protocol, Arc::new(upload_log.clone()), archives)?;

        Ok(Self {
            inner: Arc::new(AppStateInner {
                config,
                upload_log,
                protocol,
            }),
        })
    }

    /// Get the configuration
    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// Get the upload log
    pub fn upload_log(&self) -> &SqliteUploadLog {
        &self.inner.upload_log
    }

    /// Get the conversation protocol handler
    pub fn protocol(&self) -> &ConversationProtocol {
        &self.inner.protocol
    }
}
