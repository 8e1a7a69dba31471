//! Upload log database operations
//!
//! SQLite implementation of the deduplication store. The primary key on
//! `(toolname, version, checksum)` is what makes `check_and_create_record`
//! atomic: concurrent inserts for one key serialize on the write lock and
//! all but the first are ignored.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;

use crate::conversation::dedup::DeduplicationStore;
use crate::conversation::types::{ExtractedReport, ProtocolError, RecordKey};

/// Upload log record
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct UploadRecord {
    pub toolname: String,
    pub version: String,
    pub checksum: String,
    pub created_at: String,
    pub debug_info: Option<String>,
    pub stack_trace: Option<String>,
    pub archive_location: Option<String>,
    pub completed_at: Option<String>,
}

impl UploadRecord {
    /// Still an open reservation
    pub fn is_reservation(&self) -> bool {
        self.completed_at.is_none()
    }
}

/// Upload log repository
#[derive(Clone)]
pub struct SqliteUploadLog {
    pool: SqlitePool,
}

impl SqliteUploadLog {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Fetch the full record for `key`
    pub async fn get_record(&self, key: &RecordKey) -> Result<Option<UploadRecord>, ProtocolError> {
        let record = sqlx::query_as::<_, UploadRecord>(
            r#"
            SELECT toolname, version, checksum, created_at, debug_info,
                   stack_trace, archive_location, completed_at
            FROM upload_log
            WHERE toolname = ? AND version = ? AND checksum = ?
            "#,
        )
        .bind(&key.tool_name)
        .bind(&key.version)
        .bind(&key.checksum)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    /// Number of rows, reservations included
    pub async fn count(&self) -> Result<i64, ProtocolError> {
        let count = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM upload_log")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }
}

fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

#[async_trait::async_trait]
impl DeduplicationStore for SqliteUploadLog {
    async fn check_for_record(&self, key: &RecordKey) -> Result<Option<DateTime<Utc>>, ProtocolError> {
        let created_at = sqlx::query_scalar::<_, String>(
            r#"
            SELECT created_at FROM upload_log
            WHERE toolname = ? AND version = ? AND checksum = ?
            "#,
        )
        .bind(&key.tool_name)
        .bind(&key.version)
        .bind(&key.checksum)
        .fetch_optional(&self.pool)
        .await?;

        created_at
            .map(|raw| {
                DateTime::parse_from_rfc3339(&raw)
                    .map(|dt| dt.with_timezone(&Utc))
                    .map_err(|e| ProtocolError::Database(format!("bad created_at '{}': {}", raw, e)))
            })
            .transpose()
    }

    async fn check_and_create_record(&self, key: &RecordKey) -> Result<bool, ProtocolError> {
        let result = sqlx::query(
            r#"
            INSERT INTO upload_log (toolname, version, checksum, created_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(toolname, version, checksum) DO NOTHING
            "#,
        )
        .bind(&key.tool_name)
        .bind(&key.version)
        .bind(&key.checksum)
        .bind(timestamp(Utc::now()))
        .execute(&self.pool)
        .await?;

        let created = result.rows_affected() == 1;
        tracing::debug!(
            version = %key.version,
            checksum = %key.checksum,
            created = created,
            "Reservation attempt"
        );
        Ok(created)
    }

    async fn update_record(
        &self,
        key: &RecordKey,
        report: &ExtractedReport,
        archive_location: &str,
    ) -> Result<(), ProtocolError> {
        let result = sqlx::query(
            r#"
            UPDATE upload_log
            SET debug_info = ?,
                stack_trace = ?,
                archive_location = ?,
                completed_at = ?
            WHERE toolname = ? AND version = ? AND checksum = ?
              AND completed_at IS NULL
            "#,
        )
        .bind(&report.debug_info)
        .bind(&report.stack_trace)
        .bind(archive_location)
        .bind(timestamp(Utc::now()))
        .bind(&key.tool_name)
        .bind(&key.version)
        .bind(&key.checksum)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() != 1 {
            return Err(ProtocolError::Database(format!(
                "no open reservation for {} {} {}",
                key.tool_name, key.version, key.checksum
            )));
        }
        Ok(())
    }

    async fn remove_record(&self, key: &RecordKey) -> Result<(), ProtocolError> {
        // Only reservations are rolled back; completed reports stay
        sqlx::query(
            r#"
            DELETE FROM upload_log
            WHERE toolname = ? AND version = ? AND checksum = ?
              AND completed_at IS NULL
            "#,
        )
        .bind(&key.tool_name)
        .bind(&key.version)
        .bind(&key.checksum)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn purge_stale_reservations(&self, cutoff: DateTime<Utc>) -> Result<u64, ProtocolError> {
        let result = sqlx::query(
            r#"
            DELETE FROM upload_log
            WHERE completed_at IS NULL AND created_at < ?
            "#,
        )
        .bind(timestamp(cutoff))
        .execute(&self.pool)
        .await?;

        let purged = result.rows_affected();
        if purged > 0 {
            tracing::warn!(count = purged, "Purged stale upload reservations");
        }
        Ok(purged)
    }
}

// ============================================================================
// Tests
// ============================================================================
