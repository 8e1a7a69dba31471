//! Database schema initialization

use sqlx::SqlitePool;

use crate::error::Result;

/// Initialize the database schema
pub async fn initialize_schema(pool: &SqlitePool) -> Result<()> {
    sqlx::query(SCHEMA_SQL)
        .execute(pool)
        .await?;

    Ok(())
}

const SCHEMA_SQL: &str = r#"
-- One row per distinct crash report. A row with NULL completed_at is a
-- reservation held by an in-flight upload.
CREATE TABLE IF NOT EXISTS upload_log (
    toolname TEXT NOT NULL,
    version TEXT NOT NULL,
    checksum TEXT NOT NULL,
    created_at TEXT NOT NULL,
    debug_info TEXT,
    stack_trace TEXT,
    archive_location TEXT,
    completed_at TEXT,

    PRIMARY KEY (toolname, version, checksum)
);

CREATE INDEX IF NOT EXISTS idx_upload_log_created_at ON upload_log(created_at);
CREATE INDEX IF NOT EXISTS idx_upload_log_pending ON upload_log(completed_at) WHERE completed_at IS NULL;
"#;
