//! SQLite persistence for the upload log

mod schema;
mod upload_log;

pub use schema::*;
pub use upload_log::*;

use std::str::FromStr;
use std::time::Duration;

use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous,
};

use crate::error::Result;

const MAX_CONNECTIONS: u32 = 5;

/// Racing reservations wait on the write lock this long before failing
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

fn connect_options(database_url: &str) -> Result<SqliteConnectOptions> {
    Ok(SqliteConnectOptions::from_str(database_url)?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Normal)
        .busy_timeout(BUSY_TIMEOUT))
}

/// Open the pool and make sure the schema exists
pub async fn create_pool(database_url: &str) -> Result<SqlitePool> {
    let pool = SqlitePoolOptions::new()
        .max_connections(MAX_CONNECTIONS)
        .connect_with(connect_options(database_url)?)
        .await?;

    initialize_schema(&pool).await?;
    tracing::debug!(url = %database_url, "Upload log ready");

    Ok(pool)
}
