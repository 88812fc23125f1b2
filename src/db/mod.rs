pub mod gateway;
pub mod models;
pub mod run_lock;

use chrono::{DateTime, SecondsFormat, Utc};

use crate::error::{AppError, Result};

pub use gateway::{PersistenceGateway, SqliteGateway};
pub use run_lock::{LockToken, MemoryRunLock, RunLock, SqliteRunLock};

/// Opens (creating if needed) the database and applies migrations.
pub async fn connect(db_path: &str) -> Result<sqlx::SqlitePool> {
    let pool = sqlx::SqlitePool::connect(&format!("sqlite:{db_path}?mode=rwc")).await?;
    sqlx::migrate!("./migrations").run(&pool).await?;
    Ok(pool)
}

/// Fixed-width RFC 3339 so stored timestamps compare correctly as text.
pub fn format_ts(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub fn parse_ts(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|e| AppError::Store(format!("invalid timestamp '{s}': {e}")))
}
