//! SQLite storage layer -- connection pool, schema, time helpers.

pub mod schema;

use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, TimeZone, Utc};
use r2d2::Pool as R2D2Pool;
use r2d2_sqlite::SqliteConnectionManager;

use crate::error::{Result as SentinelResult, SentinelError};

/// Connection Pool type
pub type Pool = R2D2Pool<SqliteConnectionManager>;

/// Open (or create) the SQLite database and return a connection pool.
pub fn open_pool(path: impl AsRef<Path>) -> Result<Pool> {
    let path = path.as_ref();
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
    }

    let manager = SqliteConnectionManager::file(path).with_init(|c| {
        c.execute_batch(
            "PRAGMA journal_mode = WAL;
                 PRAGMA synchronous = NORMAL;
                 PRAGMA temp_store = MEMORY;
                 PRAGMA foreign_keys = ON;
                 PRAGMA busy_timeout = 5000;",
        )
    });

    let pool = R2D2Pool::new(manager)?;

    // Run migrations on a single connection
    let conn = pool.get()?;
    schema::migrate(&conn)?;

    Ok(pool)
}

/// Timestamps are stored as epoch milliseconds so window filters are integer compares.
pub fn to_millis(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_millis()
}

pub fn from_millis(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_default()
}

/// Start of a look-back window of `hours` ending at `now`.
///
/// Negative or unrepresentable spans are a validation error.
pub fn hours_before(now: DateTime<Utc>, hours: i64) -> SentinelResult<DateTime<Utc>> {
    window_start(now, hours, Duration::try_hours(hours), "hours")
}

/// Start of a look-back window of `minutes` ending at `now`.
pub fn minutes_before(now: DateTime<Utc>, minutes: i64) -> SentinelResult<DateTime<Utc>> {
    window_start(now, minutes, Duration::try_minutes(minutes), "minutes")
}

fn window_start(
    now: DateTime<Utc>,
    amount: i64,
    span: Option<Duration>,
    unit: &str,
) -> SentinelResult<DateTime<Utc>> {
    if amount < 0 {
        return Err(SentinelError::Validation(format!("{unit} must not be negative, got {amount}")));
    }
    span.and_then(|span| now.checked_sub_signed(span))
        .ok_or_else(|| SentinelError::Validation(format!("{unit} out of range: {amount}")))
}

#[cfg(test)]
pub(crate) fn test_pool() -> (tempfile::TempDir, Pool) {
    let dir = tempfile::TempDir::new().unwrap();
    let pool = open_pool(dir.path().join("sentinel.db")).unwrap();
    (dir, pool)
}
