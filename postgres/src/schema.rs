//! Table definitions.
//!
//! Three tables, one per collection. The unique index on `retry_queue`
//! backs the one-live-item-per-(event, handler) rule used by upserts.

use sqlx::PgPool;

/// Statements creating every table and index, idempotently.
pub const MIGRATIONS: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS event_log (
        id TEXT PRIMARY KEY,
        event_type TEXT NOT NULL,
        event_data JSONB NOT NULL,
        "timestamp" TIMESTAMPTZ NOT NULL,
        source TEXT NOT NULL,
        processed BOOLEAN NOT NULL DEFAULT FALSE,
        created_at TIMESTAMPTZ NOT NULL,
        expires_at TIMESTAMPTZ
    )
    "#,
    r#"CREATE INDEX IF NOT EXISTS idx_event_log_type_ts ON event_log(event_type, "timestamp")"#,
    r#"CREATE INDEX IF NOT EXISTS idx_event_log_source_ts ON event_log(source, "timestamp")"#,
    r#"CREATE INDEX IF NOT EXISTS idx_event_log_ts ON event_log("timestamp")"#,
    "CREATE INDEX IF NOT EXISTS idx_event_log_expires ON event_log(expires_at)",
    r"
    CREATE TABLE IF NOT EXISTS retry_queue (
        id TEXT PRIMARY KEY,
        event_type TEXT NOT NULL,
        event_data JSONB NOT NULL,
        event_source TEXT NOT NULL,
        event_timestamp TIMESTAMPTZ NOT NULL,
        handler_name TEXT NOT NULL,
        error TEXT NOT NULL,
        attempt INTEGER NOT NULL,
        max_retries INTEGER NOT NULL,
        next_retry TIMESTAMPTZ NOT NULL,
        created_at TIMESTAMPTZ NOT NULL,
        updated_at TIMESTAMPTZ NOT NULL
    )
    ",
    r"
    CREATE UNIQUE INDEX IF NOT EXISTS idx_retry_queue_key
        ON retry_queue(event_type, event_source, event_timestamp, handler_name)
    ",
    "CREATE INDEX IF NOT EXISTS idx_retry_queue_next ON retry_queue(next_retry)",
    r"
    CREATE TABLE IF NOT EXISTS dead_letter_queue (
        id TEXT PRIMARY KEY,
        event_type TEXT NOT NULL,
        event_data JSONB NOT NULL,
        event_source TEXT NOT NULL,
        event_timestamp TIMESTAMPTZ NOT NULL,
        handler_name TEXT NOT NULL,
        error TEXT NOT NULL,
        attempt INTEGER NOT NULL,
        reason TEXT NOT NULL,
        processed BOOLEAN NOT NULL DEFAULT FALSE,
        created_at TIMESTAMPTZ NOT NULL,
        processed_at TIMESTAMPTZ
    )
    ",
    "CREATE INDEX IF NOT EXISTS idx_dead_letter_pending ON dead_letter_queue(processed, created_at DESC)",
];

/// Create the tables if they do not exist.
///
/// # Errors
///
/// Returns the first failing statement's error.
pub async fn run_migrations(pool: &PgPool) -> Result<(), sqlx::Error> {
    for statement in MIGRATIONS {
        sqlx::query(statement).execute(pool).await?;
    }
    tracing::info!(statements = MIGRATIONS.len(), "Event schema migrated");
    Ok(())
}

/// `u32` counter to an `INTEGER` column.
pub(crate) fn to_db_count(value: u32) -> i32 {
    i32::try_from(value).unwrap_or(i32::MAX)
}

/// `INTEGER` column back to a `u32` counter.
pub(crate) fn from_db_count(value: i32) -> u32 {
    u32::try_from(value).unwrap_or(0)
}

/// Pagination value for a `LIMIT` bind; `None` means no limit.
pub(crate) fn db_limit(limit: usize) -> Option<i64> {
    (limit > 0).then(|| i64::try_from(limit).unwrap_or(i64::MAX))
}
