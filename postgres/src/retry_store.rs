//! `PostgreSQL` retry queue storage.

use crate::schema::{db_limit, from_db_count, to_db_count};
use chrono::{DateTime, Utc};
use eventline_core::queue::{QueueError, RetryItem, RetryStore};
use futures::future::BoxFuture;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};

const COLUMNS: &str = "id, event_type, event_data, event_source, event_timestamp, handler_name, \
                       error, attempt, max_retries, next_retry, created_at, updated_at";

/// Retry items in the `retry_queue` table.
///
/// The unique index on (event type, source, timestamp, handler) turns
/// [`RetryStore::upsert`] into a single `INSERT … ON CONFLICT` statement.
#[derive(Clone)]
pub struct PostgresRetryStore {
    pool: PgPool,
}

impl PostgresRetryStore {
    /// Wrap an existing pool.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

pub(crate) fn storage_error(e: sqlx::Error) -> QueueError {
    QueueError::Storage(e.to_string())
}

fn retry_item(row: &PgRow) -> Result<RetryItem, QueueError> {
    Ok(RetryItem {
        id: row.try_get("id").map_err(storage_error)?,
        event_type: row.try_get("event_type").map_err(storage_error)?,
        event_data: row.try_get("event_data").map_err(storage_error)?,
        event_source: row.try_get("event_source").map_err(storage_error)?,
        event_timestamp: row.try_get("event_timestamp").map_err(storage_error)?,
        handler_name: row.try_get("handler_name").map_err(storage_error)?,
        error: row.try_get("error").map_err(storage_error)?,
        attempt: from_db_count(row.try_get("attempt").map_err(storage_error)?),
        max_retries: from_db_count(row.try_get("max_retries").map_err(storage_error)?),
        next_retry: row.try_get("next_retry").map_err(storage_error)?,
        created_at: row.try_get("created_at").map_err(storage_error)?,
        updated_at: row.try_get("updated_at").map_err(storage_error)?,
    })
}

impl RetryStore for PostgresRetryStore {
    fn upsert(&self, item: RetryItem) -> BoxFuture<'_, Result<RetryItem, QueueError>> {
        Box::pin(async move {
            let row = sqlx::query(&format!(
                r"
                INSERT INTO retry_queue ({COLUMNS})
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
                ON CONFLICT (event_type, event_source, event_timestamp, handler_name)
                DO UPDATE SET
                    error = EXCLUDED.error,
                    attempt = EXCLUDED.attempt,
                    max_retries = EXCLUDED.max_retries,
                    next_retry = EXCLUDED.next_retry,
                    updated_at = EXCLUDED.updated_at
                RETURNING {COLUMNS}
                "
            ))
            .bind(&item.id)
            .bind(&item.event_type)
            .bind(&item.event_data)
            .bind(&item.event_source)
            .bind(item.event_timestamp)
            .bind(&item.handler_name)
            .bind(&item.error)
            .bind(to_db_count(item.attempt))
            .bind(to_db_count(item.max_retries))
            .bind(item.next_retry)
            .bind(item.created_at)
            .bind(item.updated_at)
            .fetch_one(&self.pool)
            .await
            .map_err(storage_error)?;
            retry_item(&row)
        })
    }

    fn get<'a>(&'a self, id: &'a str) -> BoxFuture<'a, Result<Option<RetryItem>, QueueError>> {
        Box::pin(async move {
            let row = sqlx::query(&format!("SELECT {COLUMNS} FROM retry_queue WHERE id = $1"))
                .bind(id)
                .fetch_optional(&self.pool)
                .await
                .map_err(storage_error)?;
            row.as_ref().map(retry_item).transpose()
        })
    }

    fn due(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> BoxFuture<'_, Result<Vec<RetryItem>, QueueError>> {
        Box::pin(async move {
            // LIMIT NULL is LIMIT ALL
            let rows = sqlx::query(&format!(
                "SELECT {COLUMNS} FROM retry_queue \
                 WHERE next_retry <= $1 ORDER BY next_retry ASC LIMIT $2"
            ))
            .bind(now)
            .bind(db_limit(limit))
            .fetch_all(&self.pool)
            .await
            .map_err(storage_error)?;
            rows.iter().map(retry_item).collect()
        })
    }

    fn update_attempt<'a>(
        &'a self,
        id: &'a str,
        next_retry: DateTime<Utc>,
        attempt: u32,
        error: Option<&'a str>,
        now: DateTime<Utc>,
    ) -> BoxFuture<'a, Result<(), QueueError>> {
        Box::pin(async move {
            let result = sqlx::query(
                r"
                UPDATE retry_queue
                SET next_retry = $2, attempt = $3, error = COALESCE($4, error), updated_at = $5
                WHERE id = $1
                ",
            )
            .bind(id)
            .bind(next_retry)
            .bind(to_db_count(attempt))
            .bind(error)
            .bind(now)
            .execute(&self.pool)
            .await
            .map_err(storage_error)?;
            if result.rows_affected() == 0 {
                return Err(QueueError::NotFound(id.to_string()));
            }
            Ok(())
        })
    }

    fn remove<'a>(&'a self, id: &'a str) -> BoxFuture<'a, Result<bool, QueueError>> {
        Box::pin(async move {
            let result = sqlx::query("DELETE FROM retry_queue WHERE id = $1")
                .bind(id)
                .execute(&self.pool)
                .await
                .map_err(storage_error)?;
            Ok(result.rows_affected() > 0)
        })
    }

    fn count(&self) -> BoxFuture<'_, Result<u64, QueueError>> {
        Box::pin(async move {
            let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM retry_queue")
                .fetch_one(&self.pool)
                .await
                .map_err(storage_error)?;
            Ok(u64::try_from(count).unwrap_or(0))
        })
    }

    fn cleanup(&self, before: DateTime<Utc>) -> BoxFuture<'_, Result<u64, QueueError>> {
        Box::pin(async move {
            let result = sqlx::query("DELETE FROM retry_queue WHERE created_at < $1")
                .bind(before)
                .execute(&self.pool)
                .await
                .map_err(storage_error)?;
            Ok(result.rows_affected())
        })
    }
}
