//! `PostgreSQL` dead letter storage.

use crate::retry_store::storage_error;
use crate::schema::{db_limit, from_db_count, to_db_count};
use chrono::{DateTime, Utc};
use eventline_core::queue::{DeadLetterItem, DeadLetterStore, QueueError};
use futures::future::BoxFuture;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};

const COLUMNS: &str = "id, event_type, event_data, event_source, event_timestamp, handler_name, \
                       error, attempt, reason, processed, created_at, processed_at";

/// Dead letters in the `dead_letter_queue` table.
#[derive(Clone)]
pub struct PostgresDeadLetterStore {
    pool: PgPool,
}

impl PostgresDeadLetterStore {
    /// Wrap an existing pool.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn dead_letter_item(row: &PgRow) -> Result<DeadLetterItem, QueueError> {
    Ok(DeadLetterItem {
        id: row.try_get("id").map_err(storage_error)?,
        event_type: row.try_get("event_type").map_err(storage_error)?,
        event_data: row.try_get("event_data").map_err(storage_error)?,
        event_source: row.try_get("event_source").map_err(storage_error)?,
        event_timestamp: row.try_get("event_timestamp").map_err(storage_error)?,
        handler_name: row.try_get("handler_name").map_err(storage_error)?,
        error: row.try_get("error").map_err(storage_error)?,
        attempt: from_db_count(row.try_get("attempt").map_err(storage_error)?),
        reason: row.try_get("reason").map_err(storage_error)?,
        processed: row.try_get("processed").map_err(storage_error)?,
        created_at: row.try_get("created_at").map_err(storage_error)?,
        processed_at: row.try_get("processed_at").map_err(storage_error)?,
    })
}

impl DeadLetterStore for PostgresDeadLetterStore {
    fn insert(&self, item: DeadLetterItem) -> BoxFuture<'_, Result<(), QueueError>> {
        Box::pin(async move {
            sqlx::query(&format!(
                "INSERT INTO dead_letter_queue ({COLUMNS}) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)"
            ))
            .bind(&item.id)
            .bind(&item.event_type)
            .bind(&item.event_data)
            .bind(&item.event_source)
            .bind(item.event_timestamp)
            .bind(&item.handler_name)
            .bind(&item.error)
            .bind(to_db_count(item.attempt))
            .bind(&item.reason)
            .bind(item.processed)
            .bind(item.created_at)
            .bind(item.processed_at)
            .execute(&self.pool)
            .await
            .map_err(storage_error)?;
            Ok(())
        })
    }

    #[allow(clippy::cast_possible_wrap)]
    fn list_unprocessed(
        &self,
        limit: usize,
        offset: usize,
    ) -> BoxFuture<'_, Result<Vec<DeadLetterItem>, QueueError>> {
        Box::pin(async move {
            let rows = sqlx::query(&format!(
                "SELECT {COLUMNS} FROM dead_letter_queue WHERE processed = FALSE \
                 ORDER BY created_at DESC LIMIT $1 OFFSET $2"
            ))
            .bind(db_limit(limit))
            .bind(offset as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(storage_error)?;
            rows.iter().map(dead_letter_item).collect()
        })
    }

    fn get<'a>(
        &'a self,
        id: &'a str,
    ) -> BoxFuture<'a, Result<Option<DeadLetterItem>, QueueError>> {
        Box::pin(async move {
            let row =
                sqlx::query(&format!("SELECT {COLUMNS} FROM dead_letter_queue WHERE id = $1"))
                    .bind(id)
                    .fetch_optional(&self.pool)
                    .await
                    .map_err(storage_error)?;
            row.as_ref().map(dead_letter_item).transpose()
        })
    }

    fn mark_processed<'a>(
        &'a self,
        id: &'a str,
        at: DateTime<Utc>,
    ) -> BoxFuture<'a, Result<(), QueueError>> {
        Box::pin(async move {
            let result = sqlx::query(
                "UPDATE dead_letter_queue SET processed = TRUE, processed_at = $2 WHERE id = $1",
            )
            .bind(id)
            .bind(at)
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
            let result = sqlx::query("DELETE FROM dead_letter_queue WHERE id = $1")
                .bind(id)
                .execute(&self.pool)
                .await
                .map_err(storage_error)?;
            Ok(result.rows_affected() > 0)
        })
    }

    fn count_unprocessed(&self) -> BoxFuture<'_, Result<u64, QueueError>> {
        Box::pin(async move {
            let count: i64 =
                sqlx::query_scalar("SELECT COUNT(*) FROM dead_letter_queue WHERE processed = FALSE")
                    .fetch_one(&self.pool)
                    .await
                    .map_err(storage_error)?;
            Ok(u64::try_from(count).unwrap_or(0))
        })
    }

    fn cleanup(&self, before: DateTime<Utc>) -> BoxFuture<'_, Result<u64, QueueError>> {
        Box::pin(async move {
            let result = sqlx::query("DELETE FROM dead_letter_queue WHERE created_at < $1")
                .bind(before)
                .execute(&self.pool)
                .await
                .map_err(storage_error)?;
            Ok(result.rows_affected())
        })
    }
}
