//! `PostgreSQL` event log.

use crate::schema::run_migrations;
use chrono::{DateTime, Utc};
use eventline_core::environment::{Clock, SystemClock};
use eventline_core::event::{Event, SharedEvent};
use eventline_core::event_store::{
    EventFilter, EventStore, EventStoreError, EventStoreOptions, SortOrder, StoredEvent,
};
use futures::future::BoxFuture;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Postgres, QueryBuilder, Row};
use std::sync::Arc;

const COLUMNS: &str =
    r#"id, event_type, event_data, "timestamp", source, processed, created_at, expires_at"#;

/// Durable event log backed by the `event_log` table.
///
/// Expired rows are invisible to reads and removed by
/// [`EventStore::purge_expired`]. Replay is inherited from the trait.
///
/// # Example
///
/// ```no_run
/// use eventline_postgres::PostgresEventStore;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let store = PostgresEventStore::connect("postgres://localhost/events").await?;
/// store.migrate().await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct PostgresEventStore {
    pool: PgPool,
    options: EventStoreOptions,
    clock: Arc<dyn Clock>,
}

impl PostgresEventStore {
    /// Wrap an existing pool.
    #[must_use]
    pub fn from_pool(pool: PgPool) -> Self {
        Self {
            pool,
            options: EventStoreOptions::default(),
            clock: Arc::new(SystemClock),
        }
    }

    /// Open a pool against `database_url`.
    ///
    /// # Errors
    ///
    /// Returns [`EventStoreError::Database`] if the connection fails.
    pub async fn connect(database_url: &str) -> Result<Self, EventStoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await
            .map_err(db_error)?;
        Ok(Self::from_pool(pool))
    }

    /// Override the store options.
    #[must_use]
    pub fn with_options(mut self, options: EventStoreOptions) -> Self {
        self.options = options;
        self
    }

    /// Use `clock` for `created_at` and expiry.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// The underlying pool, shared with the queue stores.
    #[must_use]
    pub const fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create the tables if needed.
    ///
    /// # Errors
    ///
    /// Returns [`EventStoreError::Database`] if a statement fails.
    pub async fn migrate(&self) -> Result<(), EventStoreError> {
        run_migrations(&self.pool).await.map_err(db_error)
    }

    async fn insert_chunk(&self, chunk: &[SharedEvent]) -> Result<(), EventStoreError> {
        let now = self.clock.now();
        let records: Vec<StoredEvent> = chunk
            .iter()
            .map(|e| StoredEvent::from_event(e.as_ref(), now, self.options.retention))
            .collect();

        let mut builder: QueryBuilder<'_, Postgres> =
            QueryBuilder::new(format!("INSERT INTO event_log ({COLUMNS}) "));
        builder.push_values(records, |mut row, record| {
            row.push_bind(record.id)
                .push_bind(record.event_type)
                .push_bind(record.event_data)
                .push_bind(record.timestamp)
                .push_bind(record.source)
                .push_bind(record.processed)
                .push_bind(record.created_at)
                .push_bind(record.expires_at);
        });
        builder.build().execute(&self.pool).await.map_err(db_error)?;
        Ok(())
    }
}

fn db_error(e: sqlx::Error) -> EventStoreError {
    EventStoreError::Database(e.to_string())
}

/// Append the `WHERE` clause shared by `query` and `count`.
fn push_conditions(
    builder: &mut QueryBuilder<'_, Postgres>,
    filter: &EventFilter,
    now: DateTime<Utc>,
) {
    builder.push(" WHERE (expires_at IS NULL OR expires_at > ");
    builder.push_bind(now);
    builder.push(")");
    if let Some(event_type) = &filter.event_type {
        builder.push(" AND event_type = ");
        builder.push_bind(event_type.clone());
    }
    if let Some(source) = &filter.source {
        builder.push(" AND source = ");
        builder.push_bind(source.clone());
    }
    if let Some(start) = filter.start_time {
        builder.push(r#" AND "timestamp" >= "#);
        builder.push_bind(start);
    }
    if let Some(end) = filter.end_time {
        builder.push(r#" AND "timestamp" <= "#);
        builder.push_bind(end);
    }
    if let Some(processed) = filter.processed {
        builder.push(" AND processed = ");
        builder.push_bind(processed);
    }
}

fn stored_event(row: &PgRow) -> Result<StoredEvent, EventStoreError> {
    let decode = |e: sqlx::Error| EventStoreError::Serialization(e.to_string());
    Ok(StoredEvent {
        id: row.try_get("id").map_err(decode)?,
        event_type: row.try_get("event_type").map_err(decode)?,
        event_data: row.try_get("event_data").map_err(decode)?,
        timestamp: row.try_get("timestamp").map_err(decode)?,
        source: row.try_get("source").map_err(decode)?,
        processed: row.try_get("processed").map_err(decode)?,
        created_at: row.try_get("created_at").map_err(decode)?,
        expires_at: row.try_get("expires_at").map_err(decode)?,
    })
}

impl EventStore for PostgresEventStore {
    fn store<'a>(&'a self, event: &'a dyn Event) -> BoxFuture<'a, Result<(), EventStoreError>> {
        Box::pin(async move {
            if !self.options.enabled {
                return Ok(());
            }
            let record = StoredEvent::from_event(event, self.clock.now(), self.options.retention);
            sqlx::query(&format!(
                "INSERT INTO event_log ({COLUMNS}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8)"
            ))
            .bind(&record.id)
            .bind(&record.event_type)
            .bind(&record.event_data)
            .bind(record.timestamp)
            .bind(&record.source)
            .bind(record.processed)
            .bind(record.created_at)
            .bind(record.expires_at)
            .execute(&self.pool)
            .await
            .map_err(db_error)?;
            Ok(())
        })
    }

    fn store_batch<'a>(
        &'a self,
        events: &'a [SharedEvent],
    ) -> BoxFuture<'a, Result<(), EventStoreError>> {
        Box::pin(async move {
            if !self.options.enabled || events.is_empty() {
                return Ok(());
            }
            for chunk in events.chunks(self.options.batch_size.max(1)) {
                self.insert_chunk(chunk).await?;
            }
            tracing::debug!(count = events.len(), "Event batch stored");
            Ok(())
        })
    }

    fn get_by_id<'a>(
        &'a self,
        id: &'a str,
    ) -> BoxFuture<'a, Result<Option<StoredEvent>, EventStoreError>> {
        Box::pin(async move {
            if id.is_empty() {
                return Err(EventStoreError::Validation("event id must not be empty".to_string()));
            }
            let row = sqlx::query(&format!(
                "SELECT {COLUMNS} FROM event_log \
                 WHERE id = $1 AND (expires_at IS NULL OR expires_at > $2)"
            ))
            .bind(id)
            .bind(self.clock.now())
            .fetch_optional(&self.pool)
            .await
            .map_err(db_error)?;
            row.as_ref().map(stored_event).transpose()
        })
    }

    fn query<'a>(
        &'a self,
        filter: &'a EventFilter,
        order: SortOrder,
    ) -> BoxFuture<'a, Result<Vec<StoredEvent>, EventStoreError>> {
        Box::pin(async move {
            filter.validate()?;
            let mut builder = QueryBuilder::new(format!("SELECT {COLUMNS} FROM event_log"));
            push_conditions(&mut builder, filter, self.clock.now());
            builder.push(match order {
                SortOrder::OldestFirst => r#" ORDER BY "timestamp" ASC, created_at ASC"#,
                SortOrder::NewestFirst => r#" ORDER BY "timestamp" DESC, created_at DESC"#,
            });
            if filter.limit > 0 {
                builder.push(" LIMIT ");
                builder.push_bind(filter.limit);
            }
            if filter.offset > 0 {
                builder.push(" OFFSET ");
                builder.push_bind(filter.offset);
            }

            let rows = builder.build().fetch_all(&self.pool).await.map_err(db_error)?;
            rows.iter().map(stored_event).collect()
        })
    }

    fn count<'a>(&'a self, filter: &'a EventFilter) -> BoxFuture<'a, Result<u64, EventStoreError>> {
        Box::pin(async move {
            filter.validate()?;
            let mut builder = QueryBuilder::new("SELECT COUNT(*) FROM event_log");
            push_conditions(&mut builder, filter, self.clock.now());
            let count: i64 = builder
                .build_query_scalar::<i64>()
                .fetch_one(&self.pool)
                .await
                .map_err(db_error)?;
            Ok(u64::try_from(count).unwrap_or(0))
        })
    }

    fn cleanup(&self, before: DateTime<Utc>) -> BoxFuture<'_, Result<u64, EventStoreError>> {
        Box::pin(async move {
            let result = sqlx::query("DELETE FROM event_log WHERE created_at < $1")
                .bind(before)
                .execute(&self.pool)
                .await
                .map_err(db_error)?;
            tracing::info!(removed = result.rows_affected(), "Event log cleaned up");
            Ok(result.rows_affected())
        })
    }

    fn mark_processed<'a>(&'a self, id: &'a str) -> BoxFuture<'a, Result<(), EventStoreError>> {
        Box::pin(async move {
            let result = sqlx::query("UPDATE event_log SET processed = TRUE WHERE id = $1")
                .bind(id)
                .execute(&self.pool)
                .await
                .map_err(db_error)?;
            if result.rows_affected() == 0 {
                return Err(EventStoreError::Database(format!("event not found: {id}")));
            }
            Ok(())
        })
    }

    fn purge_expired(&self) -> BoxFuture<'_, Result<u64, EventStoreError>> {
        Box::pin(async move {
            let result = sqlx::query(
                "DELETE FROM event_log WHERE expires_at IS NOT NULL AND expires_at <= $1",
            )
            .bind(self.clock.now())
            .execute(&self.pool)
            .await
            .map_err(db_error)?;
            Ok(result.rows_affected())
        })
    }

    fn health(&self) -> BoxFuture<'_, Result<(), EventStoreError>> {
        Box::pin(async move {
            sqlx::query("SELECT 1")
                .execute(&self.pool)
                .await
                .map_err(db_error)?;
            Ok(())
        })
    }
}
