//! Event store trait and related types.
//!
//! The event store is a durable log of every published event, independent of
//! whether real-time handling succeeded. It serves point, type, source and
//! time-range reads for audits, and drives **replay**: re-invoking a handler
//! over historical events in ascending timestamp order.
//!
//! # Implementations
//!
//! - `PostgresEventStore` (in `eventline-postgres`): production implementation
//! - `InMemoryEventStore` (in `eventline-testing`): fast, deterministic testing
//!
//! # Example
//!
//! ```no_run
//! use eventline_core::event_store::{EventFilter, EventStore, EventStoreError};
//! use eventline_core::handler::EventHandler;
//! use eventline_core::CancellationToken;
//!
//! async fn backfill(
//!     store: &dyn EventStore,
//!     handler: &dyn EventHandler,
//! ) -> Result<(), EventStoreError> {
//!     let filter = EventFilter::new().with_event_type("order.created").dry_run(true);
//!     let result = store.replay(handler, &filter, &CancellationToken::new()).await?;
//!     println!("would replay {} events", result.skipped_count);
//!     Ok(())
//! }
//! ```

use crate::event::{BaseEvent, Event, SharedEvent};
use crate::handler::EventHandler;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Thirty days, the default retention for the event log and dead letters.
pub const DEFAULT_RETENTION: Duration = Duration::from_secs(30 * 24 * 60 * 60);

/// Default number of events written per insert by `store_batch`.
pub const DEFAULT_BATCH_SIZE: usize = 100;

/// Errors that can occur during event store operations.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EventStoreError {
    /// Malformed input rejected before any query ran.
    #[error("Validation error: {0}")]
    Validation(String),

    /// Backend failure.
    #[error("Database error: {0}")]
    Database(String),

    /// Payload could not be encoded or decoded.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Replay stopped early because of cancellation or its deadline.
    #[error("Replay interrupted: {reason}")]
    Interrupted {
        /// Why the replay stopped.
        reason: String,
        /// Counts accumulated before the interruption.
        partial: ReplayResult,
    },
}

/// A persisted event.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StoredEvent {
    /// Generated identifier (`evt_…`).
    pub id: String,
    /// Event type identifier
    pub event_type: String,
    /// Opaque payload
    pub event_data: serde_json::Value,
    /// When the event happened
    pub timestamp: DateTime<Utc>,
    /// Producing component
    pub source: String,
    /// Replay bookkeeping; says nothing about real-time handling.
    pub processed: bool,
    /// When the record was written.
    pub created_at: DateTime<Utc>,
    /// When the record becomes eligible for TTL removal.
    pub expires_at: Option<DateTime<Utc>>,
}

impl StoredEvent {
    /// Build a new, unprocessed record for `event`.
    #[must_use]
    pub fn from_event(event: &dyn Event, now: DateTime<Utc>, retention: Option<Duration>) -> Self {
        // Windows past the representable range never expire.
        let expires_at = retention
            .and_then(|r| chrono::Duration::from_std(r).ok())
            .and_then(|r| now.checked_add_signed(r));
        Self {
            id: crate::id::generate(crate::id::EVENT_PREFIX),
            event_type: event.event_type().to_string(),
            event_data: event.event_data().clone(),
            timestamp: event.timestamp(),
            source: event.source().to_string(),
            processed: false,
            created_at: now,
            expires_at,
        }
    }

    /// Returns `true` once `expires_at` has passed.
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }

    /// Returns `true` when the record satisfies every criterion of `filter`
    /// (pagination excluded).
    #[must_use]
    pub fn matches(&self, filter: &EventFilter) -> bool {
        filter.event_type.as_ref().is_none_or(|t| *t == self.event_type)
            && filter.source.as_ref().is_none_or(|s| *s == self.source)
            && filter.start_time.is_none_or(|start| self.timestamp >= start)
            && filter.end_time.is_none_or(|end| self.timestamp <= end)
            && filter.processed.is_none_or(|p| p == self.processed)
    }
}

impl Event for StoredEvent {
    fn event_type(&self) -> &str {
        &self.event_type
    }

    fn event_data(&self) -> &serde_json::Value {
        &self.event_data
    }

    fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    fn source(&self) -> &str {
        &self.source
    }

    fn to_base_event(&self) -> BaseEvent {
        BaseEvent {
            event_type: self.event_type.clone(),
            event_data: self.event_data.clone(),
            timestamp: self.timestamp,
            source: self.source.clone(),
        }
    }
}

/// Query and replay criteria.
///
/// `limit == 0` means "no limit". Negative `limit`/`offset` values are
/// representable so they can be rejected by [`EventFilter::validate`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct EventFilter {
    /// Exact event type
    pub event_type: Option<String>,
    /// Exact source
    pub source: Option<String>,
    /// Inclusive lower timestamp bound
    pub start_time: Option<DateTime<Utc>>,
    /// Inclusive upper timestamp bound
    pub end_time: Option<DateTime<Utc>>,
    /// Replay bookkeeping flag
    pub processed: Option<bool>,
    /// Maximum number of events, `0` for all
    pub limit: i64,
    /// Number of matching events to skip
    pub offset: i64,
    /// Count matching events without invoking the handler
    pub dry_run: bool,
    /// Replay deadline, overriding the five minute default
    pub timeout: Option<Duration>,
}

impl EventFilter {
    /// Filter matching every event.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Restrict to one event type.
    #[must_use]
    pub fn with_event_type(mut self, event_type: impl Into<String>) -> Self {
        self.event_type = Some(event_type.into());
        self
    }

    /// Restrict to one source.
    #[must_use]
    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    /// Restrict to `[start, end]`; either bound may be open.
    #[must_use]
    pub const fn with_time_range(
        mut self,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> Self {
        self.start_time = start;
        self.end_time = end;
        self
    }

    /// Restrict on the processed flag.
    #[must_use]
    pub const fn with_processed(mut self, processed: bool) -> Self {
        self.processed = Some(processed);
        self
    }

    /// Set pagination.
    #[must_use]
    pub const fn with_page(mut self, limit: i64, offset: i64) -> Self {
        self.limit = limit;
        self.offset = offset;
        self
    }

    /// Toggle dry-run replay.
    #[must_use]
    pub const fn dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    /// Override the replay deadline.
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Reject malformed filters.
    ///
    /// # Errors
    ///
    /// Returns [`EventStoreError::Validation`] for negative pagination values
    /// or a start time after the end time.
    pub fn validate(&self) -> Result<(), EventStoreError> {
        if self.limit < 0 {
            return Err(EventStoreError::Validation(format!(
                "limit must not be negative, got {}",
                self.limit
            )));
        }
        if self.offset < 0 {
            return Err(EventStoreError::Validation(format!(
                "offset must not be negative, got {}",
                self.offset
            )));
        }
        if let (Some(start), Some(end)) = (self.start_time, self.end_time) {
            if start > end {
                return Err(EventStoreError::Validation(format!(
                    "start time {start} is after end time {end}"
                )));
            }
        }
        Ok(())
    }

    /// Apply `offset`/`limit` to an already ordered list of matches.
    #[must_use]
    pub fn paginate<T>(&self, items: Vec<T>) -> Vec<T> {
        let offset = usize::try_from(self.offset).unwrap_or(0);
        let iter = items.into_iter().skip(offset);
        match usize::try_from(self.limit) {
            Ok(limit) if limit > 0 => iter.take(limit).collect(),
            _ => iter.collect(),
        }
    }
}

/// Order of returned events.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SortOrder {
    /// Oldest first (replay order)
    OldestFirst,
    /// Newest first (audit reads)
    NewestFirst,
}

/// Outcome counts of a replay.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplayResult {
    /// Events successfully handled and marked processed
    pub replayed_count: u64,
    /// Events whose handler invocation failed
    pub failed_count: u64,
    /// Events counted but not handled (dry run)
    pub skipped_count: u64,
    /// Wall-clock time of the replay
    pub duration: Duration,
}

/// Persistence behaviour shared by every backend.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EventStoreOptions {
    /// When `false`, `store`/`store_batch` are no-ops.
    pub enabled: bool,
    /// TTL applied to new records, `None` to keep forever.
    pub retention: Option<Duration>,
    /// Insert chunk size for `store_batch`.
    pub batch_size: usize,
}

impl Default for EventStoreOptions {
    fn default() -> Self {
        Self {
            enabled: true,
            retention: Some(DEFAULT_RETENTION),
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }
}

/// Durable event log with queries and replay.
///
/// # Thread Safety
///
/// Implementations must be `Send + Sync`; one store is shared by the
/// persisted bus, replay tooling and cleanup jobs.
///
/// # Dyn Compatibility
///
/// Methods return boxed futures so the store can be used as
/// `Arc<dyn EventStore>` and wrapped by decorators such as the metrics store.
pub trait EventStore: Send + Sync {
    /// Persist one event.
    ///
    /// # Errors
    ///
    /// Returns [`EventStoreError::Database`] or [`EventStoreError::Serialization`]
    /// when the write fails.
    fn store<'a>(&'a self, event: &'a dyn Event) -> BoxFuture<'a, Result<(), EventStoreError>>;

    /// Persist several events, chunked by the configured batch size.
    ///
    /// # Errors
    ///
    /// Returns the first write error; earlier chunks stay written.
    fn store_batch<'a>(
        &'a self,
        events: &'a [SharedEvent],
    ) -> BoxFuture<'a, Result<(), EventStoreError>>;

    /// Fetch one event by id.
    ///
    /// # Errors
    ///
    /// Returns [`EventStoreError::Validation`] for an empty id.
    fn get_by_id<'a>(
        &'a self,
        id: &'a str,
    ) -> BoxFuture<'a, Result<Option<StoredEvent>, EventStoreError>>;

    /// Return the events matching `filter` (paginated) in the requested order.
    ///
    /// # Errors
    ///
    /// Returns [`EventStoreError::Validation`] for a malformed filter.
    fn query<'a>(
        &'a self,
        filter: &'a EventFilter,
        order: SortOrder,
    ) -> BoxFuture<'a, Result<Vec<StoredEvent>, EventStoreError>>;

    /// Count the events matching `filter`, ignoring pagination.
    ///
    /// # Errors
    ///
    /// Returns [`EventStoreError::Validation`] for a malformed filter.
    fn count<'a>(&'a self, filter: &'a EventFilter) -> BoxFuture<'a, Result<u64, EventStoreError>>;

    /// Hard-delete every event created before `before`. Returns the number removed.
    ///
    /// # Errors
    ///
    /// Returns [`EventStoreError::Database`] when the delete fails.
    fn cleanup(&self, before: DateTime<Utc>) -> BoxFuture<'_, Result<u64, EventStoreError>>;

    /// Flip `processed` to `true`.
    ///
    /// # Errors
    ///
    /// Returns [`EventStoreError::Database`] when the update fails.
    fn mark_processed<'a>(&'a self, id: &'a str) -> BoxFuture<'a, Result<(), EventStoreError>>;

    /// Remove records whose `expires_at` has passed. Returns the number removed.
    ///
    /// # Errors
    ///
    /// Returns [`EventStoreError::Database`] when the delete fails.
    fn purge_expired(&self) -> BoxFuture<'_, Result<u64, EventStoreError>>;

    /// Check that the backend is reachable.
    ///
    /// # Errors
    ///
    /// Returns [`EventStoreError::Database`] when it is not.
    fn health(&self) -> BoxFuture<'_, Result<(), EventStoreError>>;

    /// Matching events, oldest first.
    ///
    /// # Errors
    ///
    /// See [`EventStore::query`].
    fn find<'a>(
        &'a self,
        filter: &'a EventFilter,
    ) -> BoxFuture<'a, Result<Vec<StoredEvent>, EventStoreError>> {
        self.query(filter, SortOrder::OldestFirst)
    }

    /// Events of one type, newest first.
    ///
    /// # Errors
    ///
    /// Returns [`EventStoreError::Validation`] for negative pagination.
    fn get_by_type<'a>(
        &'a self,
        event_type: &'a str,
        limit: i64,
        offset: i64,
    ) -> BoxFuture<'a, Result<Vec<StoredEvent>, EventStoreError>> {
        let filter = EventFilter::new().with_event_type(event_type).with_page(limit, offset);
        Box::pin(async move { self.query(&filter, SortOrder::NewestFirst).await })
    }

    /// Events from one source, newest first.
    ///
    /// # Errors
    ///
    /// Returns [`EventStoreError::Validation`] for negative pagination.
    fn get_by_source<'a>(
        &'a self,
        source: &'a str,
        limit: i64,
        offset: i64,
    ) -> BoxFuture<'a, Result<Vec<StoredEvent>, EventStoreError>> {
        let filter = EventFilter::new().with_source(source).with_page(limit, offset);
        Box::pin(async move { self.query(&filter, SortOrder::NewestFirst).await })
    }

    /// Events with `start <= timestamp <= end`, newest first.
    ///
    /// # Errors
    ///
    /// Returns [`EventStoreError::Validation`] when `start > end` or pagination is negative.
    fn get_by_time_range(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        limit: i64,
        offset: i64,
    ) -> BoxFuture<'_, Result<Vec<StoredEvent>, EventStoreError>> {
        let filter = EventFilter::new()
            .with_time_range(Some(start), Some(end))
            .with_page(limit, offset);
        Box::pin(async move { self.query(&filter, SortOrder::NewestFirst).await })
    }

    /// Events of one type within a time range, newest first.
    ///
    /// # Errors
    ///
    /// Returns [`EventStoreError::Validation`] when `start > end` or pagination is negative.
    fn get_by_type_and_time_range<'a>(
        &'a self,
        event_type: &'a str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        limit: i64,
        offset: i64,
    ) -> BoxFuture<'a, Result<Vec<StoredEvent>, EventStoreError>> {
        let filter = EventFilter::new()
            .with_event_type(event_type)
            .with_time_range(Some(start), Some(end))
            .with_page(limit, offset);
        Box::pin(async move { self.query(&filter, SortOrder::NewestFirst).await })
    }

    /// Re-drive the events matching `filter` through `handler`, oldest first.
    ///
    /// Failures are counted and do not stop the scan. Successfully handled
    /// events are marked processed. A dry run only counts matches.
    ///
    /// # Errors
    ///
    /// - [`EventStoreError::Validation`] for a malformed filter (nothing is touched)
    /// - [`EventStoreError::Interrupted`] when `cancel` fires or the deadline passes
    /// - backend errors from the initial query
    fn replay<'a>(
        &'a self,
        handler: &'a dyn EventHandler,
        filter: &'a EventFilter,
        cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, Result<ReplayResult, EventStoreError>> {
        Box::pin(crate::replay::run(self, handler, filter, cancel))
    }

    /// Replay every event at or after `start`.
    ///
    /// # Errors
    ///
    /// See [`EventStore::replay`].
    fn replay_from_timestamp<'a>(
        &'a self,
        start: DateTime<Utc>,
        handler: &'a dyn EventHandler,
        cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, Result<ReplayResult, EventStoreError>> {
        Box::pin(async move {
            let filter = EventFilter::new().with_time_range(Some(start), None);
            self.replay(handler, &filter, cancel).await
        })
    }

    /// Replay every event at or after the timestamp of event `id`.
    ///
    /// # Errors
    ///
    /// Returns [`EventStoreError::Validation`] when the event does not exist,
    /// otherwise see [`EventStore::replay`].
    fn replay_from_event_id<'a>(
        &'a self,
        id: &'a str,
        handler: &'a dyn EventHandler,
        cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, Result<ReplayResult, EventStoreError>> {
        Box::pin(async move {
            let event = self
                .get_by_id(id)
                .await?
                .ok_or_else(|| EventStoreError::Validation(format!("event not found: {id}")))?;
            let filter = EventFilter::new().with_time_range(Some(event.timestamp), None);
            self.replay(handler, &filter, cancel).await
        })
    }

    /// Replay every event of one type.
    ///
    /// # Errors
    ///
    /// See [`EventStore::replay`].
    fn replay_with_type<'a>(
        &'a self,
        event_type: &'a str,
        handler: &'a dyn EventHandler,
        cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, Result<ReplayResult, EventStoreError>> {
        Box::pin(async move {
            let filter = EventFilter::new().with_event_type(event_type);
            self.replay(handler, &filter, cancel).await
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).single().unwrap_or_default()
    }

    #[test]
    fn validate_rejects_negative_pagination() {
        assert!(matches!(
            EventFilter::new().with_page(-1, 0).validate(),
            Err(EventStoreError::Validation(_))
        ));
        assert!(matches!(
            EventFilter::new().with_page(10, -5).validate(),
            Err(EventStoreError::Validation(_))
        ));
    }

    #[test]
    fn validate_rejects_inverted_range() {
        let filter = EventFilter::new().with_time_range(Some(at(10)), Some(at(5)));
        assert!(matches!(filter.validate(), Err(EventStoreError::Validation(_))));
        let ok = EventFilter::new().with_time_range(Some(at(5)), Some(at(5)));
        assert!(ok.validate().is_ok());
    }

    #[test]
    fn paginate_treats_zero_limit_as_unlimited() {
        let items: Vec<i32> = (0..10).collect();
        assert_eq!(EventFilter::new().paginate(items.clone()).len(), 10);
        assert_eq!(EventFilter::new().with_page(3, 2).paginate(items.clone()), vec![2, 3, 4]);
        assert_eq!(EventFilter::new().with_page(0, 8).paginate(items), vec![8, 9]);
    }

    #[test]
    fn stored_event_matches_filter() {
        let event = BaseEvent::new("order.created", serde_json::Value::Null, "orders")
            .with_timestamp(at(100));
        let stored = StoredEvent::from_event(&event, at(100), Some(Duration::from_secs(60)));

        assert!(stored.id.starts_with("evt_"));
        assert_eq!(stored.expires_at, Some(at(160)));
        assert!(stored.matches(&EventFilter::new().with_event_type("order.created")));
        assert!(!stored.matches(&EventFilter::new().with_source("users")));
        assert!(stored.matches(&EventFilter::new().with_time_range(Some(at(100)), Some(at(100)))));
        assert!(!stored.matches(&EventFilter::new().with_processed(true)));
        assert!(stored.is_expired(at(160)));
        assert!(!stored.is_expired(at(159)));
    }

    #[test]
    fn retention_past_the_calendar_never_expires() {
        let event = BaseEvent::new("order.created", serde_json::Value::Null, "orders");
        let millennia = Duration::from_secs(300_000 * 365 * 24 * 60 * 60);

        let stored = StoredEvent::from_event(&event, at(0), Some(millennia));
        assert_eq!(stored.expires_at, None);

        let stored = StoredEvent::from_event(&event, at(0), Some(Duration::MAX));
        assert_eq!(stored.expires_at, None);
    }
}
