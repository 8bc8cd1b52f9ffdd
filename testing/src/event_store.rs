//! In-memory event store for fast, deterministic tests.

#![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap for simplicity
#![allow(clippy::missing_panics_doc)] // Test utilities document panics where critical

use chrono::{DateTime, Utc};
use eventline_core::environment::{Clock, SystemClock};
use eventline_core::event::{Event, SharedEvent};
use eventline_core::event_store::{
    EventFilter, EventStore, EventStoreError, EventStoreOptions, SortOrder, StoredEvent,
};
use futures::future::BoxFuture;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

/// In-memory event store.
///
/// Honors [`EventStoreOptions`] (disabled stores drop writes, new records get
/// `expires_at = now + retention`) and reads time from an injected [`Clock`].
/// Failure switches let tests exercise persistence error paths.
///
/// # Example
///
/// ```
/// use eventline_testing::InMemoryEventStore;
/// use eventline_core::event::BaseEvent;
/// use eventline_core::event_store::{EventFilter, EventStore};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let store = InMemoryEventStore::new();
/// store.store(&BaseEvent::new("a", serde_json::Value::Null, "test")).await?;
/// assert_eq!(store.count(&EventFilter::new()).await?, 1);
/// # Ok(())
/// # }
/// ```
pub struct InMemoryEventStore {
    events: RwLock<Vec<StoredEvent>>,
    clock: Arc<dyn Clock>,
    options: EventStoreOptions,
    fail_writes: AtomicBool,
    fail_reads: AtomicBool,
    read_latency: Option<Duration>,
    batch_writes: AtomicUsize,
}

impl InMemoryEventStore {
    /// Create an empty store with default options and the system clock.
    #[must_use]
    pub fn new() -> Self {
        Self {
            events: RwLock::new(Vec::new()),
            clock: Arc::new(SystemClock),
            options: EventStoreOptions::default(),
            fail_writes: AtomicBool::new(false),
            fail_reads: AtomicBool::new(false),
            read_latency: None,
            batch_writes: AtomicUsize::new(0),
        }
    }

    /// Use `clock` for `created_at`, expiry and purging.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Override the store options.
    #[must_use]
    pub fn with_options(mut self, options: EventStoreOptions) -> Self {
        self.options = options;
        self
    }

    /// Block the calling thread for `latency` on every read, like a driver
    /// that never yields.
    #[must_use]
    pub const fn with_read_latency(mut self, latency: Duration) -> Self {
        self.read_latency = Some(latency);
        self
    }

    /// Make every write fail with a database error.
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Make every query fail with a database error.
    pub fn fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    /// Insert a fully formed record, bypassing `store` (for seeding `created_at`).
    pub fn insert(&self, event: StoredEvent) {
        self.events.write().unwrap().push(event);
    }

    /// Snapshot of every record, including expired ones.
    #[must_use]
    pub fn all(&self) -> Vec<StoredEvent> {
        self.events.read().unwrap().clone()
    }

    /// Number of records held, including expired ones.
    #[must_use]
    pub fn len(&self) -> usize {
        self.events.read().unwrap().len()
    }

    /// Check if the store is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of insert round trips made by `store_batch`.
    #[must_use]
    pub fn batch_writes(&self) -> usize {
        self.batch_writes.load(Ordering::SeqCst)
    }

    fn check_writes(&self) -> Result<(), EventStoreError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(EventStoreError::Database("write failure injected".to_string()));
        }
        Ok(())
    }

    fn check_reads(&self) -> Result<(), EventStoreError> {
        if let Some(latency) = self.read_latency {
            std::thread::sleep(latency);
        }
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(EventStoreError::Database("read failure injected".to_string()));
        }
        Ok(())
    }

    fn live_matches(&self, filter: &EventFilter) -> Vec<StoredEvent> {
        let now = self.clock.now();
        self.events
            .read()
            .unwrap()
            .iter()
            .filter(|e| !e.is_expired(now) && e.matches(filter))
            .cloned()
            .collect()
    }
}

impl Default for InMemoryEventStore {
    fn default() -> Self {
        Self::new()
    }
}

impl EventStore for InMemoryEventStore {
    fn store<'a>(&'a self, event: &'a dyn Event) -> BoxFuture<'a, Result<(), EventStoreError>> {
        Box::pin(async move {
            if !self.options.enabled {
                return Ok(());
            }
            self.check_writes()?;
            let record = StoredEvent::from_event(event, self.clock.now(), self.options.retention);
            self.events.write().unwrap().push(record);
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
                self.check_writes()?;
                let now = self.clock.now();
                let records: Vec<StoredEvent> = chunk
                    .iter()
                    .map(|e| StoredEvent::from_event(e.as_ref(), now, self.options.retention))
                    .collect();
                self.events.write().unwrap().extend(records);
                self.batch_writes.fetch_add(1, Ordering::SeqCst);
            }
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
            self.check_reads()?;
            let now = self.clock.now();
            Ok(self
                .events
                .read()
                .unwrap()
                .iter()
                .find(|e| e.id == id && !e.is_expired(now))
                .cloned())
        })
    }

    fn query<'a>(
        &'a self,
        filter: &'a EventFilter,
        order: SortOrder,
    ) -> BoxFuture<'a, Result<Vec<StoredEvent>, EventStoreError>> {
        Box::pin(async move {
            filter.validate()?;
            self.check_reads()?;
            let mut matches = self.live_matches(filter);
            match order {
                SortOrder::OldestFirst => matches.sort_by_key(|e| e.timestamp),
                SortOrder::NewestFirst => {
                    matches.sort_by_key(|e| std::cmp::Reverse(e.timestamp));
                }
            }
            Ok(filter.paginate(matches))
        })
    }

    fn count<'a>(&'a self, filter: &'a EventFilter) -> BoxFuture<'a, Result<u64, EventStoreError>> {
        Box::pin(async move {
            filter.validate()?;
            self.check_reads()?;
            Ok(self.live_matches(filter).len() as u64)
        })
    }

    fn cleanup(&self, before: DateTime<Utc>) -> BoxFuture<'_, Result<u64, EventStoreError>> {
        Box::pin(async move {
            self.check_writes()?;
            let mut events = self.events.write().unwrap();
            let len = events.len();
            events.retain(|e| e.created_at >= before);
            Ok((len - events.len()) as u64)
        })
    }

    fn mark_processed<'a>(&'a self, id: &'a str) -> BoxFuture<'a, Result<(), EventStoreError>> {
        Box::pin(async move {
            self.check_writes()?;
            let mut events = self.events.write().unwrap();
            match events.iter_mut().find(|e| e.id == id) {
                Some(event) => {
                    event.processed = true;
                    Ok(())
                }
                None => Err(EventStoreError::Database(format!("event not found: {id}"))),
            }
        })
    }

    fn purge_expired(&self) -> BoxFuture<'_, Result<u64, EventStoreError>> {
        Box::pin(async move {
            let now = self.clock.now();
            let mut events = self.events.write().unwrap();
            let len = events.len();
            events.retain(|e| !e.is_expired(now));
            Ok((len - events.len()) as u64)
        })
    }

    fn health(&self) -> BoxFuture<'_, Result<(), EventStoreError>> {
        Box::pin(async move { self.check_reads() })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::{event_at, event_series};
    use crate::mocks::manual_clock;

    #[tokio::test]
    async fn disabled_store_drops_writes() {
        let store = InMemoryEventStore::new().with_options(EventStoreOptions {
            enabled: false,
            ..EventStoreOptions::default()
        });
        let event = event_at("a", "s", Utc::now(), 0);

        store.store(&event).await.unwrap();
        let batch: Vec<SharedEvent> = vec![Arc::new(event)];
        store.store_batch(&batch).await.unwrap();

        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn store_batch_chunks_by_batch_size() {
        let store = InMemoryEventStore::new().with_options(EventStoreOptions {
            batch_size: 2,
            ..EventStoreOptions::default()
        });

        store.store_batch(&event_series("a", "s", Utc::now(), 5)).await.unwrap();

        assert_eq!(store.len(), 5);
        assert_eq!(store.batch_writes(), 3);
    }

    #[tokio::test]
    async fn expired_records_are_hidden_then_purged() {
        let clock = manual_clock();
        let store = InMemoryEventStore::new()
            .with_clock(Arc::new(clock.clone()))
            .with_options(EventStoreOptions {
                retention: Some(Duration::from_secs(60)),
                ..EventStoreOptions::default()
            });
        store.store(&event_at("a", "s", clock.now(), 0)).await.unwrap();

        clock.advance(Duration::from_secs(61));

        assert_eq!(store.count(&EventFilter::new()).await.unwrap(), 0);
        assert_eq!(store.purge_expired().await.unwrap(), 1);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn cleanup_keeps_records_at_or_after_cutoff() {
        let clock = manual_clock();
        let store = InMemoryEventStore::new().with_clock(Arc::new(clock.clone()));
        store.store(&event_at("a", "s", clock.now(), 0)).await.unwrap();
        clock.advance(Duration::from_secs(60));
        let cutoff = clock.now();
        store.store(&event_at("a", "s", clock.now(), 1)).await.unwrap();
        clock.advance(Duration::from_secs(60));
        store.store(&event_at("a", "s", clock.now(), 2)).await.unwrap();

        assert_eq!(store.cleanup(cutoff).await.unwrap(), 1);

        let remaining = store.all();
        assert_eq!(remaining.len(), 2);
        assert!(remaining.iter().all(|e| e.created_at >= cutoff));
        assert!(remaining.iter().all(|e| e.event_data["seq"] != 0));
    }
}
