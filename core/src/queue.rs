//! Retry and dead-letter records and their storage contracts.
//!
//! The stores here are deliberately dumb: they persist and fetch records.
//! Retry bookkeeping (seed delays, attempt limits, dead-lettering) lives in
//! the `RetryQueue` / `DeadLetterQueue` services of `eventline-runtime`.

use crate::event::{BaseEvent, Event};
use crate::event_bus::EventBusError;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors from retry and dead-letter queue operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QueueError {
    /// Malformed input, such as an empty id.
    #[error("Validation error: {0}")]
    Validation(String),

    /// No item with the given id.
    #[error("Item not found: {0}")]
    NotFound(String),

    /// Backend failure.
    #[error("Storage error: {0}")]
    Storage(String),

    /// Republishing a dead-lettered event failed.
    #[error("Republish failed: {0}")]
    Republish(#[from] EventBusError),
}

/// Reject empty ids before touching storage.
///
/// # Errors
///
/// Returns [`QueueError::Validation`] when `id` is blank.
pub fn require_id(id: &str) -> Result<(), QueueError> {
    if id.trim().is_empty() {
        return Err(QueueError::Validation("id must not be empty".to_string()));
    }
    Ok(())
}

/// A failed handling awaiting a deferred retry.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RetryItem {
    /// Generated identifier (`rty_…`).
    pub id: String,
    /// Event type of the failed event
    pub event_type: String,
    /// Payload of the failed event
    pub event_data: serde_json::Value,
    /// Source of the failed event
    pub event_source: String,
    /// Timestamp of the failed event
    pub event_timestamp: DateTime<Utc>,
    /// Handler that failed
    pub handler_name: String,
    /// Latest error text
    pub error: String,
    /// Attempts made so far
    pub attempt: u32,
    /// Attempt count at which the item is dead-lettered
    pub max_retries: u32,
    /// Earliest time of the next attempt
    pub next_retry: DateTime<Utc>,
    /// When the item was first queued
    pub created_at: DateTime<Utc>,
    /// When the item last changed
    pub updated_at: DateTime<Utc>,
}

impl RetryItem {
    /// Build a fresh item for `event` failing in `handler_name`.
    #[must_use]
    pub fn new(
        event: &dyn Event,
        handler_name: &str,
        error: impl Into<String>,
        attempt: u32,
        max_retries: u32,
        next_retry: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: crate::id::generate(crate::id::RETRY_PREFIX),
            event_type: event.event_type().to_string(),
            event_data: event.event_data().clone(),
            event_source: event.source().to_string(),
            event_timestamp: event.timestamp(),
            handler_name: handler_name.to_string(),
            error: error.into(),
            attempt,
            max_retries,
            next_retry,
            created_at: now,
            updated_at: now,
        }
    }

    /// Rebuild the original event.
    #[must_use]
    pub fn to_event(&self) -> BaseEvent {
        BaseEvent {
            event_type: self.event_type.clone(),
            event_data: self.event_data.clone(),
            timestamp: self.event_timestamp,
            source: self.event_source.clone(),
        }
    }

    /// Returns `true` when the item identifies the same (event, handler) pair.
    #[must_use]
    pub fn same_key(&self, other: &Self) -> bool {
        self.event_type == other.event_type
            && self.event_source == other.event_source
            && self.event_timestamp == other.event_timestamp
            && self.handler_name == other.handler_name
    }
}

/// Terminal record of a failure that exhausted its retries.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterItem {
    /// Generated identifier (`dlq_…`).
    pub id: String,
    /// Event type of the failed event
    pub event_type: String,
    /// Payload of the failed event
    pub event_data: serde_json::Value,
    /// Source of the failed event
    pub event_source: String,
    /// Timestamp of the failed event
    pub event_timestamp: DateTime<Utc>,
    /// Handler that failed
    pub handler_name: String,
    /// Last error text
    pub error: String,
    /// Attempts made before giving up
    pub attempt: u32,
    /// Human readable reason
    pub reason: String,
    /// Set once the item has been resubmitted to the bus
    pub processed: bool,
    /// When the item was dead-lettered
    pub created_at: DateTime<Utc>,
    /// When the item was resubmitted
    pub processed_at: Option<DateTime<Utc>>,
}

impl DeadLetterItem {
    /// Convert a retry item that ran out of attempts.
    #[must_use]
    pub fn from_retry(item: &RetryItem, now: DateTime<Utc>) -> Self {
        Self {
            id: crate::id::generate(crate::id::DEAD_LETTER_PREFIX),
            event_type: item.event_type.clone(),
            event_data: item.event_data.clone(),
            event_source: item.event_source.clone(),
            event_timestamp: item.event_timestamp,
            handler_name: item.handler_name.clone(),
            error: item.error.clone(),
            attempt: item.attempt,
            reason: format!("retried {} times then failed", item.attempt),
            processed: false,
            created_at: now,
            processed_at: None,
        }
    }

    /// Rebuild the original event.
    #[must_use]
    pub fn to_event(&self) -> BaseEvent {
        BaseEvent {
            event_type: self.event_type.clone(),
            event_data: self.event_data.clone(),
            timestamp: self.event_timestamp,
            source: self.event_source.clone(),
        }
    }
}

/// Storage for [`RetryItem`]s.
///
/// At most one live item exists per (event type, source, timestamp, handler);
/// [`RetryStore::upsert`] enforces it.
pub trait RetryStore: Send + Sync {
    /// Insert `item`, or update the live item with the same key.
    ///
    /// Updating keeps the existing id and `created_at` and overwrites the
    /// error, attempt counters, `next_retry` and `updated_at`. Returns the
    /// stored item.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Storage`] when the write fails.
    fn upsert(&self, item: RetryItem) -> BoxFuture<'_, Result<RetryItem, QueueError>>;

    /// Fetch one item.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Storage`] when the read fails.
    fn get<'a>(&'a self, id: &'a str) -> BoxFuture<'a, Result<Option<RetryItem>, QueueError>>;

    /// Items with `next_retry <= now`, earliest first, at most `limit` (`0` for all).
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Storage`] when the read fails.
    fn due(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> BoxFuture<'_, Result<Vec<RetryItem>, QueueError>>;

    /// Persist retry progress.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::NotFound`] when the item is gone.
    fn update_attempt<'a>(
        &'a self,
        id: &'a str,
        next_retry: DateTime<Utc>,
        attempt: u32,
        error: Option<&'a str>,
        now: DateTime<Utc>,
    ) -> BoxFuture<'a, Result<(), QueueError>>;

    /// Delete one item. Returns `false` if it did not exist.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Storage`] when the delete fails.
    fn remove<'a>(&'a self, id: &'a str) -> BoxFuture<'a, Result<bool, QueueError>>;

    /// Number of live items.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Storage`] when the read fails.
    fn count(&self) -> BoxFuture<'_, Result<u64, QueueError>>;

    /// Delete items created before `before`. Returns the number removed.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Storage`] when the delete fails.
    fn cleanup(&self, before: DateTime<Utc>) -> BoxFuture<'_, Result<u64, QueueError>>;
}

/// Storage for [`DeadLetterItem`]s.
pub trait DeadLetterStore: Send + Sync {
    /// Persist a new item.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Storage`] when the write fails.
    fn insert(&self, item: DeadLetterItem) -> BoxFuture<'_, Result<(), QueueError>>;

    /// Unprocessed items, newest first, paginated (`limit == 0` for all).
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Storage`] when the read fails.
    fn list_unprocessed(
        &self,
        limit: usize,
        offset: usize,
    ) -> BoxFuture<'_, Result<Vec<DeadLetterItem>, QueueError>>;

    /// Fetch one item.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Storage`] when the read fails.
    fn get<'a>(&'a self, id: &'a str)
    -> BoxFuture<'a, Result<Option<DeadLetterItem>, QueueError>>;

    /// Set `processed` and `processed_at`.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::NotFound`] when the item is gone.
    fn mark_processed<'a>(
        &'a self,
        id: &'a str,
        at: DateTime<Utc>,
    ) -> BoxFuture<'a, Result<(), QueueError>>;

    /// Delete one item. Returns `false` if it did not exist.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Storage`] when the delete fails.
    fn remove<'a>(&'a self, id: &'a str) -> BoxFuture<'a, Result<bool, QueueError>>;

    /// Number of unprocessed items.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Storage`] when the read fails.
    fn count_unprocessed(&self) -> BoxFuture<'_, Result<u64, QueueError>>;

    /// Delete items created before `before`. Returns the number removed.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Storage`] when the delete fails.
    fn cleanup(&self, before: DateTime<Utc>) -> BoxFuture<'_, Result<u64, QueueError>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dead_letter_reason_counts_attempts() {
        let now = Utc::now();
        let event = BaseEvent::new("order.created", serde_json::json!({"id": 7}), "orders");
        let mut item = RetryItem::new(&event, "billing", "card declined", 0, 2, now, now);
        item.attempt = 2;

        let dead = DeadLetterItem::from_retry(&item, now);

        assert!(dead.id.starts_with("dlq_"));
        assert_eq!(dead.attempt, 2);
        assert_eq!(dead.reason, "retried 2 times then failed");
        assert!(!dead.processed);
        assert_eq!(dead.to_event(), event);
    }

    #[test]
    fn retry_items_share_key_per_event_and_handler() {
        let now = Utc::now();
        let event = BaseEvent::new("order.created", serde_json::Value::Null, "orders");
        let a = RetryItem::new(&event, "billing", "x", 0, 3, now, now);
        let b = RetryItem::new(&event, "billing", "y", 1, 3, now, now);
        let c = RetryItem::new(&event, "shipping", "x", 0, 3, now, now);

        assert_ne!(a.id, b.id);
        assert!(a.same_key(&b));
        assert!(!a.same_key(&c));
    }

    #[test]
    fn require_id_rejects_blank() {
        assert!(matches!(require_id("  "), Err(QueueError::Validation(_))));
        assert!(require_id("rty_1").is_ok());
    }
}
