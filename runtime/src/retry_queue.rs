//! Deferred retry queue.
//!
//! A failed (event, handler) pair is parked as a [`RetryItem`] with a
//! `next_retry` time. The [`crate::worker::RetryWorker`] pulls due items and
//! either clears them, reschedules them through the retry policy, or hands
//! them to the [`DeadLetterQueue`].
//!
//! The first delay is a fixed seed of `attempt + 1` seconds; the worker's
//! policy decides every later delay.

use crate::dead_letter::DeadLetterQueue;
use chrono::{DateTime, Utc};
use eventline_core::environment::{Clock, SystemClock};
use eventline_core::event::Event;
use eventline_core::handler::HandlerError;
use eventline_core::queue::{DeadLetterItem, QueueError, RetryItem, RetryStore, require_id};
use std::sync::Arc;

/// Default attempt limit for queued items.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Service over a [`RetryStore`] that forwards exhausted items to a
/// [`DeadLetterQueue`].
pub struct RetryQueue {
    store: Arc<dyn RetryStore>,
    dead_letters: Arc<DeadLetterQueue>,
    clock: Arc<dyn Clock>,
    max_retries: u32,
}

impl RetryQueue {
    /// Create a queue whose items are dead-lettered after `max_retries` attempts.
    #[must_use]
    pub fn new(
        store: Arc<dyn RetryStore>,
        dead_letters: Arc<DeadLetterQueue>,
        max_retries: u32,
    ) -> Self {
        Self {
            store,
            dead_letters,
            clock: Arc::new(SystemClock),
            max_retries,
        }
    }

    /// Use `clock` for due times and bookkeeping.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Current time according to the queue's clock.
    #[must_use]
    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Attempt limit stamped on new items.
    #[must_use]
    pub const fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// The dead letter queue exhausted items are moved to.
    #[must_use]
    pub fn dead_letters(&self) -> &Arc<DeadLetterQueue> {
        &self.dead_letters
    }

    /// Park `event` for a later retry of `handler_name`.
    ///
    /// The item becomes due `attempt + 1` seconds from now. An existing live
    /// item for the same event and handler is updated instead of duplicated.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Validation`] for an empty handler name, or
    /// [`QueueError::Storage`] when the write fails.
    pub async fn add(
        &self,
        event: &dyn Event,
        handler_name: &str,
        error: &HandlerError,
        attempt: u32,
    ) -> Result<RetryItem, QueueError> {
        require_id(handler_name)?;
        let now = self.clock.now();
        let next_retry = now + chrono::Duration::seconds(i64::from(attempt) + 1);
        let item = RetryItem::new(
            event,
            handler_name,
            error.to_string(),
            attempt,
            self.max_retries,
            next_retry,
            now,
        );

        let stored = self.store.upsert(item).await?;
        tracing::info!(
            retry_id = %stored.id,
            handler = handler_name,
            event_type = event.event_type(),
            attempt,
            next_retry = %next_retry,
            "Event queued for retry"
        );
        Ok(stored)
    }

    /// Send a failure straight to the dead letter queue without queueing it.
    ///
    /// Used when the retry policy refuses even the first retry.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Storage`] when the dead letter store is unavailable.
    pub async fn dead_letter(
        &self,
        event: &dyn Event,
        handler_name: &str,
        error: &HandlerError,
    ) -> Result<DeadLetterItem, QueueError> {
        let now = self.clock.now();
        let item = RetryItem::new(
            event,
            handler_name,
            error.to_string(),
            0,
            self.max_retries,
            now,
            now,
        );
        self.dead_letters.add(&item).await
    }

    /// Due items (`next_retry <= now`), earliest first, at most `limit` (`0` for all).
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Storage`] when the read fails.
    pub async fn get(&self, limit: usize) -> Result<Vec<RetryItem>, QueueError> {
        self.store.due(self.clock.now(), limit).await
    }

    /// Fetch one item by id.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::NotFound`] when no such item exists.
    pub async fn get_item(&self, id: &str) -> Result<RetryItem, QueueError> {
        require_id(id)?;
        self.store
            .get(id)
            .await?
            .ok_or_else(|| QueueError::NotFound(id.to_string()))
    }

    /// The retry succeeded: drop the item. Removing a missing item is not an error.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Storage`] when the delete fails.
    pub async fn mark_success(&self, id: &str) -> Result<(), QueueError> {
        require_id(id)?;
        if self.store.remove(id).await? {
            tracing::info!(retry_id = id, "Retry succeeded");
        } else {
            tracing::debug!(retry_id = id, "Retry item already removed");
        }
        Ok(())
    }

    /// The item is out of retries: move it to the dead letter queue.
    ///
    /// The dead letter is written before the retry item is removed, so a
    /// failure in between can leave a duplicate but never loses the item.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::NotFound`] when the item is gone, or
    /// [`QueueError::Storage`] when either store fails.
    pub async fn mark_failed(&self, id: &str) -> Result<DeadLetterItem, QueueError> {
        let item = self.get_item(id).await?;
        let dead = self.dead_letters.add(&item).await?;
        self.store.remove(id).await?;
        tracing::warn!(
            retry_id = id,
            handler = %item.handler_name,
            event_type = %item.event_type,
            attempt = item.attempt,
            "Retry attempts exhausted"
        );
        Ok(dead)
    }

    /// Record progress after a failed retry.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::NotFound`] when the item is gone.
    pub async fn update_attempt(
        &self,
        id: &str,
        next_retry: DateTime<Utc>,
        attempt: u32,
        error: Option<&str>,
    ) -> Result<(), QueueError> {
        require_id(id)?;
        self.store
            .update_attempt(id, next_retry, attempt, error, self.clock.now())
            .await?;
        tracing::info!(
            retry_id = id,
            attempt,
            next_retry = %next_retry,
            "Retry rescheduled"
        );
        Ok(())
    }

    /// Number of live items.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Storage`] when the read fails.
    pub async fn count(&self) -> Result<u64, QueueError> {
        self.store.count().await
    }

    /// Delete items created before `before`. Returns the number removed.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Storage`] when the delete fails.
    pub async fn cleanup(&self, before: DateTime<Utc>) -> Result<u64, QueueError> {
        let removed = self.store.cleanup(before).await?;
        tracing::info!(removed, before = %before, "Retry queue cleanup completed");
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;
    use eventline_testing::fixtures::event_at;
    use eventline_testing::{InMemoryDeadLetterStore, InMemoryRetryStore, ManualClock, manual_clock};
    use std::time::Duration;

    struct Fixture {
        queue: RetryQueue,
        retries: Arc<InMemoryRetryStore>,
        dead_letters: Arc<InMemoryDeadLetterStore>,
        clock: ManualClock,
    }

    fn fixture(max_retries: u32) -> Fixture {
        let clock = manual_clock();
        let retries = Arc::new(InMemoryRetryStore::new());
        let dead_letters = Arc::new(InMemoryDeadLetterStore::new());
        let dlq = Arc::new(
            DeadLetterQueue::new(dead_letters.clone()).with_clock(Arc::new(clock.clone())),
        );
        let queue = RetryQueue::new(retries.clone(), dlq, max_retries)
            .with_clock(Arc::new(clock.clone()));
        Fixture {
            queue,
            retries,
            dead_letters,
            clock,
        }
    }

    fn failure() -> HandlerError {
        HandlerError::failed("card declined")
    }

    #[tokio::test]
    async fn test_add_seeds_delay_from_attempt() {
        let f = fixture(3);
        let event = event_at("order.created", "orders", f.clock.now(), 1);

        let item = f.queue.add(&event, "billing", &failure(), 2).await.unwrap();

        assert!(item.id.starts_with("rty_"));
        assert_eq!(item.next_retry, f.clock.now() + chrono::Duration::seconds(3));
        assert_eq!(item.max_retries, 3);
        assert_eq!(item.error, "card declined");
        assert!(f.queue.get(10).await.unwrap().is_empty());

        f.clock.advance(Duration::from_secs(3));
        assert_eq!(f.queue.get(10).await.unwrap(), vec![item]);
    }

    #[tokio::test]
    async fn test_add_updates_existing_item_for_same_pair() {
        let f = fixture(3);
        let event = event_at("order.created", "orders", f.clock.now(), 1);

        let first = f.queue.add(&event, "billing", &failure(), 0).await.unwrap();
        let second = f
            .queue
            .add(&event, "billing", &HandlerError::failed("timeout"), 1)
            .await
            .unwrap();
        f.queue.add(&event, "shipping", &failure(), 0).await.unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(second.attempt, 1);
        assert_eq!(second.error, "timeout");
        assert_eq!(f.queue.count().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_get_orders_by_due_time() {
        let f = fixture(3);
        let now = f.clock.now();
        let later = f
            .queue
            .add(&event_at("a", "s", now, 1), "h", &failure(), 2)
            .await
            .unwrap();
        let sooner = f
            .queue
            .add(&event_at("a", "s", now + chrono::Duration::seconds(1), 2), "h", &failure(), 0)
            .await
            .unwrap();
        f.clock.advance(Duration::from_secs(10));

        let due = f.queue.get(0).await.unwrap();

        assert_eq!(due.iter().map(|i| i.id.clone()).collect::<Vec<_>>(), vec![sooner.id.clone(), later.id]);
        assert_eq!(f.queue.get(1).await.unwrap()[0].id, sooner.id);
    }

    #[tokio::test]
    async fn test_mark_success_is_idempotent() {
        let f = fixture(3);
        let event = event_at("order.created", "orders", f.clock.now(), 1);
        let item = f.queue.add(&event, "billing", &failure(), 0).await.unwrap();

        f.queue.mark_success(&item.id).await.unwrap();
        f.queue.mark_success(&item.id).await.unwrap();

        assert_eq!(f.queue.count().await.unwrap(), 0);
        assert!(matches!(f.queue.mark_success("").await, Err(QueueError::Validation(_))));
    }

    #[tokio::test]
    async fn test_mark_failed_moves_item_to_dead_letters() {
        let f = fixture(2);
        let event = event_at("order.created", "orders", f.clock.now(), 1);
        let item = f.queue.add(&event, "billing", &failure(), 0).await.unwrap();
        f.queue
            .update_attempt(&item.id, f.clock.now(), 2, Some("still declined"))
            .await
            .unwrap();

        let dead = f.queue.mark_failed(&item.id).await.unwrap();

        assert_eq!(f.queue.count().await.unwrap(), 0);
        assert_eq!(f.queue.dead_letters().count().await.unwrap(), 1);
        assert_eq!(dead.attempt, 2);
        assert_eq!(dead.error, "still declined");
        assert!(dead.reason.contains("failed"));
        assert_eq!(dead.to_event(), event);
    }

    #[tokio::test]
    async fn test_mark_failed_keeps_item_when_dead_letter_write_fails() {
        let f = fixture(2);
        let event = event_at("order.created", "orders", f.clock.now(), 1);
        let item = f.queue.add(&event, "billing", &failure(), 0).await.unwrap();
        f.dead_letters.fail(true);

        let err = f.queue.mark_failed(&item.id).await.unwrap_err();

        assert!(matches!(err, QueueError::Storage(_)));
        assert_eq!(f.queue.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_update_attempt_missing_item() {
        let f = fixture(3);

        let err = f
            .queue
            .update_attempt("rty_missing", f.clock.now(), 1, None)
            .await
            .unwrap_err();

        assert_eq!(err, QueueError::NotFound("rty_missing".to_string()));
    }

    #[tokio::test]
    async fn test_dead_letter_skips_the_queue() {
        let f = fixture(3);
        let event = event_at("order.created", "orders", f.clock.now(), 1);

        let dead = f
            .queue
            .dead_letter(&event, "billing", &HandlerError::failed("invalid payload"))
            .await
            .unwrap();

        assert_eq!(dead.attempt, 0);
        assert_eq!(dead.error, "invalid payload");
        assert_eq!(f.queue.count().await.unwrap(), 0);
        assert_eq!(f.dead_letters.items().len(), 1);
    }

    #[tokio::test]
    async fn test_cleanup_removes_only_items_created_before_cutoff() {
        let f = fixture(3);
        let start = f.clock.now();
        let old = RetryItem::new(
            &event_at("a", "s", start, 1),
            "h",
            "e",
            0,
            3,
            start,
            start - chrono::Duration::seconds(1),
        );
        let at_cutoff = RetryItem::new(&event_at("a", "s", start, 2), "h2", "e", 0, 3, start, start);
        let newer = RetryItem::new(
            &event_at("a", "s", start, 3),
            "h3",
            "e",
            0,
            3,
            start,
            start + chrono::Duration::seconds(1),
        );
        for item in [old.clone(), at_cutoff.clone(), newer.clone()] {
            f.retries.insert(item);
        }

        let removed = f.queue.cleanup(start).await.unwrap();

        assert_eq!(removed, 1);
        let ids: Vec<_> = f.retries.items().into_iter().map(|i| i.id).collect();
        assert_eq!(ids, vec![at_cutoff.id, newer.id]);
    }
}
