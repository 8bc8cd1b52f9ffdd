//! Dead letter queue for failures that exhausted their retries.
//!
//! Items are created only by the retry queue (exhaustion, or a policy that
//! refuses the first retry) and are changed only by manual reprocessing.
//! They are removed by [`DeadLetterQueue::delete`] or time-based cleanup.
//!
//! # Reprocessing
//!
//! [`DeadLetterQueue::reprocess`] rebuilds the event and publishes it on the
//! bus passed in. The item is marked processed only when that publish
//! succeeds; on failure it stays in the unprocessed list and the error is
//! returned, so `processed` always means "resubmitted successfully".

use crate::retryable::redeliver;
use chrono::{DateTime, Utc};
use eventline_core::environment::{Clock, SystemClock};
use eventline_core::event_bus::EventBus;
use eventline_core::queue::{DeadLetterItem, DeadLetterStore, QueueError, RetryItem, require_id};
use std::sync::Arc;
use std::time::Duration;

/// Service over a [`DeadLetterStore`].
pub struct DeadLetterQueue {
    store: Arc<dyn DeadLetterStore>,
    clock: Arc<dyn Clock>,
}

impl DeadLetterQueue {
    /// Create a queue backed by `store`, using the system clock.
    #[must_use]
    pub fn new(store: Arc<dyn DeadLetterStore>) -> Self {
        Self {
            store,
            clock: Arc::new(SystemClock),
        }
    }

    /// Use `clock` for timestamps and retention.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Convert `item` into a dead letter and store it.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Storage`] when the store is unavailable.
    pub async fn add(&self, item: &RetryItem) -> Result<DeadLetterItem, QueueError> {
        let dead = DeadLetterItem::from_retry(item, self.clock.now());
        self.store.insert(dead.clone()).await?;
        tracing::warn!(
            dead_letter_id = %dead.id,
            retry_id = %item.id,
            handler = %dead.handler_name,
            event_type = %dead.event_type,
            attempt = dead.attempt,
            error = %dead.error,
            "Event moved to dead letter queue"
        );
        Ok(dead)
    }

    /// Unprocessed items, newest first (`limit == 0` for all).
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Storage`] when the read fails.
    pub async fn list(&self, limit: usize, offset: usize) -> Result<Vec<DeadLetterItem>, QueueError> {
        self.store.list_unprocessed(limit, offset).await
    }

    /// Fetch one item.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::NotFound`] when no such item exists.
    pub async fn get(&self, id: &str) -> Result<DeadLetterItem, QueueError> {
        require_id(id)?;
        self.store
            .get(id)
            .await?
            .ok_or_else(|| QueueError::NotFound(id.to_string()))
    }

    /// Republish the item's event on `bus` and mark it processed on success.
    ///
    /// # Errors
    ///
    /// - [`QueueError::NotFound`] when no such item exists
    /// - [`QueueError::Republish`] when the bus rejects the event (item stays unprocessed)
    pub async fn reprocess(&self, id: &str, bus: &dyn EventBus) -> Result<(), QueueError> {
        let item = self.get(id).await?;

        if let Err(err) = redeliver(bus.publish(item.to_event().shared())).await {
            tracing::warn!(
                dead_letter_id = %item.id,
                handler = %item.handler_name,
                event_type = %item.event_type,
                error = %err,
                "Dead letter reprocessing failed"
            );
            return Err(QueueError::Republish(err));
        }

        self.store.mark_processed(id, self.clock.now()).await?;
        tracing::info!(
            dead_letter_id = %item.id,
            handler = %item.handler_name,
            event_type = %item.event_type,
            "Dead letter reprocessed"
        );
        Ok(())
    }

    /// Delete one item.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::NotFound`] when no such item exists.
    pub async fn delete(&self, id: &str) -> Result<(), QueueError> {
        require_id(id)?;
        if self.store.remove(id).await? {
            Ok(())
        } else {
            Err(QueueError::NotFound(id.to_string()))
        }
    }

    /// Number of unprocessed items.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Storage`] when the read fails.
    pub async fn count(&self) -> Result<u64, QueueError> {
        self.store.count_unprocessed().await
    }

    /// Delete items created before `before`. Returns the number removed.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Storage`] when the delete fails.
    pub async fn cleanup(&self, before: DateTime<Utc>) -> Result<u64, QueueError> {
        let removed = self.store.cleanup(before).await?;
        tracing::info!(removed, before = %before, "Dead letter cleanup completed");
        Ok(removed)
    }

    /// Apply a retention window: delete items older than `retention`.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Validation`] when `retention` is out of range,
    /// or [`QueueError::Storage`] when the delete fails.
    pub async fn purge_older_than(&self, retention: Duration) -> Result<u64, QueueError> {
        let before = chrono::Duration::from_std(retention)
            .ok()
            .and_then(|r| self.clock.now().checked_sub_signed(r))
            .ok_or_else(|| {
                QueueError::Validation(format!("retention out of range: {retention:?}"))
            })?;
        self.cleanup(before).await
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;
    use crate::bus::SimpleEventBus;
    use eventline_testing::fixtures::event_at;
    use eventline_testing::{InMemoryDeadLetterStore, RecordingHandler, manual_clock};

    fn retry_item(seq: u64, attempt: u32) -> RetryItem {
        let now = Utc::now();
        let event = event_at("order.created", "orders", now, seq);
        let mut item = RetryItem::new(&event, "billing", "card declined", 0, 3, now, now);
        item.attempt = attempt;
        item
    }

    fn queue() -> (DeadLetterQueue, Arc<InMemoryDeadLetterStore>) {
        let store = Arc::new(InMemoryDeadLetterStore::new());
        (DeadLetterQueue::new(store.clone()), store)
    }

    #[tokio::test]
    async fn test_add_records_reason() {
        let (dlq, _) = queue();

        let dead = dlq.add(&retry_item(1, 3)).await.unwrap();

        assert_eq!(dead.reason, "retried 3 times then failed");
        assert_eq!(dlq.count().await.unwrap(), 1);
        assert_eq!(dlq.get(&dead.id).await.unwrap(), dead);
    }

    #[tokio::test]
    async fn test_list_newest_first() {
        let clock = manual_clock();
        let store = Arc::new(InMemoryDeadLetterStore::new());
        let dlq = DeadLetterQueue::new(store).with_clock(Arc::new(clock.clone()));
        let first = dlq.add(&retry_item(1, 3)).await.unwrap();
        clock.advance(Duration::from_secs(1));
        let second = dlq.add(&retry_item(2, 3)).await.unwrap();

        let listed = dlq.list(10, 0).await.unwrap();

        assert_eq!(listed.iter().map(|i| i.id.clone()).collect::<Vec<_>>(), vec![second.id, first.id]);
        assert_eq!(dlq.list(1, 1).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_reprocess_marks_processed_after_republish() {
        let (dlq, store) = queue();
        let bus = SimpleEventBus::new();
        let handler = RecordingHandler::new("billing", ["order.created"]);
        bus.subscribe("order.created", handler.clone().shared());
        let dead = dlq.add(&retry_item(1, 3)).await.unwrap();

        dlq.reprocess(&dead.id, &bus).await.unwrap();

        assert_eq!(handler.call_count(), 1);
        assert_eq!(handler.events()[0], dead.to_event());
        assert_eq!(dlq.count().await.unwrap(), 0);
        let stored = store.items();
        assert!(stored[0].processed);
        assert!(stored[0].processed_at.is_some());
    }

    #[tokio::test]
    async fn test_reprocess_failure_leaves_item_unprocessed() {
        let (dlq, _) = queue();
        let bus = SimpleEventBus::new();
        bus.subscribe(
            "order.created",
            RecordingHandler::new("billing", ["order.created"]).failing_always().shared(),
        );
        let dead = dlq.add(&retry_item(1, 3)).await.unwrap();

        let err = dlq.reprocess(&dead.id, &bus).await.unwrap_err();

        assert!(matches!(err, QueueError::Republish(_)));
        assert_eq!(dlq.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_missing_and_blank_ids() {
        let (dlq, _) = queue();
        let bus = SimpleEventBus::new();

        assert!(matches!(dlq.get("dlq_missing").await, Err(QueueError::NotFound(_))));
        assert!(matches!(dlq.delete("dlq_missing").await, Err(QueueError::NotFound(_))));
        assert!(matches!(dlq.reprocess("", &bus).await, Err(QueueError::Validation(_))));
    }

    #[tokio::test]
    async fn test_cleanup_removes_only_older_items() {
        let clock = manual_clock();
        let store = Arc::new(InMemoryDeadLetterStore::new());
        let dlq = DeadLetterQueue::new(store.clone()).with_clock(Arc::new(clock.clone()));
        let old = dlq.add(&retry_item(1, 3)).await.unwrap();
        clock.advance(Duration::from_secs(60));
        let cutoff = clock.now();
        let at_cutoff = dlq.add(&retry_item(2, 3)).await.unwrap();
        clock.advance(Duration::from_secs(60));
        let newer = dlq.add(&retry_item(3, 3)).await.unwrap();

        let removed = dlq.cleanup(cutoff).await.unwrap();

        assert_eq!(removed, 1);
        let ids: Vec<_> = store.items().into_iter().map(|i| i.id).collect();
        assert!(!ids.contains(&old.id));
        assert!(ids.contains(&at_cutoff.id));
        assert!(ids.contains(&newer.id));
    }

    #[tokio::test]
    async fn test_purge_older_than_retention() {
        let clock = manual_clock();
        let store = Arc::new(InMemoryDeadLetterStore::new());
        let dlq = DeadLetterQueue::new(store).with_clock(Arc::new(clock.clone()));
        dlq.add(&retry_item(1, 3)).await.unwrap();
        clock.advance(Duration::from_secs(31 * 24 * 60 * 60));
        dlq.add(&retry_item(2, 3)).await.unwrap();

        let removed = dlq
            .purge_older_than(eventline_core::event_store::DEFAULT_RETENTION)
            .await
            .unwrap();

        assert_eq!(removed, 1);
        assert_eq!(dlq.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_purge_rejects_retention_before_the_calendar() {
        let (dlq, _) = queue();
        dlq.add(&retry_item(1, 3)).await.unwrap();

        for retention in [Duration::from_secs(300_000 * 365 * 24 * 60 * 60), Duration::MAX] {
            assert!(matches!(
                dlq.purge_older_than(retention).await,
                Err(QueueError::Validation(_))
            ));
        }
        assert_eq!(dlq.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_reprocess_through_deferred_handler_reports_failure() {
        let (dlq, _) = queue();
        let retry_store = Arc::new(eventline_testing::InMemoryRetryStore::new());
        let dead_letters = Arc::new(DeadLetterQueue::new(Arc::new(InMemoryDeadLetterStore::new())));
        let retries = Arc::new(crate::retry_queue::RetryQueue::new(retry_store, dead_letters, 3));
        let billing = RecordingHandler::new("billing", ["order.created"]).failing_always();
        let bus = SimpleEventBus::new();
        bus.subscribe(
            "order.created",
            Arc::new(crate::retryable::DeferredRetryHandler::new(
                billing.clone().shared(),
                Arc::clone(&retries),
                Arc::new(crate::retry::FixedDelay::new(3, Duration::from_secs(1))),
            )),
        );
        let dead = dlq.add(&retry_item(1, 3)).await.unwrap();

        let err = dlq.reprocess(&dead.id, &bus).await.unwrap_err();

        assert!(matches!(err, QueueError::Republish(_)));
        assert_eq!(billing.call_count(), 1);
        assert_eq!(dlq.count().await.unwrap(), 1);
        assert_eq!(retries.count().await.unwrap(), 0);
    }
}
