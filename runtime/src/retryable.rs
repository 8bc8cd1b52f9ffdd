//! Retry decorators for handlers and buses.
//!
//! Two separate strategies, picked per handler:
//!
//! - [`RetryableEventHandler`] retries inline: the caller waits while the
//!   handler is re-run with the policy's delays, and gets a wrapped error once
//!   the policy gives up.
//! - [`DeferredRetryHandler`] retries later: the failure is parked on the
//!   [`RetryQueue`] (or dead-lettered when the policy refuses outright) and the
//!   bus sees success, so sibling handlers still run under `publish`.
//!
//! Stacking both is allowed: the deferred handler then only sees failures the
//! inline loop already gave up on.
//!
//! Inside [`redeliver`] the deferred handler stops parking failures and
//! returns them, so the retry worker and dead letter reprocessing see the
//! outcome of their own redelivery.

use crate::metrics::EventMetrics;
use crate::retry::{RetryPolicy, retry_with_policy};
use crate::retry_queue::RetryQueue;
use eventline_core::event::{Event, SharedEvent};
use eventline_core::event_bus::{EventBus, EventBusError};
use eventline_core::handler::{EventHandler, HandlerError};
use futures::future::BoxFuture;
use std::sync::Arc;

tokio::task_local! {
    static REDELIVERING: ();
}

/// Run `fut` as a redelivery of an already queued or dead-lettered failure.
///
/// [`DeferredRetryHandler`]s invoked from within `fut` on the same task
/// return their inner handler's error instead of queueing it again.
pub async fn redeliver<F: Future>(fut: F) -> F::Output {
    REDELIVERING.scope((), fut).await
}

/// Returns `true` inside [`redeliver`].
#[must_use]
pub fn is_redelivering() -> bool {
    REDELIVERING.try_with(|()| ()).is_ok()
}

/// Handler decorator retrying the inner handler inline.
pub struct RetryableEventHandler {
    inner: Arc<dyn EventHandler>,
    policy: Arc<dyn RetryPolicy>,
}

impl RetryableEventHandler {
    /// Wrap `inner`, retrying according to `policy`.
    #[must_use]
    pub fn new(inner: Arc<dyn EventHandler>, policy: Arc<dyn RetryPolicy>) -> Self {
        Self { inner, policy }
    }
}

impl EventHandler for RetryableEventHandler {
    fn handle<'a>(&'a self, event: &'a dyn Event) -> BoxFuture<'a, Result<(), HandlerError>> {
        Box::pin(async move {
            retry_with_policy(self.policy.as_ref(), self.inner.handler_name(), |_| {
                self.inner.handle(event)
            })
            .await
        })
    }

    fn handler_name(&self) -> &str {
        self.inner.handler_name()
    }

    fn supported_event_types(&self) -> Vec<String> {
        self.inner.supported_event_types()
    }
}

/// Bus decorator that wraps every subscribed handler in a [`RetryableEventHandler`].
pub struct RetryableEventBus {
    inner: Arc<dyn EventBus>,
    policy: Arc<dyn RetryPolicy>,
}

impl RetryableEventBus {
    /// Wrap `inner`; handlers subscribed through this bus retry with `policy`.
    #[must_use]
    pub fn new(inner: Arc<dyn EventBus>, policy: Arc<dyn RetryPolicy>) -> Self {
        Self { inner, policy }
    }
}

impl EventBus for RetryableEventBus {
    fn subscribe(&self, event_type: &str, handler: Arc<dyn EventHandler>) {
        let wrapped = RetryableEventHandler::new(handler, Arc::clone(&self.policy));
        self.inner.subscribe(event_type, Arc::new(wrapped));
    }

    fn unsubscribe(&self, event_type: &str, handler_name: &str) {
        self.inner.unsubscribe(event_type, handler_name);
    }

    fn publish(&self, event: SharedEvent) -> BoxFuture<'_, Result<(), EventBusError>> {
        self.inner.publish(event)
    }

    fn publish_async(&self, event: SharedEvent) -> BoxFuture<'_, Result<(), EventBusError>> {
        self.inner.publish_async(event)
    }
}

/// Handler decorator routing failures to the deferred retry queue.
///
/// During a [`redeliver`] scope failures pass through unchanged; the caller
/// owns the bookkeeping of the item being redelivered.
pub struct DeferredRetryHandler {
    inner: Arc<dyn EventHandler>,
    queue: Arc<RetryQueue>,
    policy: Arc<dyn RetryPolicy>,
    metrics: Option<Arc<EventMetrics>>,
}

impl DeferredRetryHandler {
    /// Wrap `inner`, parking its failures on `queue`.
    ///
    /// `policy` only decides whether the first failure is worth queueing;
    /// later delays are applied by the worker.
    #[must_use]
    pub fn new(
        inner: Arc<dyn EventHandler>,
        queue: Arc<RetryQueue>,
        policy: Arc<dyn RetryPolicy>,
    ) -> Self {
        Self {
            inner,
            queue,
            policy,
            metrics: None,
        }
    }

    /// Count enqueued retries.
    #[must_use]
    pub fn with_metrics(mut self, metrics: Arc<EventMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    async fn route(&self, event: &dyn Event, err: HandlerError) -> Result<(), HandlerError> {
        let name = self.inner.handler_name();

        let routed = if self.policy.should_retry(&err, 0) {
            self.queue.add(event, name, &err, 0).await.map(|item| {
                if let Some(metrics) = &self.metrics {
                    metrics.record_retry_enqueued(event.event_type(), name);
                }
                tracing::debug!(retry_id = %item.id, handler = name, "Handler failure deferred");
            })
        } else {
            self.queue.dead_letter(event, name, &err).await.map(|_| ())
        };

        match routed {
            Ok(()) => Ok(()),
            Err(queue_err) => {
                tracing::error!(
                    handler = name,
                    event_type = event.event_type(),
                    error = %err,
                    queue_error = %queue_err,
                    "Failed to route handler failure for retry"
                );
                Err(err)
            }
        }
    }
}

impl EventHandler for DeferredRetryHandler {
    fn handle<'a>(&'a self, event: &'a dyn Event) -> BoxFuture<'a, Result<(), HandlerError>> {
        Box::pin(async move {
            match self.inner.handle(event).await {
                Ok(()) => Ok(()),
                Err(err) if is_redelivering() => Err(err),
                Err(err) => self.route(event, err).await,
            }
        })
    }

    fn handler_name(&self) -> &str {
        self.inner.handler_name()
    }

    fn supported_event_types(&self) -> Vec<String> {
        self.inner.supported_event_types()
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;
    use crate::bus::SimpleEventBus;
    use crate::dead_letter::DeadLetterQueue;
    use crate::retry::{ExponentialBackoff, FixedDelay};
    use eventline_testing::fixtures::order_created;
    use eventline_testing::{InMemoryDeadLetterStore, InMemoryRetryStore, RecordingHandler};
    use std::time::Duration;

    fn fixed(max_retries: u32) -> Arc<dyn RetryPolicy> {
        Arc::new(FixedDelay::new(max_retries, Duration::from_millis(10)))
    }

    fn retry_queue() -> (Arc<RetryQueue>, Arc<InMemoryRetryStore>, Arc<InMemoryDeadLetterStore>) {
        let retries = Arc::new(InMemoryRetryStore::new());
        let dead_letters = Arc::new(InMemoryDeadLetterStore::new());
        let dlq = Arc::new(DeadLetterQueue::new(dead_letters.clone()));
        let queue = Arc::new(RetryQueue::new(retries.clone(), dlq, 3));
        (queue, retries, dead_letters)
    }

    #[tokio::test(start_paused = true)]
    async fn test_inline_retry_recovers() {
        let inner = RecordingHandler::new("billing", ["order.created"]).failing_times(2);
        let handler = RetryableEventHandler::new(inner.clone().shared(), fixed(3));
        let event = order_created();

        handler.handle(event.as_ref()).await.unwrap();

        assert_eq!(inner.call_count(), 3);
        assert_eq!(handler.handler_name(), "billing");
    }

    #[tokio::test(start_paused = true)]
    async fn test_inline_retry_wraps_final_error() {
        let inner = RecordingHandler::new("billing", ["order.created"])
            .failing_always()
            .with_message("declined");
        let handler = RetryableEventHandler::new(inner.clone().shared(), fixed(2));
        let event = order_created();

        let err = handler.handle(event.as_ref()).await.unwrap_err();

        assert_eq!(inner.call_count(), 3);
        assert_eq!(
            err,
            HandlerError::Exhausted {
                attempts: 3,
                last: Box::new(HandlerError::failed("declined")),
            }
        );
    }

    #[tokio::test]
    async fn test_inline_retry_skips_cancellation() {
        struct Cancelling;
        impl EventHandler for Cancelling {
            fn handle<'a>(&'a self, _: &'a dyn Event) -> BoxFuture<'a, Result<(), HandlerError>> {
                Box::pin(async { Err(HandlerError::Cancelled) })
            }
            fn handler_name(&self) -> &str {
                "cancelling"
            }
            fn supported_event_types(&self) -> Vec<String> {
                vec!["order.created".to_string()]
            }
        }
        let handler =
            RetryableEventHandler::new(Arc::new(Cancelling), Arc::new(ExponentialBackoff::default()));

        let err = handler.handle(order_created().as_ref()).await.unwrap_err();

        assert_eq!(err, HandlerError::Cancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retryable_bus_wraps_subscribers_and_keeps_names() {
        let base = Arc::new(SimpleEventBus::new());
        let bus = RetryableEventBus::new(base.clone(), fixed(3));
        let inner = RecordingHandler::new("billing", ["order.created"]).failing_times(1);
        bus.subscribe("order.created", inner.clone().shared());

        bus.publish(order_created()).await.unwrap();
        assert_eq!(inner.call_count(), 2);

        bus.unsubscribe("order.created", "billing");
        assert_eq!(base.handler_count("order.created"), 0);
    }

    #[tokio::test]
    async fn test_deferred_handler_queues_and_reports_success() {
        let (queue, retries, _) = retry_queue();
        let bus = SimpleEventBus::new();
        let failing = RecordingHandler::new("billing", ["order.created"]).failing_always();
        let sibling = RecordingHandler::new("audit", ["order.created"]);
        bus.subscribe(
            "order.created",
            Arc::new(DeferredRetryHandler::new(failing.clone().shared(), queue.clone(), fixed(3))),
        );
        bus.subscribe("order.created", sibling.clone().shared());

        bus.publish(order_created()).await.unwrap();

        assert_eq!(sibling.call_count(), 1);
        let items = retries.items();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].handler_name, "billing");
        assert_eq!(items[0].attempt, 0);
        assert_eq!(items[0].error, "handler failure");
    }

    #[tokio::test]
    async fn test_deferred_handler_dead_letters_when_policy_refuses() {
        let (queue, retries, dead_letters) = retry_queue();
        let failing = RecordingHandler::new("billing", ["order.created"]).failing_always();
        let handler = DeferredRetryHandler::new(failing.shared(), queue, fixed(0));

        handler.handle(order_created().as_ref()).await.unwrap();

        assert!(retries.items().is_empty());
        assert_eq!(dead_letters.items().len(), 1);
    }

    #[tokio::test]
    async fn test_deferred_handler_returns_original_error_when_queue_fails() {
        let (queue, retries, _) = retry_queue();
        retries.fail(true);
        let failing = RecordingHandler::new("billing", ["order.created"])
            .failing_always()
            .with_message("declined");
        let handler = DeferredRetryHandler::new(failing.shared(), queue, fixed(3));

        let err = handler.handle(order_created().as_ref()).await.unwrap_err();

        assert_eq!(err, HandlerError::failed("declined"));
    }

    #[tokio::test]
    async fn test_deferred_handler_counts_enqueued_retries() {
        let (queue, _, _) = retry_queue();
        let metrics = Arc::new(EventMetrics::new().unwrap());
        let failing = RecordingHandler::new("billing", ["order.created"]).failing_always();
        let handler = DeferredRetryHandler::new(failing.shared(), queue, fixed(3))
            .with_metrics(metrics.clone());

        handler.handle(order_created().as_ref()).await.unwrap();

        let text = metrics.export_prometheus().unwrap();
        assert!(text.contains("eventline_retry_enqueued_total"));
    }

    #[tokio::test]
    async fn test_deferred_handler_passes_failures_through_while_redelivering() {
        let (queue, retries, dead_letters) = retry_queue();
        let failing = RecordingHandler::new("billing", ["order.created"])
            .failing_always()
            .with_message("declined");
        let handler = DeferredRetryHandler::new(failing.clone().shared(), queue, fixed(3));
        let event = order_created();

        assert!(!is_redelivering());
        let err = redeliver(handler.handle(event.as_ref())).await.unwrap_err();

        assert_eq!(err, HandlerError::failed("declined"));
        assert!(retries.items().is_empty());
        assert!(dead_letters.items().is_empty());

        handler.handle(event.as_ref()).await.unwrap();
        assert_eq!(retries.items().len(), 1);
        assert_eq!(failing.call_count(), 2);
    }
}
