//! Prometheus decorators.

use crate::metrics::{EventMetrics, STATUS_ERROR, STATUS_SUCCESS};
use chrono::{DateTime, Utc};
use eventline_core::CancellationToken;
use eventline_core::event::{Event, SharedEvent};
use eventline_core::event_bus::{EventBus, EventBusError};
use eventline_core::event_store::{
    EventFilter, EventStore, EventStoreError, ReplayResult, SortOrder, StoredEvent,
};
use eventline_core::handler::{EventHandler, HandlerError};
use futures::future::BoxFuture;
use std::sync::Arc;
use std::time::Instant;

const fn status<T, E>(result: &Result<T, E>) -> &'static str {
    if result.is_ok() { STATUS_SUCCESS } else { STATUS_ERROR }
}

/// Counts and times handler invocations.
pub struct MetricsEventHandler {
    inner: Arc<dyn EventHandler>,
    metrics: Arc<EventMetrics>,
}

impl MetricsEventHandler {
    /// Wrap `inner`, recording into `metrics`.
    #[must_use]
    pub fn new(inner: Arc<dyn EventHandler>, metrics: Arc<EventMetrics>) -> Self {
        Self { inner, metrics }
    }
}

impl EventHandler for MetricsEventHandler {
    fn handle<'a>(&'a self, event: &'a dyn Event) -> BoxFuture<'a, Result<(), HandlerError>> {
        Box::pin(async move {
            let started = Instant::now();
            let result = self.inner.handle(event).await;
            self.metrics.record_handle(
                event.event_type(),
                self.inner.handler_name(),
                status(&result),
                started.elapsed(),
            );
            result
        })
    }

    fn handler_name(&self) -> &str {
        self.inner.handler_name()
    }

    fn supported_event_types(&self) -> Vec<String> {
        self.inner.supported_event_types()
    }
}

/// Counts and times publishes, and meters every subscribed handler.
pub struct MetricsEventBus {
    inner: Arc<dyn EventBus>,
    metrics: Arc<EventMetrics>,
}

impl MetricsEventBus {
    /// Wrap `inner`, recording into `metrics`.
    #[must_use]
    pub fn new(inner: Arc<dyn EventBus>, metrics: Arc<EventMetrics>) -> Self {
        Self { inner, metrics }
    }
}

impl EventBus for MetricsEventBus {
    fn subscribe(&self, event_type: &str, handler: Arc<dyn EventHandler>) {
        let wrapped = MetricsEventHandler::new(handler, Arc::clone(&self.metrics));
        self.inner.subscribe(event_type, Arc::new(wrapped));
    }

    fn unsubscribe(&self, event_type: &str, handler_name: &str) {
        self.inner.unsubscribe(event_type, handler_name);
    }

    fn publish(&self, event: SharedEvent) -> BoxFuture<'_, Result<(), EventBusError>> {
        Box::pin(async move {
            let started = Instant::now();
            let result = self.inner.publish(Arc::clone(&event)).await;
            self.metrics
                .record_publish(event.event_type(), status(&result), started.elapsed());
            result
        })
    }

    fn publish_async(&self, event: SharedEvent) -> BoxFuture<'_, Result<(), EventBusError>> {
        Box::pin(async move {
            let started = Instant::now();
            let result = self.inner.publish_async(Arc::clone(&event)).await;
            self.metrics
                .record_publish(event.event_type(), status(&result), started.elapsed());
            result
        })
    }
}

/// Store decorator recording replay outcomes.
///
/// Every other operation is forwarded as is.
pub struct MetricsEventStore {
    inner: Arc<dyn EventStore>,
    metrics: Arc<EventMetrics>,
}

impl MetricsEventStore {
    /// Wrap `inner`, recording into `metrics`.
    #[must_use]
    pub fn new(inner: Arc<dyn EventStore>, metrics: Arc<EventMetrics>) -> Self {
        Self { inner, metrics }
    }
}

const fn replay_error_type(err: &EventStoreError) -> &'static str {
    match err {
        EventStoreError::Validation(_) => "validation",
        EventStoreError::Interrupted { .. } => "interrupted",
        EventStoreError::Database(_) | EventStoreError::Serialization(_) => "query_error",
    }
}

impl EventStore for MetricsEventStore {
    fn store<'a>(&'a self, event: &'a dyn Event) -> BoxFuture<'a, Result<(), EventStoreError>> {
        self.inner.store(event)
    }

    fn store_batch<'a>(
        &'a self,
        events: &'a [SharedEvent],
    ) -> BoxFuture<'a, Result<(), EventStoreError>> {
        self.inner.store_batch(events)
    }

    fn get_by_id<'a>(
        &'a self,
        id: &'a str,
    ) -> BoxFuture<'a, Result<Option<StoredEvent>, EventStoreError>> {
        self.inner.get_by_id(id)
    }

    fn query<'a>(
        &'a self,
        filter: &'a EventFilter,
        order: SortOrder,
    ) -> BoxFuture<'a, Result<Vec<StoredEvent>, EventStoreError>> {
        self.inner.query(filter, order)
    }

    fn count<'a>(&'a self, filter: &'a EventFilter) -> BoxFuture<'a, Result<u64, EventStoreError>> {
        self.inner.count(filter)
    }

    fn cleanup(&self, before: DateTime<Utc>) -> BoxFuture<'_, Result<u64, EventStoreError>> {
        self.inner.cleanup(before)
    }

    fn mark_processed<'a>(&'a self, id: &'a str) -> BoxFuture<'a, Result<(), EventStoreError>> {
        self.inner.mark_processed(id)
    }

    fn purge_expired(&self) -> BoxFuture<'_, Result<u64, EventStoreError>> {
        self.inner.purge_expired()
    }

    fn health(&self) -> BoxFuture<'_, Result<(), EventStoreError>> {
        self.inner.health()
    }

    fn replay<'a>(
        &'a self,
        handler: &'a dyn EventHandler,
        filter: &'a EventFilter,
        cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, Result<ReplayResult, EventStoreError>> {
        Box::pin(async move {
            let event_type = filter.event_type.as_deref().unwrap_or("all");
            let result = self.inner.replay(handler, filter, cancel).await;
            match &result {
                Ok(summary) => {
                    self.metrics
                        .record_replay(event_type, summary.failed_count, summary.duration);
                }
                Err(err) => {
                    self.metrics
                        .record_replay_failed(event_type, replay_error_type(err));
                }
            }
            result
        })
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;
    use crate::bus::SimpleEventBus;
    use eventline_testing::fixtures::{event_series, order_created};
    use eventline_testing::{InMemoryEventStore, RecordingHandler};

    fn metrics() -> Arc<EventMetrics> {
        Arc::new(EventMetrics::new().unwrap())
    }

    fn approx(value: f64, expected: f64) -> bool {
        (value - expected).abs() < f64::EPSILON
    }

    #[tokio::test]
    async fn test_bus_counts_publishes_and_handler_outcomes() {
        let metrics = metrics();
        let bus = MetricsEventBus::new(Arc::new(SimpleEventBus::new()), metrics.clone());
        bus.subscribe("order.created", RecordingHandler::new("audit", ["order.created"]).shared());
        bus.subscribe(
            "order.created",
            RecordingHandler::new("billing", ["order.created"]).failing_always().shared(),
        );

        bus.publish(order_created()).await.unwrap_err();

        assert!(approx(metrics.published_count("order.created", STATUS_ERROR), 1.0));
        assert!(approx(metrics.handled_count("order.created", "audit", STATUS_SUCCESS), 1.0));
        assert!(approx(metrics.handled_count("order.created", "billing", STATUS_ERROR), 1.0));
    }

    #[tokio::test]
    async fn test_store_records_replay_success() {
        let metrics = metrics();
        let inner = Arc::new(InMemoryEventStore::new());
        let batch = event_series("order.created", "orders", Utc::now(), 3);
        inner.store_batch(&batch).await.unwrap();
        let store = MetricsEventStore::new(inner, metrics.clone());
        let handler = RecordingHandler::new("audit", ["order.created"])
            .failing_when(|e| e.event_data()["seq"] == serde_json::json!(1));

        let result = store
            .replay(&handler, &EventFilter::new(), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(result.failed_count, 1);
        let text = metrics.export_prometheus().unwrap();
        assert!(text.contains("eventline_events_replay_total{event_type=\"all\",status=\"partial_failure\"} 1"));
    }

    #[tokio::test]
    async fn test_store_records_replay_validation_failure() {
        let metrics = metrics();
        let store = MetricsEventStore::new(Arc::new(InMemoryEventStore::new()), metrics.clone());
        let handler = RecordingHandler::new("audit", ["order.created"]);
        let filter = EventFilter::new()
            .with_event_type("order.created")
            .with_page(-1, 0);

        let err = store
            .replay(&handler, &filter, &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, EventStoreError::Validation(_)));
        let text = metrics.export_prometheus().unwrap();
        assert!(
            text.lines()
                .filter(|l| l.starts_with("eventline_events_replay_failed_total"))
                .any(|l| l.contains("validation") && l.contains("order.created"))
        );
    }

    #[tokio::test]
    async fn test_replay_conveniences_go_through_decorator() {
        let metrics = metrics();
        let inner = Arc::new(InMemoryEventStore::new());
        inner.store(order_created().as_ref()).await.unwrap();
        let store = MetricsEventStore::new(inner, metrics.clone());
        let handler = RecordingHandler::new("audit", ["order.created"]);

        store
            .replay_with_type("order.created", &handler, &CancellationToken::new())
            .await
            .unwrap();

        let text = metrics.export_prometheus().unwrap();
        assert!(text.contains(
            "eventline_events_replay_total{event_type=\"order.created\",status=\"success\"} 1"
        ));
    }
}
