//! Structured log line decorators.

use super::millis;
use eventline_core::event::{Event, SharedEvent};
use eventline_core::event_bus::{EventBus, EventBusError};
use eventline_core::handler::{EventHandler, HandlerError};
use futures::future::BoxFuture;
use std::sync::Arc;
use std::time::Instant;

/// Logs the outcome of every handler call.
pub struct LoggingEventHandler {
    inner: Arc<dyn EventHandler>,
}

impl LoggingEventHandler {
    /// Wrap `inner`.
    #[must_use]
    pub fn new(inner: Arc<dyn EventHandler>) -> Self {
        Self { inner }
    }
}

impl EventHandler for LoggingEventHandler {
    fn handle<'a>(&'a self, event: &'a dyn Event) -> BoxFuture<'a, Result<(), HandlerError>> {
        Box::pin(async move {
            let started = Instant::now();
            let result = self.inner.handle(event).await;
            let duration_ms = millis(started.elapsed());
            match &result {
                Ok(()) => tracing::info!(
                    event_type = event.event_type(),
                    source = event.source(),
                    handler = self.inner.handler_name(),
                    duration_ms,
                    "Event handled"
                ),
                Err(err) => tracing::error!(
                    event_type = event.event_type(),
                    source = event.source(),
                    handler = self.inner.handler_name(),
                    duration_ms,
                    error = %err,
                    "Event handler failed"
                ),
            }
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

/// Logs every publish and every subscribed handler's outcome.
pub struct LoggingEventBus {
    inner: Arc<dyn EventBus>,
}

impl LoggingEventBus {
    /// Wrap `inner`.
    #[must_use]
    pub fn new(inner: Arc<dyn EventBus>) -> Self {
        Self { inner }
    }

    fn log_outcome(
        event: &dyn Event,
        mode: &'static str,
        started: Instant,
        result: &Result<(), EventBusError>,
    ) {
        let duration_ms = millis(started.elapsed());
        match result {
            Ok(()) => tracing::info!(
                event_type = event.event_type(),
                source = event.source(),
                mode,
                duration_ms,
                "Event published"
            ),
            Err(err) => tracing::error!(
                event_type = event.event_type(),
                source = event.source(),
                mode,
                duration_ms,
                error = %err,
                "Event publish failed"
            ),
        }
    }
}

impl EventBus for LoggingEventBus {
    fn subscribe(&self, event_type: &str, handler: Arc<dyn EventHandler>) {
        tracing::info!(
            event_type,
            handler = handler.handler_name(),
            "Handler subscribed"
        );
        self.inner
            .subscribe(event_type, Arc::new(LoggingEventHandler::new(handler)));
    }

    fn unsubscribe(&self, event_type: &str, handler_name: &str) {
        tracing::info!(event_type, handler = handler_name, "Handler unsubscribed");
        self.inner.unsubscribe(event_type, handler_name);
    }

    fn publish(&self, event: SharedEvent) -> BoxFuture<'_, Result<(), EventBusError>> {
        Box::pin(async move {
            let started = Instant::now();
            let result = self.inner.publish(Arc::clone(&event)).await;
            Self::log_outcome(event.as_ref(), "sync", started, &result);
            result
        })
    }

    fn publish_async(&self, event: SharedEvent) -> BoxFuture<'_, Result<(), EventBusError>> {
        Box::pin(async move {
            let started = Instant::now();
            let result = self.inner.publish_async(Arc::clone(&event)).await;
            Self::log_outcome(event.as_ref(), "async", started, &result);
            result
        })
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;
    use crate::bus::SimpleEventBus;
    use eventline_testing::fixtures::order_created;
    use eventline_testing::{CapturedLogs, RecordingHandler};

    #[tokio::test]
    async fn test_logs_every_transition() {
        let logs = CapturedLogs::new();
        let _guard = logs.install();
        let bus = LoggingEventBus::new(Arc::new(SimpleEventBus::new()));
        bus.subscribe("order.created", RecordingHandler::new("audit", ["order.created"]).shared());
        bus.subscribe(
            "order.created",
            RecordingHandler::new("billing", ["order.created"])
                .failing_always()
                .with_message("declined")
                .shared(),
        );

        bus.publish(order_created()).await.unwrap_err();

        let handled = logs.lines_with("Event handled");
        assert_eq!(handled.len(), 1);
        assert!(handled[0].contains("handler=\"audit\"") || handled[0].contains("handler=audit"));
        let failed = logs.lines_with("Event handler failed");
        assert_eq!(failed.len(), 1);
        assert!(failed[0].contains("declined"));
        assert!(failed[0].contains("ERROR"));
        assert_eq!(logs.lines_with("Event publish failed").len(), 1);
        assert!(logs.lines_with("Event published").is_empty());
    }

    #[tokio::test]
    async fn test_successful_publish_is_logged_at_info() {
        let logs = CapturedLogs::new();
        let _guard = logs.install();
        let bus = LoggingEventBus::new(Arc::new(SimpleEventBus::new()));

        bus.publish(order_created()).await.unwrap();

        let published = logs.lines_with("Event published");
        assert_eq!(published.len(), 1);
        assert!(published[0].contains("INFO"));
        assert!(published[0].contains("order.created"));
    }
}
