//! Span decorators.

use eventline_core::event::{Event, SharedEvent};
use eventline_core::event_bus::{EventBus, EventBusError};
use eventline_core::handler::{EventHandler, HandlerError};
use futures::future::BoxFuture;
use std::sync::Arc;
use tracing::Instrument;
use tracing::field::Empty;

/// Runs every handler call inside an `event.handle` span.
pub struct TracingEventHandler {
    inner: Arc<dyn EventHandler>,
}

impl TracingEventHandler {
    /// Wrap `inner`.
    #[must_use]
    pub fn new(inner: Arc<dyn EventHandler>) -> Self {
        Self { inner }
    }
}

impl EventHandler for TracingEventHandler {
    fn handle<'a>(&'a self, event: &'a dyn Event) -> BoxFuture<'a, Result<(), HandlerError>> {
        let span = tracing::info_span!(
            "event.handle",
            event_type = event.event_type(),
            source = event.source(),
            handler = self.inner.handler_name(),
            error = Empty,
        );
        Box::pin(
            async move {
                let result = self.inner.handle(event).await;
                if let Err(err) = &result {
                    tracing::Span::current().record("error", tracing::field::display(err));
                }
                result
            }
            .instrument(span),
        )
    }

    fn handler_name(&self) -> &str {
        self.inner.handler_name()
    }

    fn supported_event_types(&self) -> Vec<String> {
        self.inner.supported_event_types()
    }
}

/// Runs every publish inside an `event.publish` span and traces subscribed handlers.
pub struct TracingEventBus {
    inner: Arc<dyn EventBus>,
}

impl TracingEventBus {
    /// Wrap `inner`.
    #[must_use]
    pub fn new(inner: Arc<dyn EventBus>) -> Self {
        Self { inner }
    }

    fn traced<'a>(
        &'a self,
        event: SharedEvent,
        mode: &'static str,
        publish: BoxFuture<'a, Result<(), EventBusError>>,
    ) -> BoxFuture<'a, Result<(), EventBusError>> {
        let span = tracing::info_span!(
            "event.publish",
            event_type = event.event_type(),
            source = event.source(),
            mode,
            error = Empty,
        );
        Box::pin(
            async move {
                let result = publish.await;
                if let Err(err) = &result {
                    tracing::Span::current().record("error", tracing::field::display(err));
                }
                result
            }
            .instrument(span),
        )
    }
}

impl EventBus for TracingEventBus {
    fn subscribe(&self, event_type: &str, handler: Arc<dyn EventHandler>) {
        self.inner
            .subscribe(event_type, Arc::new(TracingEventHandler::new(handler)));
    }

    fn unsubscribe(&self, event_type: &str, handler_name: &str) {
        self.inner.unsubscribe(event_type, handler_name);
    }

    fn publish(&self, event: SharedEvent) -> BoxFuture<'_, Result<(), EventBusError>> {
        let publish = self.inner.publish(Arc::clone(&event));
        self.traced(event, "sync", publish)
    }

    fn publish_async(&self, event: SharedEvent) -> BoxFuture<'_, Result<(), EventBusError>> {
        let publish = self.inner.publish_async(Arc::clone(&event));
        self.traced(event, "async", publish)
    }
}
