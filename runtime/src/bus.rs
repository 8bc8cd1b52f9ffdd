//! Base in-process event bus.
//!
//! [`SimpleEventBus`] keeps handlers per event type in subscription order.
//! `publish` awaits them one after another and stops at the first error;
//! `publish_async` spawns one task per handler on a [`TaskTracker`] and
//! returns at once. Handler failures on the async path are logged only.

use eventline_core::event::SharedEvent;
use eventline_core::event_bus::{EventBus, EventBusError};
use eventline_core::handler::EventHandler;
use futures::future::BoxFuture;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use tokio_util::task::TaskTracker;

type HandlerMap = HashMap<String, Vec<Arc<dyn EventHandler>>>;

/// Publish/subscribe dispatch without persistence.
///
/// # Example
///
/// ```
/// use eventline_runtime::bus::SimpleEventBus;
/// use eventline_core::event::BaseEvent;
/// use eventline_core::event_bus::EventBus;
/// use eventline_core::handler::FnEventHandler;
/// use std::sync::Arc;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let bus = SimpleEventBus::new();
/// bus.subscribe("order.created", Arc::new(FnEventHandler::new("audit", ["order.created"], |_| Ok(()))));
/// bus.publish(BaseEvent::new("order.created", serde_json::Value::Null, "orders").shared()).await?;
/// # Ok(())
/// # }
/// ```
#[derive(Default)]
pub struct SimpleEventBus {
    handlers: RwLock<HandlerMap>,
    tasks: TaskTracker,
    closed: AtomicBool,
}

impl SimpleEventBus {
    /// Create a bus with no subscriptions.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe `handler` to every type it reports in `supported_event_types`.
    pub fn subscribe_all(&self, handler: Arc<dyn EventHandler>) {
        for event_type in handler.supported_event_types() {
            self.subscribe(&event_type, Arc::clone(&handler));
        }
    }

    /// Number of handlers subscribed to `event_type`.
    #[must_use]
    pub fn handler_count(&self, event_type: &str) -> usize {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(event_type)
            .map_or(0, Vec::len)
    }

    /// Returns `true` once [`SimpleEventBus::shutdown`] has been called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Wait for every in-flight asynchronous handler invocation.
    pub async fn wait_idle(&self) {
        self.tasks.close();
        self.tasks.wait().await;
        self.tasks.reopen();
    }

    /// Refuse further events and wait for in-flight asynchronous invocations.
    pub async fn shutdown(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.tasks.close();
        self.tasks.wait().await;
        tracing::info!("Event bus shut down");
    }

    fn snapshot(&self, event_type: &str) -> Vec<Arc<dyn EventHandler>> {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(event_type)
            .cloned()
            .unwrap_or_default()
    }

    fn ensure_open(&self) -> Result<(), EventBusError> {
        if self.is_closed() {
            return Err(EventBusError::Closed);
        }
        Ok(())
    }
}

impl EventBus for SimpleEventBus {
    fn subscribe(&self, event_type: &str, handler: Arc<dyn EventHandler>) {
        tracing::debug!(
            event_type,
            handler = handler.handler_name(),
            "Handler subscribed"
        );
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(event_type.to_string())
            .or_default()
            .push(handler);
    }

    fn unsubscribe(&self, event_type: &str, handler_name: &str) {
        let mut handlers = self.handlers.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(list) = handlers.get_mut(event_type) {
            list.retain(|h| h.handler_name() != handler_name);
            if list.is_empty() {
                handlers.remove(event_type);
            }
        }
    }

    fn publish(&self, event: SharedEvent) -> BoxFuture<'_, Result<(), EventBusError>> {
        Box::pin(async move {
            self.ensure_open()?;
            let handlers = self.snapshot(event.event_type());
            if handlers.is_empty() {
                tracing::debug!(event_type = event.event_type(), "No handlers for event");
                return Ok(());
            }

            for handler in handlers {
                if let Err(source) = handler.handle(event.as_ref()).await {
                    return Err(EventBusError::HandlerFailed {
                        handler: handler.handler_name().to_string(),
                        source,
                    });
                }
            }
            Ok(())
        })
    }

    fn publish_async(&self, event: SharedEvent) -> BoxFuture<'_, Result<(), EventBusError>> {
        Box::pin(async move {
            self.ensure_open()?;
            for handler in self.snapshot(event.event_type()) {
                let event = Arc::clone(&event);
                self.tasks.spawn(async move {
                    if let Err(err) = handler.handle(event.as_ref()).await {
                        tracing::error!(
                            event_type = event.event_type(),
                            handler = handler.handler_name(),
                            error = %err,
                            "Async event handler failed"
                        );
                    }
                });
            }
            Ok(())
        })
    }
}
