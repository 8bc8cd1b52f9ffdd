//! Event bus abstraction for in-process publish/subscribe.
//!
//! # Delivery contract
//!
//! - [`EventBus::publish`] runs the handlers subscribed to the event's type
//!   **sequentially, in subscription order**, and stops at the first failing
//!   handler. Later handlers are not invoked for that event. The error names
//!   the failing handler.
//! - [`EventBus::publish_async`] starts every subscribed handler concurrently
//!   and returns without waiting. Individual handler errors never reach the
//!   caller; they are only visible through logs and metrics.
//!
//! Implementations are decorators-friendly: every wrapper (persistence,
//! inline retry, tracing, metrics, logging) implements this same trait.

use crate::event::SharedEvent;
use crate::handler::{EventHandler, HandlerError};
use futures::future::BoxFuture;
use std::sync::Arc;
use thiserror::Error;

/// Errors returned by event bus operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EventBusError {
    /// A subscribed handler failed during synchronous publish.
    #[error("handler {handler} failed: {source}")]
    HandlerFailed {
        /// Name of the failing handler.
        handler: String,
        /// The handler's error.
        #[source]
        source: HandlerError,
    },

    /// The bus has been shut down and no longer accepts events.
    #[error("event bus is closed")]
    Closed,

    /// Any other failure.
    #[error("event bus error: {0}")]
    Other(String),
}

impl EventBusError {
    /// Returns the underlying handler error, if this is a handler failure.
    #[must_use]
    pub const fn handler_error(&self) -> Option<&HandlerError> {
        match self {
            Self::HandlerFailed { source, .. } => Some(source),
            _ => None,
        }
    }
}

/// In-process publish/subscribe dispatch.
///
/// # Dyn Compatibility
///
/// Publishing returns boxed futures so buses can be shared as
/// `Arc<dyn EventBus>` and stacked behind decorators.
pub trait EventBus: Send + Sync {
    /// Register `handler` for `event_type`. Handlers run in registration order.
    fn subscribe(&self, event_type: &str, handler: Arc<dyn EventHandler>);

    /// Remove the handler named `handler_name` from `event_type`. No-op if absent.
    fn unsubscribe(&self, event_type: &str, handler_name: &str);

    /// Publish an event synchronously, short-circuiting on the first handler error.
    ///
    /// # Errors
    ///
    /// Returns [`EventBusError::HandlerFailed`] for the first failing handler,
    /// or [`EventBusError::Closed`] once the bus is shut down.
    fn publish(&self, event: SharedEvent) -> BoxFuture<'_, Result<(), EventBusError>>;

    /// Dispatch an event to every handler concurrently without waiting.
    ///
    /// # Errors
    ///
    /// Only returns an error when the bus refuses the event (e.g. it is closed).
    fn publish_async(&self, event: SharedEvent) -> BoxFuture<'_, Result<(), EventBusError>>;
}

impl<B: EventBus + ?Sized> EventBus for Arc<B> {
    fn subscribe(&self, event_type: &str, handler: Arc<dyn EventHandler>) {
        (**self).subscribe(event_type, handler);
    }

    fn unsubscribe(&self, event_type: &str, handler_name: &str) {
        (**self).unsubscribe(event_type, handler_name);
    }

    fn publish(&self, event: SharedEvent) -> BoxFuture<'_, Result<(), EventBusError>> {
        (**self).publish(event)
    }

    fn publish_async(&self, event: SharedEvent) -> BoxFuture<'_, Result<(), EventBusError>> {
        (**self).publish_async(event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handler_failed_exposes_source() {
        let err = EventBusError::HandlerFailed {
            handler: "mailer".to_string(),
            source: HandlerError::failed("smtp down"),
        };
        assert_eq!(err.to_string(), "handler mailer failed: smtp down");
        assert_eq!(err.handler_error(), Some(&HandlerError::failed("smtp down")));
        assert_eq!(EventBusError::Closed.handler_error(), None);
    }
}
