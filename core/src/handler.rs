//! Event handler contract.
//!
//! A handler is a named unit of logic reacting to one or more event types.
//! Handlers are registered with an [`EventBus`](crate::event_bus::EventBus)
//! per event type and may be invoked more than once for the same event
//! (retries, replays, dead-letter reprocessing), so they must be idempotent.

use crate::event::Event;
use futures::future::BoxFuture;
use std::sync::Arc;
use thiserror::Error;

/// Errors surfaced by [`EventHandler::handle`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HandlerError {
    /// Business-logic failure.
    #[error("{0}")]
    Failed(String),

    /// The invocation was cancelled by its caller.
    #[error("handler cancelled")]
    Cancelled,

    /// The invocation ran past its deadline.
    #[error("handler deadline exceeded")]
    DeadlineExceeded,

    /// Inline retries were exhausted.
    #[error("handler failed after {attempts} attempts: {last}")]
    Exhausted {
        /// Number of attempts made, including the first one.
        attempts: u32,
        /// Error returned by the final attempt.
        last: Box<HandlerError>,
    },
}

impl HandlerError {
    /// Convenience constructor for [`HandlerError::Failed`].
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }

    /// Returns `true` for cancellation and deadline errors, which are never retried.
    #[must_use]
    pub const fn is_cancellation(&self) -> bool {
        matches!(self, Self::Cancelled | Self::DeadlineExceeded)
    }
}

/// A named unit of logic reacting to events.
///
/// # Dyn Compatibility
///
/// `handle` returns a boxed future instead of being an `async fn` so handlers
/// can be stored as `Arc<dyn EventHandler>` and wrapped by decorators.
pub trait EventHandler: Send + Sync {
    /// Handle one event.
    ///
    /// # Errors
    ///
    /// Returns a [`HandlerError`] when the event could not be handled.
    fn handle<'a>(&'a self, event: &'a dyn Event) -> BoxFuture<'a, Result<(), HandlerError>>;

    /// Stable name, unique per bus, used for unsubscribe and retry routing.
    fn handler_name(&self) -> &str;

    /// Event types this handler is interested in.
    fn supported_event_types(&self) -> Vec<String>;
}

impl<H: EventHandler + ?Sized> EventHandler for Arc<H> {
    fn handle<'a>(&'a self, event: &'a dyn Event) -> BoxFuture<'a, Result<(), HandlerError>> {
        (**self).handle(event)
    }

    fn handler_name(&self) -> &str {
        (**self).handler_name()
    }

    fn supported_event_types(&self) -> Vec<String> {
        (**self).supported_event_types()
    }
}

/// Handler built from a synchronous closure.
///
/// # Example
///
/// ```
/// use eventline_core::handler::{EventHandler, FnEventHandler};
///
/// let handler = FnEventHandler::new("audit", ["order.created"], |_event| Ok(()));
/// assert_eq!(handler.handler_name(), "audit");
/// ```
pub struct FnEventHandler<F> {
    name: String,
    event_types: Vec<String>,
    f: F,
}

impl<F> FnEventHandler<F>
where
    F: Fn(&dyn Event) -> Result<(), HandlerError> + Send + Sync,
{
    /// Create a handler named `name` for the given event types.
    pub fn new<I, S>(name: impl Into<String>, event_types: I, f: F) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.into(),
            event_types: event_types.into_iter().map(Into::into).collect(),
            f,
        }
    }
}

impl<F> EventHandler for FnEventHandler<F>
where
    F: Fn(&dyn Event) -> Result<(), HandlerError> + Send + Sync,
{
    fn handle<'a>(&'a self, event: &'a dyn Event) -> BoxFuture<'a, Result<(), HandlerError>> {
        let result = (self.f)(event);
        Box::pin(async move { result })
    }

    fn handler_name(&self) -> &str {
        &self.name
    }

    fn supported_event_types(&self) -> Vec<String> {
        self.event_types.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::BaseEvent;

    #[tokio::test]
    async fn fn_handler_returns_closure_result() {
        let handler = FnEventHandler::new("fails", ["a"], |event| {
            Err(HandlerError::failed(format!("cannot handle {}", event.event_type())))
        });
        let event = BaseEvent::new("a", serde_json::Value::Null, "test");

        let result = handler.handle(&event).await;

        assert_eq!(result, Err(HandlerError::Failed("cannot handle a".to_string())));
        assert_eq!(handler.supported_event_types(), vec!["a".to_string()]);
    }

    #[test]
    fn cancellation_errors_are_classified() {
        assert!(HandlerError::Cancelled.is_cancellation());
        assert!(HandlerError::DeadlineExceeded.is_cancellation());
        assert!(!HandlerError::failed("boom").is_cancellation());
    }

    #[test]
    fn exhausted_error_mentions_last_failure() {
        let err = HandlerError::Exhausted {
            attempts: 4,
            last: Box::new(HandlerError::failed("db down")),
        };
        assert_eq!(err.to_string(), "handler failed after 4 attempts: db down");
    }
}
