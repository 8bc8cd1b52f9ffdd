//! # Eventline Core
//!
//! Core traits and types for the Eventline event reliability subsystem.
//!
//! This crate provides the contracts every other Eventline crate builds on:
//! an in-process event bus, a durable event log with replay, and the records
//! that flow through deferred retry and dead-lettering.
//!
//! ## Core Concepts
//!
//! - **Event**: Immutable fact with a type, an opaque payload, a timestamp and a source
//! - **Handler**: Named unit of logic reacting to one or more event types
//! - **Event Bus**: Publish/subscribe dispatch of events to handlers
//! - **Event Store**: Durable event log with point, type, source and time queries plus replay
//! - **Retry / Dead Letter records**: Failed handling awaiting a deferred retry, or parked for humans
//!
//! ## Architecture Principles
//!
//! - Contracts here, behaviour in `eventline-runtime`, storage in backend crates
//! - At-least-once intent: handlers must tolerate duplicate invocation
//! - Dependency injection for time ([`environment::Clock`]) so retry timing is testable
//!
//! ## Example
//!
//! ```ignore
//! use eventline_core::event::{BaseEvent, SharedEvent};
//! use std::sync::Arc;
//!
//! let event: SharedEvent = Arc::new(BaseEvent::new(
//!     "order.created",
//!     serde_json::json!({ "order_id": "o-1" }),
//!     "orders",
//! ));
//! bus.publish(event).await?;
//! ```

// Re-export commonly used types
pub use chrono::{DateTime, Utc};
pub use futures::future::BoxFuture;
pub use tokio_util::sync::CancellationToken;

pub mod event;
pub mod event_bus;
pub mod event_store;
pub mod handler;
pub mod queue;
pub mod replay;

pub use event::{BaseEvent, Event, SharedEvent};
pub use event_bus::{EventBus, EventBusError};
pub use event_store::{EventFilter, EventStore, EventStoreError, ReplayResult, StoredEvent};
pub use handler::{EventHandler, HandlerError};
pub use queue::{DeadLetterItem, DeadLetterStore, QueueError, RetryItem, RetryStore};

/// Environment module - injected dependencies
///
/// All time-dependent behaviour (retry scheduling, retention, cleanup) reads the
/// current time through [`environment::Clock`] so tests can move time explicitly.
pub mod environment {
    use chrono::{DateTime, Utc};

    /// Clock trait - abstracts time operations for testability
    ///
    /// # Examples
    ///
    /// ```
    /// use eventline_core::environment::{Clock, SystemClock};
    ///
    /// let clock = SystemClock;
    /// let before = clock.now();
    /// assert!(clock.now() >= before);
    /// ```
    pub trait Clock: Send + Sync {
        /// Get the current time
        fn now(&self) -> DateTime<Utc>;
    }

    /// Production clock backed by the system time.
    #[derive(Debug, Clone, Copy, Default)]
    pub struct SystemClock;

    impl Clock for SystemClock {
        fn now(&self) -> DateTime<Utc> {
            Utc::now()
        }
    }
}

/// Identifier generation for persisted records.
pub mod id {
    /// Prefix for stored events.
    pub const EVENT_PREFIX: &str = "evt";
    /// Prefix for retry queue items.
    pub const RETRY_PREFIX: &str = "rty";
    /// Prefix for dead letter items.
    pub const DEAD_LETTER_PREFIX: &str = "dlq";

    /// Generate a new unique identifier of the form `{prefix}_{uuid}`.
    #[must_use]
    pub fn generate(prefix: &str) -> String {
        format!("{prefix}_{}", uuid::Uuid::new_v4().simple())
    }
}
