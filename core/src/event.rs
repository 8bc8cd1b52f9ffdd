//! Event trait and the default event value type.
//!
//! Events represent immutable facts about things that have happened. The bus,
//! the event store and the retry machinery only ever look at four fields:
//! the event type, an opaque JSON payload, the time it happened and the
//! component that produced it. Anything satisfying [`Event`] can be published.
//!
//! # Example
//!
//! ```
//! use eventline_core::event::{BaseEvent, Event};
//!
//! let event = BaseEvent::new(
//!     "order.created",
//!     serde_json::json!({ "order_id": "o-1", "total": 42 }),
//!     "orders",
//! );
//!
//! assert_eq!(event.event_type(), "order.created");
//! assert_eq!(event.source(), "orders");
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// An event that can be published, persisted, retried and replayed.
///
/// # Thread Safety
///
/// Events must be `Send + Sync` so the bus can hand the same event to
/// handlers running concurrently on different tasks.
pub trait Event: Send + Sync + fmt::Debug {
    /// Returns the event type identifier used for routing (e.g. `"order.created"`).
    fn event_type(&self) -> &str;

    /// Returns the opaque structured payload.
    fn event_data(&self) -> &serde_json::Value;

    /// Returns when the fact happened.
    fn timestamp(&self) -> DateTime<Utc>;

    /// Returns the identifier of the producing component.
    fn source(&self) -> &str;

    /// Copy the four event fields into an owned [`BaseEvent`].
    fn to_base_event(&self) -> BaseEvent {
        BaseEvent {
            event_type: self.event_type().to_string(),
            event_data: self.event_data().clone(),
            timestamp: self.timestamp(),
            source: self.source().to_string(),
        }
    }
}

/// Shared, type-erased event handed to the bus.
pub type SharedEvent = Arc<dyn Event>;

/// Plain event value carrying exactly the four event fields.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BaseEvent {
    /// Event type identifier
    pub event_type: String,
    /// Opaque payload
    pub event_data: serde_json::Value,
    /// When the event happened
    pub timestamp: DateTime<Utc>,
    /// Producing component
    pub source: String,
}

impl BaseEvent {
    /// Create an event stamped with the current time.
    #[must_use]
    pub fn new(
        event_type: impl Into<String>,
        event_data: serde_json::Value,
        source: impl Into<String>,
    ) -> Self {
        Self {
            event_type: event_type.into(),
            event_data,
            timestamp: Utc::now(),
            source: source.into(),
        }
    }

    /// Override the timestamp (used when rebuilding historical events).
    #[must_use]
    pub const fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Wrap the event for publishing.
    #[must_use]
    pub fn shared(self) -> SharedEvent {
        Arc::new(self)
    }
}

impl Event for BaseEvent {
    fn event_type(&self) -> &str {
        &self.event_type
    }

    fn event_data(&self) -> &serde_json::Value {
        &self.event_data
    }

    fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    fn source(&self) -> &str {
        &self.source
    }

    fn to_base_event(&self) -> BaseEvent {
        self.clone()
    }
}

impl fmt::Display for BaseEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} from {} at {}", self.event_type, self.source, self.timestamp)
    }
}
