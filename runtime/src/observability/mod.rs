//! Observability decorators.
//!
//! Each decorator adds one concern to a bus, handler or store and forwards
//! everything else untouched:
//!
//! | concern | bus | handler | store |
//! |---|---|---|---|
//! | spans | [`TracingEventBus`] | [`TracingEventHandler`] | |
//! | metrics | [`MetricsEventBus`] | [`MetricsEventHandler`] | [`MetricsEventStore`] |
//! | log lines | [`LoggingEventBus`] | [`LoggingEventHandler`] | |
//!
//! Bus decorators wrap every handler subscribed through them with the
//! matching handler decorator. Handler names pass through, so `unsubscribe`
//! works whatever the stacking order.
//!
//! ```
//! use eventline_runtime::bus::SimpleEventBus;
//! use eventline_runtime::metrics::EventMetrics;
//! use eventline_runtime::observability::{LoggingEventBus, MetricsEventBus, TracingEventBus};
//! use std::sync::Arc;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let metrics = Arc::new(EventMetrics::new()?);
//! let bus = TracingEventBus::new(Arc::new(LoggingEventBus::new(Arc::new(
//!     MetricsEventBus::new(Arc::new(SimpleEventBus::new()), metrics),
//! ))));
//! # let _ = bus;
//! # Ok(())
//! # }
//! ```

mod logged;
mod metered;
mod traced;

pub use logged::{LoggingEventBus, LoggingEventHandler};
pub use metered::{MetricsEventBus, MetricsEventHandler, MetricsEventStore};
pub use traced::{TracingEventBus, TracingEventHandler};

use std::time::Duration;

pub(crate) fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
