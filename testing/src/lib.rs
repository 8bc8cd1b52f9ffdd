//! # Eventline Testing
//!
//! Testing utilities and helpers for Eventline.
//!
//! This crate provides:
//! - Deterministic clocks ([`FixedClock`], [`ManualClock`])
//! - In-memory backends for the event store, retry queue and dead letter queue
//! - Scripted handlers that record calls and fail on demand
//! - Event fixtures and a captured log writer for asserting on tracing output
//!
//! ## Example
//!
//! ```ignore
//! use eventline_testing::{InMemoryRetryStore, InMemoryDeadLetterStore, ManualClock, test_clock};
//!
//! #[tokio::test]
//! async fn retry_flow() {
//!     let clock = ManualClock::new(test_clock().now());
//!     let retries = Arc::new(InMemoryRetryStore::new());
//!     let dead_letters = Arc::new(InMemoryDeadLetterStore::new());
//!     let queue = RetryQueue::new(retries, dead_letters.clone(), 2)
//!         .with_clock(Arc::new(clock.clone()));
//!     // ...
//!     clock.advance(Duration::from_secs(5));
//! }
//! ```

use chrono::{DateTime, Utc};
use eventline_core::environment::Clock;

pub mod event_store;
pub mod fixtures;
pub mod handlers;
pub mod logs;
pub mod properties;
pub mod queue_stores;

/// Mock implementations of Environment traits
pub mod mocks {
    use super::{Clock, DateTime, Utc};
    use std::sync::{Arc, RwLock};
    use std::time::Duration;

    /// Fixed clock for deterministic tests
    ///
    /// Always returns the same time, making tests reproducible.
    ///
    /// # Example
    ///
    /// ```
    /// use eventline_testing::mocks::FixedClock;
    /// use eventline_core::environment::Clock;
    /// use chrono::Utc;
    ///
    /// let clock = FixedClock::new(Utc::now());
    /// let time1 = clock.now();
    /// let time2 = clock.now();
    /// assert_eq!(time1, time2); // Always the same!
    /// ```
    #[derive(Debug, Clone)]
    pub struct FixedClock {
        time: DateTime<Utc>,
    }

    impl FixedClock {
        /// Create a new fixed clock with the given time
        #[must_use]
        pub const fn new(time: DateTime<Utc>) -> Self {
            Self { time }
        }
    }

    impl Clock for FixedClock {
        fn now(&self) -> DateTime<Utc> {
            self.time
        }
    }

    /// Clock that only moves when told to.
    ///
    /// Clones share the same time, so a test can keep one handle and give
    /// another to the queue or store under test.
    ///
    /// ```
    /// use eventline_testing::mocks::ManualClock;
    /// use eventline_core::environment::Clock;
    /// use std::time::Duration;
    ///
    /// let clock = ManualClock::new(chrono::Utc::now());
    /// let start = clock.now();
    /// clock.advance(Duration::from_secs(3));
    /// assert_eq!((clock.now() - start).num_seconds(), 3);
    /// ```
    #[derive(Debug, Clone)]
    pub struct ManualClock {
        time: Arc<RwLock<DateTime<Utc>>>,
    }

    impl ManualClock {
        /// Create a clock starting at `time`.
        #[must_use]
        pub fn new(time: DateTime<Utc>) -> Self {
            Self {
                time: Arc::new(RwLock::new(time)),
            }
        }

        /// Move the clock forward.
        ///
        /// # Panics
        ///
        /// Panics if the lock is poisoned or `by` does not fit a chrono duration.
        #[allow(clippy::unwrap_used)]
        pub fn advance(&self, by: Duration) {
            let mut time = self.time.write().unwrap();
            *time += chrono::Duration::from_std(by).unwrap();
        }

        /// Jump to `time`.
        ///
        /// # Panics
        ///
        /// Panics if the lock is poisoned.
        #[allow(clippy::unwrap_used)]
        pub fn set(&self, time: DateTime<Utc>) {
            *self.time.write().unwrap() = time;
        }
    }

    impl Clock for ManualClock {
        #[allow(clippy::unwrap_used)]
        fn now(&self) -> DateTime<Utc> {
            *self.time.read().unwrap()
        }
    }

    /// Create a default fixed clock for tests (2025-01-01 00:00:00 UTC)
    ///
    /// # Panics
    ///
    /// This function will panic if the hardcoded timestamp fails to parse,
    /// which should never happen in practice.
    #[must_use]
    #[allow(clippy::expect_used)]
    pub fn test_clock() -> FixedClock {
        FixedClock::new(
            DateTime::parse_from_rfc3339("2025-01-01T00:00:00Z")
                .expect("hardcoded timestamp should always parse")
                .with_timezone(&Utc),
        )
    }

    /// A [`ManualClock`] starting at the same instant as [`test_clock`].
    #[must_use]
    pub fn manual_clock() -> ManualClock {
        ManualClock::new(test_clock().now())
    }
}

// Re-export commonly used items
pub use event_store::InMemoryEventStore;
pub use handlers::{CallLog, RecordingHandler};
pub use logs::CapturedLogs;
pub use mocks::{FixedClock, ManualClock, manual_clock, test_clock};
pub use queue_stores::{InMemoryDeadLetterStore, InMemoryRetryStore};
