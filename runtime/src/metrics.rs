//! Prometheus metrics for the event subsystem.
//!
//! [`EventMetrics`] owns its own [`Registry`]. Construct it once at bootstrap
//! and hand clones of the `Arc` to the decorators and the retry worker; there
//! is no process-wide instance.
//!
//! ## Metric families
//!
//! | name | type | labels |
//! |---|---|---|
//! | `eventline_events_published_total` | counter | `event_type`, `status` |
//! | `eventline_publish_duration_seconds` | histogram | `event_type` |
//! | `eventline_events_handled_total` | counter | `event_type`, `handler`, `status` |
//! | `eventline_handle_duration_seconds` | histogram | `event_type`, `handler` |
//! | `eventline_events_replay_total` | counter | `event_type`, `status` |
//! | `eventline_events_replay_failed_total` | counter | `event_type`, `error_type` |
//! | `eventline_events_replay_duration_seconds` | histogram | `event_type` |
//! | `eventline_retry_enqueued_total` | counter | `event_type`, `handler` |
//! | `eventline_retry_outcomes_total` | counter | `handler`, `outcome` |
//! | `eventline_retry_queue_size` | gauge | |
//! | `eventline_dead_letter_queue_size` | gauge | |
//!
//! ## Usage
//!
//! ```
//! use eventline_runtime::metrics::EventMetrics;
//! use std::time::Duration;
//!
//! let metrics = EventMetrics::new().expect("metrics");
//! metrics.record_publish("order.created", "success", Duration::from_millis(3));
//! metrics.set_retry_queue_size(4);
//!
//! let text = metrics.export_prometheus().expect("export");
//! assert!(text.contains("eventline_retry_queue_size 4"));
//! ```

use prometheus::{
    CounterVec, Encoder, HistogramOpts, HistogramVec, IntGauge, Registry, TextEncoder, opts,
};
use std::time::Duration;
use thiserror::Error;

/// Errors from metric registration or export.
#[derive(Error, Debug)]
pub enum MetricsError {
    /// Prometheus rejected a registration or encoding.
    #[error("prometheus error: {0}")]
    Prometheus(#[from] prometheus::Error),

    /// The exposition text was not valid UTF-8.
    #[error("metrics encoding error: {0}")]
    Encoding(#[from] std::string::FromUtf8Error),
}

/// Status label for a successful operation.
pub const STATUS_SUCCESS: &str = "success";
/// Status label for a failed operation.
pub const STATUS_ERROR: &str = "error";

/// Outcome of one retry attempt by the worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryOutcome {
    /// The retry succeeded and the item was removed.
    Success,
    /// The retry failed and the item was rescheduled.
    Rescheduled,
    /// The retry failed and the item was dead-lettered.
    DeadLettered,
}

impl RetryOutcome {
    /// Label value used in `eventline_retry_outcomes_total`.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Rescheduled => "rescheduled",
            Self::DeadLettered => "dead_lettered",
        }
    }
}

const DURATION_BUCKETS: &[f64] = &[
    0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0,
];

const REPLAY_BUCKETS: &[f64] = &[0.1, 0.5, 1.0, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0];

/// Metrics sink for the event subsystem.
pub struct EventMetrics {
    registry: Registry,
    events_published: CounterVec,
    publish_duration: HistogramVec,
    events_handled: CounterVec,
    handle_duration: HistogramVec,
    replay_total: CounterVec,
    replay_failed: CounterVec,
    replay_duration: HistogramVec,
    retry_enqueued: CounterVec,
    retry_outcomes: CounterVec,
    retry_queue_size: IntGauge,
    dead_letter_queue_size: IntGauge,
}

impl EventMetrics {
    /// Create and register every metric family on a fresh registry.
    ///
    /// # Errors
    ///
    /// Returns error if metric registration fails (e.g., duplicate names)
    pub fn new() -> Result<Self, MetricsError> {
        let registry = Registry::new();

        let events_published = CounterVec::new(
            opts!("eventline_events_published_total", "Total number of published events"),
            &["event_type", "status"],
        )?;
        let publish_duration = HistogramVec::new(
            HistogramOpts::new("eventline_publish_duration_seconds", "Publish latency in seconds")
                .buckets(DURATION_BUCKETS.to_vec()),
            &["event_type"],
        )?;
        let events_handled = CounterVec::new(
            opts!("eventline_events_handled_total", "Total number of handler invocations"),
            &["event_type", "handler", "status"],
        )?;
        let handle_duration = HistogramVec::new(
            HistogramOpts::new("eventline_handle_duration_seconds", "Handler latency in seconds")
                .buckets(DURATION_BUCKETS.to_vec()),
            &["event_type", "handler"],
        )?;
        let replay_total = CounterVec::new(
            opts!("eventline_events_replay_total", "Total number of completed replays"),
            &["event_type", "status"],
        )?;
        let replay_failed = CounterVec::new(
            opts!("eventline_events_replay_failed_total", "Total number of failed replays"),
            &["event_type", "error_type"],
        )?;
        let replay_duration = HistogramVec::new(
            HistogramOpts::new(
                "eventline_events_replay_duration_seconds",
                "Replay duration in seconds",
            )
            .buckets(REPLAY_BUCKETS.to_vec()),
            &["event_type"],
        )?;
        let retry_enqueued = CounterVec::new(
            opts!("eventline_retry_enqueued_total", "Total number of failures queued for retry"),
            &["event_type", "handler"],
        )?;
        let retry_outcomes = CounterVec::new(
            opts!("eventline_retry_outcomes_total", "Retry worker outcomes"),
            &["handler", "outcome"],
        )?;
        let retry_queue_size =
            IntGauge::new("eventline_retry_queue_size", "Number of items awaiting retry")?;
        let dead_letter_queue_size = IntGauge::new(
            "eventline_dead_letter_queue_size",
            "Number of unprocessed dead letters",
        )?;

        registry.register(Box::new(events_published.clone()))?;
        registry.register(Box::new(publish_duration.clone()))?;
        registry.register(Box::new(events_handled.clone()))?;
        registry.register(Box::new(handle_duration.clone()))?;
        registry.register(Box::new(replay_total.clone()))?;
        registry.register(Box::new(replay_failed.clone()))?;
        registry.register(Box::new(replay_duration.clone()))?;
        registry.register(Box::new(retry_enqueued.clone()))?;
        registry.register(Box::new(retry_outcomes.clone()))?;
        registry.register(Box::new(retry_queue_size.clone()))?;
        registry.register(Box::new(dead_letter_queue_size.clone()))?;

        Ok(Self {
            registry,
            events_published,
            publish_duration,
            events_handled,
            handle_duration,
            replay_total,
            replay_failed,
            replay_duration,
            retry_enqueued,
            retry_outcomes,
            retry_queue_size,
            dead_letter_queue_size,
        })
    }

    /// Record one publish.
    pub fn record_publish(&self, event_type: &str, status: &str, duration: Duration) {
        self.events_published.with_label_values(&[event_type, status]).inc();
        self.publish_duration
            .with_label_values(&[event_type])
            .observe(duration.as_secs_f64());
    }

    /// Record one handler invocation.
    pub fn record_handle(&self, event_type: &str, handler: &str, status: &str, duration: Duration) {
        self.events_handled
            .with_label_values(&[event_type, handler, status])
            .inc();
        self.handle_duration
            .with_label_values(&[event_type, handler])
            .observe(duration.as_secs_f64());
    }

    /// Record a finished replay; status is `partial_failure` when any event failed.
    pub fn record_replay(&self, event_type: &str, failed_count: u64, duration: Duration) {
        let status = if failed_count > 0 { "partial_failure" } else { STATUS_SUCCESS };
        self.replay_total.with_label_values(&[event_type, status]).inc();
        self.replay_duration
            .with_label_values(&[event_type])
            .observe(duration.as_secs_f64());
    }

    /// Record a replay that ended in an error.
    pub fn record_replay_failed(&self, event_type: &str, error_type: &str) {
        self.replay_failed.with_label_values(&[event_type, error_type]).inc();
    }

    /// Record a failure routed to the retry queue.
    pub fn record_retry_enqueued(&self, event_type: &str, handler: &str) {
        self.retry_enqueued.with_label_values(&[event_type, handler]).inc();
    }

    /// Record the outcome of one worker retry.
    pub fn record_retry_outcome(&self, handler: &str, outcome: RetryOutcome) {
        self.retry_outcomes
            .with_label_values(&[handler, outcome.as_str()])
            .inc();
    }

    /// Set the retry queue size gauge.
    pub fn set_retry_queue_size(&self, size: u64) {
        self.retry_queue_size.set(i64::try_from(size).unwrap_or(i64::MAX));
    }

    /// Set the dead letter queue size gauge.
    pub fn set_dead_letter_queue_size(&self, size: u64) {
        self.dead_letter_queue_size
            .set(i64::try_from(size).unwrap_or(i64::MAX));
    }

    /// Current value of `eventline_events_published_total` for the labels.
    #[must_use]
    pub fn published_count(&self, event_type: &str, status: &str) -> f64 {
        self.events_published.with_label_values(&[event_type, status]).get()
    }

    /// Current value of `eventline_events_handled_total` for the labels.
    #[must_use]
    pub fn handled_count(&self, event_type: &str, handler: &str, status: &str) -> f64 {
        self.events_handled
            .with_label_values(&[event_type, handler, status])
            .get()
    }

    /// Current value of `eventline_retry_outcomes_total` for the labels.
    #[must_use]
    pub fn retry_outcome_count(&self, handler: &str, outcome: RetryOutcome) -> f64 {
        self.retry_outcomes
            .with_label_values(&[handler, outcome.as_str()])
            .get()
    }

    /// The registry, for mounting on an existing exporter.
    #[must_use]
    pub const fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Export metrics in Prometheus text format
    ///
    /// # Errors
    ///
    /// Returns error if encoding fails
    pub fn export_prometheus(&self) -> Result<String, MetricsError> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }
}

impl std::fmt::Debug for EventMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventMetrics").finish_non_exhaustive()
    }
}
