//! Background worker draining the deferred retry queue.
//!
//! One loop per worker. Every `check_interval` it pulls up to `batch_size`
//! due items and processes them one at a time:
//!
//! 1. rebuild the event and re-run it (directly through the registered
//!    handler, or by republishing on the bus when none is registered) inside
//!    a [`redeliver`] scope, so deferred handlers report the failure back
//! 2. on success the item is removed
//! 3. on failure the attempt counter moves on; the item is dead-lettered
//!    once it reaches `max_retries` or the policy refuses, otherwise it is
//!    rescheduled `policy.delay(attempt)` from now
//!
//! Nothing is propagated out of the loop; storage errors are logged and the
//! item is picked up again on a later tick.
//!
//! Two instances over the same store would race on the same due items; run a
//! single worker per store.

use crate::metrics::{EventMetrics, RetryOutcome};
use crate::retry::RetryPolicy;
use crate::retry_queue::RetryQueue;
use crate::retryable::redeliver;
use eventline_core::event_bus::EventBus;
use eventline_core::handler::{EventHandler, HandlerError};
use eventline_core::queue::{QueueError, RetryItem};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// Worker settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryWorkerConfig {
    /// Time between ticks.
    pub check_interval: Duration,
    /// Maximum items processed per tick.
    pub batch_size: usize,
}

impl Default for RetryWorkerConfig {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(10),
            batch_size: 100,
        }
    }
}

/// What one tick did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Items whose retry succeeded and were removed.
    pub succeeded: usize,
    /// Items that failed again and were rescheduled.
    pub rescheduled: usize,
    /// Items moved to the dead letter queue.
    pub dead_lettered: usize,
    /// Items left untouched because of a storage error.
    pub errors: usize,
}

impl TickReport {
    /// Number of items looked at.
    #[must_use]
    pub const fn processed(&self) -> usize {
        self.succeeded + self.rescheduled + self.dead_lettered + self.errors
    }

    const fn record(&mut self, outcome: RetryOutcome) {
        match outcome {
            RetryOutcome::Success => self.succeeded += 1,
            RetryOutcome::Rescheduled => self.rescheduled += 1,
            RetryOutcome::DeadLettered => self.dead_lettered += 1,
        }
    }
}

/// Processes due items of a [`RetryQueue`].
pub struct RetryWorker {
    queue: Arc<RetryQueue>,
    bus: Arc<dyn EventBus>,
    policy: Arc<dyn RetryPolicy>,
    config: RetryWorkerConfig,
    handlers: HashMap<String, Arc<dyn EventHandler>>,
    metrics: Option<Arc<EventMetrics>>,
}

impl RetryWorker {
    /// Create a worker that republishes through `bus` and reschedules with `policy`.
    #[must_use]
    pub fn new(
        queue: Arc<RetryQueue>,
        bus: Arc<dyn EventBus>,
        policy: Arc<dyn RetryPolicy>,
        config: RetryWorkerConfig,
    ) -> Self {
        Self {
            queue,
            bus,
            policy,
            config,
            handlers: HashMap::new(),
            metrics: None,
        }
    }

    /// Re-run items for `handler` by calling it directly instead of republishing.
    #[must_use]
    pub fn with_handler(mut self, handler: Arc<dyn EventHandler>) -> Self {
        self.handlers
            .insert(handler.handler_name().to_string(), handler);
        self
    }

    /// Record outcomes and queue sizes.
    #[must_use]
    pub fn with_metrics(mut self, metrics: Arc<EventMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Process one batch of due items.
    pub async fn run_once(&self) -> TickReport {
        let mut report = TickReport::default();

        let items = match self.queue.get(self.config.batch_size).await {
            Ok(items) => items,
            Err(err) => {
                tracing::error!(error = %err, "Failed to fetch due retries");
                return report;
            }
        };

        for item in items {
            match self.process(&item).await {
                Ok(outcome) => {
                    report.record(outcome);
                    if let Some(metrics) = &self.metrics {
                        metrics.record_retry_outcome(&item.handler_name, outcome);
                    }
                }
                Err(err) => {
                    report.errors += 1;
                    tracing::error!(
                        retry_id = %item.id,
                        handler = %item.handler_name,
                        error = %err,
                        "Failed to update retry item"
                    );
                }
            }
        }

        self.refresh_gauges().await;
        if report.processed() > 0 {
            tracing::debug!(
                succeeded = report.succeeded,
                rescheduled = report.rescheduled,
                dead_lettered = report.dead_lettered,
                errors = report.errors,
                "Retry tick finished"
            );
        }
        report
    }

    async fn process(&self, item: &RetryItem) -> Result<RetryOutcome, QueueError> {
        let Err(err) = self.attempt(item).await else {
            self.queue.mark_success(&item.id).await?;
            return Ok(RetryOutcome::Success);
        };

        let attempt = item.attempt + 1;
        let error = err.to_string();
        let now = self.queue.now();

        if attempt >= item.max_retries || !self.policy.should_retry(&err, attempt) {
            self.queue
                .update_attempt(&item.id, now, attempt, Some(&error))
                .await?;
            self.queue.mark_failed(&item.id).await?;
            return Ok(RetryOutcome::DeadLettered);
        }

        let delay = chrono::Duration::from_std(self.policy.delay(attempt))
            .unwrap_or(chrono::Duration::MAX);
        let next_retry = now.checked_add_signed(delay).unwrap_or(now);
        tracing::warn!(
            retry_id = %item.id,
            handler = %item.handler_name,
            event_type = %item.event_type,
            attempt,
            error = %error,
            "Retry attempt failed"
        );
        self.queue
            .update_attempt(&item.id, next_retry, attempt, Some(&error))
            .await?;
        Ok(RetryOutcome::Rescheduled)
    }

    async fn attempt(&self, item: &RetryItem) -> Result<(), HandlerError> {
        let event = item.to_event();
        if let Some(handler) = self.handlers.get(&item.handler_name) {
            return redeliver(handler.handle(&event)).await;
        }
        redeliver(self.bus.publish(event.shared())).await.map_err(|err| {
            err.handler_error()
                .cloned()
                .unwrap_or_else(|| HandlerError::failed(err.to_string()))
        })
    }

    async fn refresh_gauges(&self) {
        let Some(metrics) = &self.metrics else {
            return;
        };
        match self.queue.count().await {
            Ok(size) => metrics.set_retry_queue_size(size),
            Err(err) => tracing::warn!(error = %err, "Failed to count retry queue"),
        }
        match self.queue.dead_letters().count().await {
            Ok(size) => metrics.set_dead_letter_queue_size(size),
            Err(err) => tracing::warn!(error = %err, "Failed to count dead letters"),
        }
    }

    /// Spawn the loop on the current runtime.
    #[must_use]
    pub fn start(self: Arc<Self>) -> WorkerHandle {
        self.start_with_token(CancellationToken::new())
    }

    /// Spawn the loop; it also stops when `token` is cancelled.
    #[must_use]
    pub fn start_with_token(self: Arc<Self>, token: CancellationToken) -> WorkerHandle {
        let period = self.config.check_interval.max(Duration::from_millis(1));
        let loop_token = token.clone();

        let join = tokio::spawn(async move {
            tracing::info!(
                interval_ms = u64::try_from(period.as_millis()).unwrap_or(u64::MAX),
                batch_size = self.config.batch_size,
                "Retry worker started"
            );
            let mut ticker = time::interval_at(time::Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    biased;
                    () = loop_token.cancelled() => break,
                    _ = ticker.tick() => {
                        self.run_once().await;
                    }
                }
            }
            tracing::info!("Retry worker stopped");
        });

        WorkerHandle {
            token,
            join: Some(join),
        }
    }
}

/// Handle to a running [`RetryWorker`] loop.
///
/// Dropping the handle stops the loop after the in-flight tick.
#[derive(Debug)]
pub struct WorkerHandle {
    token: CancellationToken,
    join: Option<JoinHandle<()>>,
}

impl WorkerHandle {
    /// Ask the loop to stop after the in-flight tick.
    pub fn shutdown(&self) {
        self.token.cancel();
    }

    /// Returns `true` once a stop was requested.
    #[must_use]
    pub fn is_stopping(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Stop the loop and wait for it to exit.
    pub async fn join(mut self) {
        self.token.cancel();
        if let Some(join) = self.join.take() {
            if let Err(err) = join.await {
                tracing::error!(error = %err, "Retry worker terminated abnormally");
            }
        }
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        self.token.cancel();
    }
}
