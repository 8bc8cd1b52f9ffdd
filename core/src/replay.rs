//! Replay driver shared by every [`EventStore`] backend.
//!
//! The driver validates the filter, loads the matching events oldest first
//! and feeds them to the handler one by one. Handler failures are counted and
//! the scan moves on. Each handler call races the caller's cancellation token
//! and the replay deadline; if either fires, the replay stops and returns the
//! counts gathered so far inside [`EventStoreError::Interrupted`]. Events
//! already marked processed stay marked.

use crate::event_store::{EventFilter, EventStore, EventStoreError, ReplayResult};
use crate::handler::EventHandler;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Deadline applied when the filter carries no timeout.
pub const DEFAULT_REPLAY_TIMEOUT: Duration = Duration::from_secs(5 * 60);

enum Interrupt {
    Cancelled,
    DeadlineExceeded,
}

impl Interrupt {
    const fn reason(&self) -> &'static str {
        match self {
            Self::Cancelled => "replay cancelled",
            Self::DeadlineExceeded => "replay deadline exceeded",
        }
    }
}

/// Run a replay against `store`.
///
/// # Errors
///
/// See [`EventStore::replay`].
pub async fn run<S: EventStore + ?Sized>(
    store: &S,
    handler: &dyn EventHandler,
    filter: &EventFilter,
    cancel: &CancellationToken,
) -> Result<ReplayResult, EventStoreError> {
    filter.validate()?;

    let started = Instant::now();
    let deadline =
        tokio::time::Instant::now() + filter.timeout.unwrap_or(DEFAULT_REPLAY_TIMEOUT);
    let event_type = filter.event_type.as_deref().unwrap_or("all");

    info!(
        event_type,
        handler = handler.handler_name(),
        start_time = ?filter.start_time,
        end_time = ?filter.end_time,
        range = %describe_range(filter),
        dry_run = filter.dry_run,
        "Event replay started"
    );

    let loaded = tokio::select! {
        biased;
        () = cancel.cancelled() => Err(Interrupt::Cancelled),
        () = tokio::time::sleep_until(deadline) => Err(Interrupt::DeadlineExceeded),
        events = store.find(filter) => Ok(events),
    };

    let events = match loaded {
        Ok(Ok(events)) => events,
        Ok(Err(err)) => {
            let duration = started.elapsed();
            error!(
                event_type,
                result = "query_error",
                error = %err,
                duration = ?duration,
                duration_ms = duration_ms(duration),
                "Event replay failed"
            );
            return Err(err);
        }
        Err(interrupt) => {
            return Err(interrupted(event_type, interrupt, ReplayResult::default(), started));
        }
    };

    let mut result = ReplayResult::default();

    for event in events {
        if cancel.is_cancelled() {
            return Err(interrupted(event_type, Interrupt::Cancelled, result, started));
        }
        if tokio::time::Instant::now() >= deadline {
            return Err(interrupted(event_type, Interrupt::DeadlineExceeded, result, started));
        }

        if filter.dry_run {
            result.skipped_count += 1;
            continue;
        }

        let outcome = tokio::select! {
            biased;
            () = cancel.cancelled() => Err(Interrupt::Cancelled),
            () = tokio::time::sleep_until(deadline) => Err(Interrupt::DeadlineExceeded),
            handled = handler.handle(&event) => Ok(handled),
        };

        match outcome {
            Ok(Ok(())) => {
                result.replayed_count += 1;
                if let Err(err) = store.mark_processed(&event.id).await {
                    warn!(
                        event_id = %event.id,
                        error = %err,
                        "Failed to mark replayed event as processed"
                    );
                }
            }
            Ok(Err(err)) => {
                result.failed_count += 1;
                warn!(
                    event_id = %event.id,
                    event_type = %event.event_type,
                    handler = handler.handler_name(),
                    error = %err,
                    "Replay handler failed"
                );
            }
            Err(interrupt) => {
                return Err(interrupted(event_type, interrupt, result, started));
            }
        }
    }

    result.duration = started.elapsed();

    if result.failed_count > 0 {
        warn!(
            event_type,
            result = "partial_failure",
            replayed_count = result.replayed_count,
            failed_count = result.failed_count,
            skipped_count = result.skipped_count,
            duration = ?result.duration,
            duration_ms = duration_ms(result.duration),
            "Event replay completed with failures"
        );
    } else {
        info!(
            event_type,
            result = "success",
            replayed_count = result.replayed_count,
            failed_count = result.failed_count,
            skipped_count = result.skipped_count,
            duration = ?result.duration,
            duration_ms = duration_ms(result.duration),
            "Event replay completed successfully"
        );
    }

    Ok(result)
}

fn interrupted(
    event_type: &str,
    interrupt: Interrupt,
    mut partial: ReplayResult,
    started: Instant,
) -> EventStoreError {
    partial.duration = started.elapsed();
    error!(
        event_type,
        result = "interrupted",
        error = interrupt.reason(),
        replayed_count = partial.replayed_count,
        failed_count = partial.failed_count,
        skipped_count = partial.skipped_count,
        duration = ?partial.duration,
        duration_ms = duration_ms(partial.duration),
        "Event replay failed"
    );
    EventStoreError::Interrupted {
        reason: interrupt.reason().to_string(),
        partial,
    }
}

fn describe_range(filter: &EventFilter) -> String {
    match (filter.start_time, filter.end_time) {
        (Some(start), Some(end)) => format!("{} to {}", start.to_rfc3339(), end.to_rfc3339()),
        (Some(start), None) => format!("from {}", start.to_rfc3339()),
        (None, Some(end)) => format!("until {}", end.to_rfc3339()),
        (None, None) => "all".to_string(),
    }
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    #[test]
    fn range_descriptions() {
        let start = Utc.timestamp_opt(0, 0).single().unwrap_or_default();
        assert_eq!(describe_range(&EventFilter::new()), "all");
        assert_eq!(
            describe_range(&EventFilter::new().with_time_range(Some(start), None)),
            "from 1970-01-01T00:00:00+00:00"
        );
    }

    #[test]
    fn duration_ms_saturates() {
        assert_eq!(duration_ms(Duration::from_millis(1500)), 1500);
    }
}
