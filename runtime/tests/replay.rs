//! Replay behaviour against the in-memory store.
#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use chrono::Utc;
use eventline_core::CancellationToken;
use eventline_core::event::Event;
use eventline_core::event_store::{EventFilter, EventStore, EventStoreError};
use eventline_testing::fixtures::event_series;
use eventline_testing::{CapturedLogs, InMemoryEventStore, RecordingHandler};
use std::sync::Arc;
use std::time::Duration;

async fn seeded(count: u64) -> Arc<InMemoryEventStore> {
    let store = Arc::new(InMemoryEventStore::new());
    let events = event_series("order.created", "orders", Utc::now(), count);
    store.store_batch(&events).await.unwrap();
    store
}

fn seq_of(event: &dyn Event) -> u64 {
    event.event_data()["seq"].as_u64().unwrap()
}

async fn processed_count(store: &InMemoryEventStore) -> u64 {
    store
        .count(&EventFilter::new().with_processed(true))
        .await
        .unwrap()
}

#[tokio::test]
async fn dry_run_only_counts_matches() {
    let store = seeded(5).await;
    let handler = RecordingHandler::new("projector", ["order.created"]);
    let filter = EventFilter::new().with_event_type("order.created").dry_run(true);

    let result = store
        .replay(&handler, &filter, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(result.skipped_count, 5);
    assert_eq!(result.replayed_count, 0);
    assert_eq!(result.failed_count, 0);
    assert_eq!(handler.call_count(), 0);
    assert_eq!(processed_count(&store).await, 0);
}

#[tokio::test]
async fn failures_are_counted_and_scan_continues() {
    let store = seeded(6).await;
    let handler = RecordingHandler::new("projector", ["order.created"])
        .failing_when(|e| seq_of(e) % 3 == 0);

    let result = store
        .replay(&handler, &EventFilter::new(), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(result.failed_count, 2);
    assert_eq!(result.replayed_count, 4);
    assert_eq!(handler.call_count(), 6);
    assert_eq!(processed_count(&store).await, 4);
}

#[tokio::test]
async fn events_are_replayed_oldest_first() {
    let store = Arc::new(InMemoryEventStore::new());
    let mut events = event_series("order.created", "orders", Utc::now(), 4);
    events.reverse();
    store.store_batch(&events).await.unwrap();
    let handler = RecordingHandler::new("projector", ["order.created"]);

    store
        .replay(&handler, &EventFilter::new(), &CancellationToken::new())
        .await
        .unwrap();

    let seqs: Vec<u64> = handler.events().iter().map(|e| seq_of(e)).collect();
    assert_eq!(seqs, vec![0, 1, 2, 3]);
}

#[tokio::test]
async fn filter_narrows_the_replay() {
    let store = seeded(3).await;
    let other = event_series("user.registered", "accounts", Utc::now(), 2);
    store.store_batch(&other).await.unwrap();
    let handler = RecordingHandler::new("projector", ["user.registered"]);

    let result = store
        .replay_with_type("user.registered", &handler, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(result.replayed_count, 2);
    assert!(handler.events().iter().all(|e| e.event_type == "user.registered"));
}

#[tokio::test]
async fn invalid_filters_are_rejected_before_querying() {
    let store = seeded(2).await;
    store.fail_reads(true);
    let handler = RecordingHandler::new("projector", ["order.created"]);
    let now = Utc::now();
    let cases = [
        EventFilter::new().with_page(-1, 0),
        EventFilter::new().with_page(10, -5),
        EventFilter::new().with_time_range(Some(now), Some(now - chrono::Duration::hours(1))),
    ];

    for filter in cases {
        let err = store
            .replay(&handler, &filter, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, EventStoreError::Validation(_)), "{err:?}");
    }
    assert_eq!(handler.call_count(), 0);
}

#[tokio::test]
async fn query_errors_are_returned() {
    let logs = CapturedLogs::new();
    let _guard = logs.install();
    let store = seeded(2).await;
    store.fail_reads(true);
    let handler = RecordingHandler::new("projector", ["order.created"]);

    let err = store
        .replay(&handler, &EventFilter::new(), &CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(err, EventStoreError::Database(_)));
    let failed = logs.lines_with("Event replay failed");
    assert_eq!(failed.len(), 1);
    assert!(failed[0].contains("query_error"));
}

#[tokio::test]
async fn unknown_start_event_is_a_validation_error() {
    let store = seeded(1).await;
    let handler = RecordingHandler::new("projector", ["order.created"]);

    let err = store
        .replay_from_event_id("evt_missing", &handler, &CancellationToken::new())
        .await
        .unwrap_err();

    assert_eq!(err, EventStoreError::Validation("event not found: evt_missing".to_string()));
}

#[tokio::test]
async fn replay_from_event_id_starts_at_that_event() {
    let store = seeded(4).await;
    let third = store
        .find(&EventFilter::new())
        .await
        .unwrap()
        .into_iter()
        .nth(2)
        .unwrap();
    let handler = RecordingHandler::new("projector", ["order.created"]);

    let result = store
        .replay_from_event_id(&third.id, &handler, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(result.replayed_count, 2);
    assert_eq!(handler.events()[0].event_data["seq"], serde_json::json!(2));
}

#[tokio::test(start_paused = true)]
async fn cancellation_stops_mid_scan_and_keeps_marks() {
    let store = seeded(5).await;
    let handler =
        RecordingHandler::new("projector", ["order.created"]).with_delay(Duration::from_secs(1));
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(2500)).await;
        trigger.cancel();
    });

    let err = store
        .replay(&handler, &EventFilter::new(), &cancel)
        .await
        .unwrap_err();

    let (reason, partial) = match err {
        EventStoreError::Interrupted { reason, partial } => (reason, partial),
        other => panic!("expected interruption, got {other:?}"),
    };
    assert_eq!(reason, "replay cancelled");
    assert_eq!(partial.replayed_count, 2);
    assert_eq!(processed_count(&store).await, 2);
}

#[tokio::test(start_paused = true)]
async fn deadline_interrupts_long_replays() {
    let store = seeded(3).await;
    let handler =
        RecordingHandler::new("projector", ["order.created"]).with_delay(Duration::from_secs(1));
    let filter = EventFilter::new().with_timeout(Duration::from_millis(1500));

    let err = store
        .replay(&handler, &filter, &CancellationToken::new())
        .await
        .unwrap_err();

    let (reason, partial) = match err {
        EventStoreError::Interrupted { reason, partial } => (reason, partial),
        other => panic!("expected interruption, got {other:?}"),
    };
    assert_eq!(reason, "replay deadline exceeded");
    assert_eq!(partial.replayed_count, 1);
}

#[tokio::test]
async fn dry_run_stops_at_the_deadline() {
    let store = InMemoryEventStore::new().with_read_latency(Duration::from_millis(50));
    let events = event_series("order.created", "orders", Utc::now(), 3);
    store.store_batch(&events).await.unwrap();
    let handler = RecordingHandler::new("projector", ["order.created"]);
    let filter = EventFilter::new()
        .dry_run(true)
        .with_timeout(Duration::from_millis(10));

    let err = store
        .replay(&handler, &filter, &CancellationToken::new())
        .await
        .unwrap_err();

    let (reason, partial) = match err {
        EventStoreError::Interrupted { reason, partial } => (reason, partial),
        other => panic!("expected interruption, got {other:?}"),
    };
    assert_eq!(reason, "replay deadline exceeded");
    assert_eq!(partial.skipped_count, 0);
    assert_eq!(handler.call_count(), 0);
}

#[tokio::test]
async fn completion_is_logged_with_counts() {
    let logs = CapturedLogs::new();
    let _guard = logs.install();
    let store = seeded(3).await;
    let handler = RecordingHandler::new("projector", ["order.created"])
        .failing_when(|e| seq_of(e) == 1);
    let filter = EventFilter::new().with_event_type("order.created");

    store
        .replay(&handler, &filter, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(logs.lines_with("Event replay started").len(), 1);
    let done = logs.lines_with("Event replay completed with failures");
    assert_eq!(done.len(), 1);
    assert!(done[0].contains("WARN"));
    assert!(done[0].contains("result=\"partial_failure\"") || done[0].contains("result=partial_failure"));
    assert!(done[0].contains("replayed_count=2"));
    assert!(done[0].contains("failed_count=1"));
}
