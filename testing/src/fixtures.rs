//! Event fixtures.

use chrono::{DateTime, Utc};
use eventline_core::event::{BaseEvent, SharedEvent};
use std::sync::Arc;

/// `order.created` from `orders`, stamped now.
#[must_use]
pub fn order_created() -> SharedEvent {
    Arc::new(BaseEvent::new(
        "order.created",
        serde_json::json!({ "order_id": "o-1", "total_cents": 4200 }),
        "orders",
    ))
}

/// Event of `event_type` from `source` at `timestamp` with a `seq` payload.
#[must_use]
pub fn event_at(
    event_type: &str,
    source: &str,
    timestamp: DateTime<Utc>,
    seq: u64,
) -> BaseEvent {
    BaseEvent::new(event_type, serde_json::json!({ "seq": seq }), source)
        .with_timestamp(timestamp)
}

/// `count` events of `event_type`, one second apart starting at `start`.
#[must_use]
pub fn event_series(event_type: &str, source: &str, start: DateTime<Utc>, count: u64) -> Vec<SharedEvent> {
    (0..count)
        .map(|seq| {
            let offset = chrono::Duration::seconds(i64::try_from(seq).unwrap_or(i64::MAX));
            Arc::new(event_at(event_type, source, start + offset, seq)) as SharedEvent
        })
        .collect()
}
