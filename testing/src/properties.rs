//! Property-based testing utilities using proptest.

use chrono::{DateTime, TimeZone, Utc};
use eventline_core::event::BaseEvent;
use proptest::prelude::*;

/// Event types drawn from a small fixed vocabulary so filters hit often.
pub fn arb_event_type() -> impl Strategy<Value = String> {
    prop_oneof![
        Just("order.created".to_string()),
        Just("order.paid".to_string()),
        Just("user.registered".to_string()),
    ]
}

/// Sources drawn from a small fixed vocabulary.
pub fn arb_source() -> impl Strategy<Value = String> {
    prop_oneof![Just("orders".to_string()), Just("users".to_string())]
}

/// Timestamps within one day after 2025-01-01.
pub fn arb_timestamp() -> impl Strategy<Value = DateTime<Utc>> {
    (0_i64..86_400).prop_map(|secs| {
        Utc.timestamp_opt(1_735_689_600 + secs, 0)
            .single()
            .unwrap_or_default()
    })
}

/// Arbitrary [`BaseEvent`] with a small numeric payload.
pub fn arb_event() -> impl Strategy<Value = BaseEvent> {
    (arb_event_type(), arb_source(), arb_timestamp(), any::<u32>()).prop_map(
        |(event_type, source, timestamp, seq)| {
            BaseEvent::new(event_type, serde_json::json!({ "seq": seq }), source)
                .with_timestamp(timestamp)
        },
    )
}
