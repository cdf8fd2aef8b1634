use chrono::{DateTime, TimeZone, Utc};
use proptest::prelude::*;

use docbus::engine::ProcessingQueueElement;
use docbus::MsgId;

/// Priorities from a small range so ties are common
pub fn priority_strategy() -> impl Strategy<Value = i32> {
    0i32..5
}

/// Timestamps within one minute, millisecond resolution
pub fn timestamp_strategy() -> impl Strategy<Value = DateTime<Utc>> {
    (0i64..60_000).prop_map(|offset| {
        Utc.timestamp_millis_opt(1_700_000_000_000 + offset)
            .single()
            .unwrap_or_else(Utc::now)
    })
}

pub fn element_strategy() -> impl Strategy<Value = ProcessingQueueElement> {
    (priority_strategy(), timestamp_strategy())
        .prop_map(|(priority, timestamp)| ProcessingQueueElement::new(priority, timestamp, MsgId::new()))
}
