//! Host deadlines.
//!
//! Hosts announce invocation deadlines as milliseconds since the Unix epoch.
//! Both processes turn them into a remaining duration against the wall clock
//! once, then count down on their own monotonic clock.

use std::time::Duration;

use chrono::Utc;

/// Time left until an epoch-millisecond deadline, zero once it has passed.
pub fn remaining_until_epoch_ms(deadline_ms: u64) -> Duration {
    remaining_between(deadline_ms, Utc::now().timestamp_millis())
}

fn remaining_between(deadline_ms: u64, now_ms: i64) -> Duration {
    let deadline_ms = i64::try_from(deadline_ms).unwrap_or(i64::MAX);
    let remaining = u64::try_from(deadline_ms.saturating_sub(now_ms)).unwrap_or(0);
    Duration::from_millis(remaining)
}
