//! Long-horizon sleeping for trigger timers.
//!
//! A single timer has platform limits and drifts over long spans, so waits
//! are chained: sleep a bounded chunk, re-read the wall clock, repeat until
//! the target instant has passed.

use std::time::Duration;

use chrono::{DateTime, Utc};

/// Longest single sleep before the wall clock is re-checked.
const MAX_CHUNK: Duration = Duration::from_secs(6 * 60 * 60);

/// Sleep until a wall-clock instant. Returns immediately when the target is
/// already in the past.
pub async fn sleep_until(target: DateTime<Utc>) {
    sleep_until_chunked(target, MAX_CHUNK).await
}

async fn sleep_until_chunked(target: DateTime<Utc>, max_chunk: Duration) {
    loop {
        let remaining = match (target - Utc::now()).to_std() {
            Ok(d) if !d.is_zero() => d,
            _ => return,
        };
        tokio::time::sleep(remaining.min(max_chunk)).await;
    }
}
