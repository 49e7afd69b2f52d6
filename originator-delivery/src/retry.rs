//! Retry scheduling over a per-message delay list.

use chrono::Duration;

/// Delay before the next attempt, given the schedule in effect and the
/// number of attempts made since the last attempt that produced progress.
///
/// `attempts_since_progress` counts the attempt just recorded, so it is at
/// least 1 here. The first no-progress failure gets `schedule[0]`, the
/// second `schedule[1]`, and so on; running off the end of the schedule
/// returns `None`, meaning give up. An empty schedule gives up immediately.
#[must_use]
pub fn next_retry_delay(schedule: &[u64], attempts_since_progress: u32) -> Option<Duration> {
    let index = attempts_since_progress.checked_sub(1)? as usize;
    schedule
        .get(index)
        .map(|&minutes| Duration::minutes(i64::try_from(minutes).unwrap_or(i64::MAX)))
}
