//! Retry scheduling shared by the publisher and the dispatcher.

use std::time::Duration;

use chrono::{DateTime, Utc};

/// Longest delay between two attempts.
pub const MAX_BACKOFF: Duration = Duration::from_secs(60 * 60);

/// Exponential backoff: `min(2^attempt seconds, 1 hour)`, no jitter.
///
/// `attempt` is the number of attempts made so far, so the first retry
/// (attempt 1) waits 2s, the second 4s, and so on.
pub fn backoff(attempt: u32) -> Duration {
    let secs = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
    Duration::from_secs(secs).min(MAX_BACKOFF)
}

/// Parse a `Retry-After` header value.
///
/// Accepts delta-seconds (`"120"`) or an HTTP-date
/// (`"Wed, 21 Oct 2015 07:28:00 GMT"`). Dates in the past yield zero.
pub fn parse_retry_after(value: &str, now: DateTime<Utc>) -> Option<Duration> {
    let value = value.trim();
    if value.is_empty() {
        return None;
    }

    if let Ok(secs) = value.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }

    let at = DateTime::parse_from_rfc2822(value).ok()?.with_timezone(&Utc);
    Some((at - now).to_std().unwrap_or(Duration::ZERO))
}
