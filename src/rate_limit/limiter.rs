use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde::Serialize;

use crate::error::{RelayError, Result};

/// Key prefix used when none is configured.
pub const DEFAULT_SCOPE: &str = "ratelimit";

/// Outcome of one [`RateLimiter::allow`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RateLimitDecision {
    pub allowed: bool,
    pub limit: u32,
    /// Requests counted in the current window, this one included.
    pub count: u64,
    pub remaining: u32,
    /// End of the current window.
    pub reset_at: DateTime<Utc>,
}

impl RateLimitDecision {
    pub(crate) fn new(count: u64, limit: u32, window_start: DateTime<Utc>, window: Duration) -> Self {
        let remaining = u64::from(limit).saturating_sub(count);
        Self {
            allowed: count <= u64::from(limit),
            limit,
            count,
            remaining: u32::try_from(remaining).unwrap_or(u32::MAX),
            reset_at: crate::clock::add(window_start, window),
        }
    }

    /// Time until the window resets, rounded up to whole seconds.
    pub fn retry_after(&self, now: DateTime<Utc>) -> Duration {
        let millis = (self.reset_at - now).num_milliseconds().max(0) as u64;
        Duration::from_secs(millis.div_ceil(1000))
    }
}

/// Fixed-window request counter.
///
/// Windows are aligned to the Unix epoch, so every process agrees on where a
/// window starts without coordination.
#[async_trait]
pub trait RateLimiter: Send + Sync {
    /// Count one request for `key` and decide whether it is within `limit`
    /// for the current `window`.
    async fn allow(&self, key: &str, limit: u32, window: Duration) -> Result<RateLimitDecision>;
}

/// `now` truncated to a multiple of `window`.
pub(crate) fn window_start(now: DateTime<Utc>, window: Duration) -> Result<DateTime<Utc>> {
    let window_ms = i64::try_from(window.as_millis()).unwrap_or(i64::MAX);
    if window_ms <= 0 {
        return Err(RelayError::Validation("rate limit window must be at least 1ms".into()));
    }
    let now_ms = now.timestamp_millis();
    let start_ms = now_ms - now_ms.rem_euclid(window_ms);
    Utc.timestamp_millis_opt(start_ms)
        .single()
        .ok_or_else(|| RelayError::Validation(format!("window start {start_ms} out of range")))
}

/// `{scope}:{key}:{window_start_ms}`.
pub(crate) fn bucket_key(scope: &str, key: &str, window_start: DateTime<Utc>) -> String {
    format!("{scope}:{key}:{}", window_start.timestamp_millis())
}
