use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::limiter::{bucket_key, window_start, RateLimitDecision, RateLimiter, DEFAULT_SCOPE};
use crate::clock::{add, Clock, SystemClock};
use crate::error::{RelayError, Result};

struct Bucket {
    count: u64,
    expires_at: DateTime<Utc>,
}

/// Fixed-window counters held in memory. Clones share counters.
#[derive(Clone)]
pub struct InMemoryRateLimiter {
    buckets: Arc<Mutex<HashMap<String, Bucket>>>,
    clock: Arc<dyn Clock>,
    scope: String,
}

impl InMemoryRateLimiter {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            buckets: Arc::new(Mutex::new(HashMap::new())),
            clock,
            scope: DEFAULT_SCOPE.to_string(),
        }
    }

    pub fn with_scope(mut self, scope: impl Into<String>) -> Self {
        self.scope = scope.into();
        self
    }
}

impl Default for InMemoryRateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RateLimiter for InMemoryRateLimiter {
    async fn allow(&self, key: &str, limit: u32, window: Duration) -> Result<RateLimitDecision> {
        let now = self.clock.now();
        let start = window_start(now, window)?;
        let bucket = bucket_key(&self.scope, key, start);

        let mut buckets = self.buckets.lock().map_err(|_| RelayError::poisoned("rate limiter"))?;
        buckets.retain(|_, b| b.expires_at > now);

        let entry = buckets.entry(bucket).or_insert(Bucket { count: 0, expires_at: now });
        entry.count += 1;
        entry.expires_at = add(now, window);

        Ok(RateLimitDecision::new(entry.count, limit, start, window))
    }
}
