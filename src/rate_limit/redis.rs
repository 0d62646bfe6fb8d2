//! Redis rate limiter. Requires the `redis` feature.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;

use super::limiter::{bucket_key, window_start, RateLimitDecision, RateLimiter, DEFAULT_SCOPE};
use crate::error::{RelayError, Result};

/// `MULTI INCR PEXPIRE EXEC` per request.
#[derive(Clone)]
pub struct RedisRateLimiter {
    conn: ConnectionManager,
    scope: String,
}

impl RedisRateLimiter {
    pub fn new(conn: ConnectionManager) -> Self {
        Self {
            conn,
            scope: DEFAULT_SCOPE.to_string(),
        }
    }

    pub async fn connect(redis_url: &str) -> Result<Self> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| RelayError::Storage(format!("invalid redis url: {e}")))?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Self::new(conn))
    }

    pub fn with_scope(mut self, scope: impl Into<String>) -> Self {
        self.scope = scope.into();
        self
    }
}

#[async_trait]
impl RateLimiter for RedisRateLimiter {
    async fn allow(&self, key: &str, limit: u32, window: Duration) -> Result<RateLimitDecision> {
        let now = chrono::Utc::now();
        let start = window_start(now, window)?;
        let bucket = bucket_key(&self.scope, key, start);
        let window_ms = i64::try_from(window.as_millis()).unwrap_or(i64::MAX);

        let mut conn = self.conn.clone();
        let (count,): (u64,) = redis::pipe()
            .atomic()
            .incr(&bucket, 1)
            .pexpire(&bucket, window_ms)
            .ignore()
            .query_async(&mut conn)
            .await?;

        Ok(RateLimitDecision::new(count, limit, start, window))
    }
}
