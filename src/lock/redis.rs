//! Redis lock backend. Requires the `redis` feature.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::Script;

use super::lock::{new_token, DistributedLock, HeldLock};
use crate::clock::add;
use crate::error::{RelayError, Result};

const RELEASE_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
else
    return 0
end
"#;

/// `SET key token NX PX ttl` to acquire, a Lua check-and-delete to release.
#[derive(Clone)]
pub struct RedisLock {
    conn: ConnectionManager,
    release: Script,
}

impl RedisLock {
    pub fn new(conn: ConnectionManager) -> Self {
        Self {
            conn,
            release: Script::new(RELEASE_SCRIPT),
        }
    }

    pub async fn connect(redis_url: &str) -> Result<Self> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| RelayError::Storage(format!("invalid redis url: {e}")))?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Self::new(conn))
    }
}

#[async_trait]
impl DistributedLock for RedisLock {
    async fn acquire(&self, key: &str, ttl: Duration) -> Result<HeldLock> {
        let token = new_token();
        let ttl_ms = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1);

        let mut conn = self.conn.clone();
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(&token)
            .arg("NX")
            .arg("PX")
            .arg(ttl_ms)
            .query_async(&mut conn)
            .await?;

        if reply.is_none() {
            return Err(RelayError::Conflict(format!("lock '{key}' is held")));
        }

        Ok(HeldLock {
            key: key.to_string(),
            token,
            expires_at: add(chrono::Utc::now(), ttl),
        })
    }

    async fn release(&self, lock: &HeldLock) -> Result<bool> {
        let mut conn = self.conn.clone();
        let deleted: i64 = self
            .release
            .key(&lock.key)
            .arg(&lock.token)
            .invoke_async(&mut conn)
            .await?;
        Ok(deleted == 1)
    }
}
