use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use super::lock::{new_token, DistributedLock, HeldLock};
use crate::clock::{add, Clock, SystemClock};
use crate::error::{RelayError, Result};

/// In-memory lock table with clock-driven expiry.
///
/// Expired entries are treated as absent and overwritten on the next
/// acquire. Clones share the same table.
#[derive(Clone)]
pub struct InMemoryLock {
    held: Arc<Mutex<HashMap<String, HeldLock>>>,
    clock: Arc<dyn Clock>,
}

impl InMemoryLock {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            held: Arc::new(Mutex::new(HashMap::new())),
            clock,
        }
    }

    /// Whether `key` is held and unexpired.
    pub fn is_held(&self, key: &str) -> bool {
        let now = self.clock.now();
        self.held
            .lock()
            .map(|held| held.get(key).is_some_and(|l| l.expires_at > now))
            .unwrap_or(false)
    }
}

impl Default for InMemoryLock {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DistributedLock for InMemoryLock {
    async fn acquire(&self, key: &str, ttl: Duration) -> Result<HeldLock> {
        let now = self.clock.now();
        let mut held = self.held.lock().map_err(|_| RelayError::poisoned("lock table"))?;

        if held.get(key).is_some_and(|l| l.expires_at > now) {
            return Err(RelayError::Conflict(format!("lock '{key}' is held")));
        }

        let lock = HeldLock {
            key: key.to_string(),
            token: new_token(),
            expires_at: add(now, ttl),
        };
        held.insert(key.to_string(), lock.clone());
        Ok(lock)
    }

    async fn release(&self, lock: &HeldLock) -> Result<bool> {
        let now = self.clock.now();
        let mut held = self.held.lock().map_err(|_| RelayError::poisoned("lock table"))?;

        let owned = held
            .get(&lock.key)
            .is_some_and(|l| l.token == lock.token && l.expires_at > now);
        if owned {
            held.remove(&lock.key);
        }
        Ok(owned)
    }
}
