use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Utc};

use crate::error::Result;

/// Proof of ownership returned by [`DistributedLock::acquire`].
///
/// The token is the only thing that distinguishes this holder from whoever
/// acquires the key after the TTL runs out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeldLock {
    pub key: String,
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

/// Mutual exclusion over a shared key-value store.
///
/// Locks expire after their TTL whether or not they are released; callers
/// size the TTL above the expected critical-section duration. Release is
/// always conditional on the token, never forced.
#[async_trait]
pub trait DistributedLock: Send + Sync {
    /// Atomic set-if-absent of a fresh token with expiry `ttl`.
    ///
    /// Returns `RelayError::Conflict` if the key is held.
    async fn acquire(&self, key: &str, ttl: Duration) -> Result<HeldLock>;

    /// Delete the key if it still holds `lock.token`.
    ///
    /// Returns `false` when the lock already expired (and was possibly taken
    /// by someone else); the other holder's lock is left alone.
    async fn release(&self, lock: &HeldLock) -> Result<bool>;
}

/// Run `f` while holding `key`.
///
/// The lock is released (conditionally) whatever `f` returns. A failed or
/// lost release is logged; the result of `f` is returned regardless.
pub async fn with_lock<L, F, Fut, T>(lock: &L, key: &str, ttl: Duration, f: F) -> Result<T>
where
    L: DistributedLock + ?Sized,
    F: FnOnce() -> Fut + Send,
    Fut: Future<Output = Result<T>> + Send,
{
    let held = lock.acquire(key, ttl).await?;
    let result = f().await;

    match lock.release(&held).await {
        Ok(true) => {}
        Ok(false) => tracing::warn!(
            target: "outbox_relay::lock",
            key = %held.key,
            ttl_ms = ttl.as_millis() as u64,
            "Lock expired before release"
        ),
        Err(e) => tracing::warn!(
            target: "outbox_relay::lock",
            key = %held.key,
            error = %e,
            "Failed to release lock"
        ),
    }

    result
}

/// 128 random bits, URL-safe base64.
pub(crate) fn new_token() -> String {
    let bytes: [u8; 16] = rand::random();
    URL_SAFE_NO_PAD.encode(bytes)
}
