use std::sync::Arc;
use std::time::Duration;

use uuid::Uuid;

use super::record::{request_hash, IdempotencyRecord, StoredResponse, DEFAULT_TTL};
use super::store::IdempotencyStore;
use crate::clock::{Clock, SystemClock};
use crate::error::{RelayError, Result};

/// What the caller should do with a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdempotencyDecision {
    /// First sighting: a placeholder is stored, run the work and then call
    /// [`Idempotency::complete`].
    Execute,
    /// Already completed: return the stored response without running anything.
    Replay(StoredResponse),
}

/// Request deduplication on top of an [`IdempotencyStore`].
#[derive(Clone)]
pub struct Idempotency {
    store: Arc<dyn IdempotencyStore>,
    clock: Arc<dyn Clock>,
    ttl: Duration,
}

impl Idempotency {
    pub fn new(store: Arc<dyn IdempotencyStore>) -> Self {
        Self {
            store,
            clock: Arc::new(SystemClock),
            ttl: DEFAULT_TTL,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// How long records are kept.
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Decide whether to run the request identified by `(org_id, key, endpoint)`.
    ///
    /// # Errors
    ///
    /// - `RelayError::Conflict` if an identical request is still in progress
    /// - `RelayError::Validation` if the key was used with a different body
    pub async fn begin(
        &self,
        org_id: Uuid,
        key: &str,
        endpoint: &str,
        body: &[u8],
    ) -> Result<IdempotencyDecision> {
        let hash = request_hash(body);

        if let Some(existing) = self.store.get(org_id, key, endpoint).await? {
            return decide_existing(&existing, &hash);
        }

        let placeholder =
            IdempotencyRecord::placeholder(org_id, key, endpoint, hash.clone(), self.clock.now(), self.ttl);
        match self.store.create_placeholder(&placeholder).await {
            Ok(()) => Ok(IdempotencyDecision::Execute),
            Err(e) if e.is_conflict() => {
                // Lost the insert race; the winner's record decides.
                match self.store.get(org_id, key, endpoint).await? {
                    Some(existing) => decide_existing(&existing, &hash),
                    None => Err(e),
                }
            }
            Err(e) => Err(e),
        }
    }

    /// Store the response of a request that [`begin`](Self::begin) let through.
    pub async fn complete(
        &self,
        org_id: Uuid,
        key: &str,
        endpoint: &str,
        response: &StoredResponse,
    ) -> Result<()> {
        self.store.update_response(org_id, key, endpoint, response).await
    }

    /// Forget a request whose work failed, so the client may retry with the same key.
    pub async fn abandon(&self, org_id: Uuid, key: &str, endpoint: &str) -> Result<()> {
        self.store.delete(org_id, key, endpoint).await?;
        Ok(())
    }
}

fn decide_existing(existing: &IdempotencyRecord, hash: &str) -> Result<IdempotencyDecision> {
    if existing.request_hash != hash {
        return Err(RelayError::Validation(format!(
            "idempotency key '{}' was used with a different request body",
            existing.key
        )));
    }
    match existing.response() {
        Some(response) => Ok(IdempotencyDecision::Replay(response)),
        None => Err(RelayError::Conflict(format!(
            "request with idempotency key '{}' is in progress",
            existing.key
        ))),
    }
}
