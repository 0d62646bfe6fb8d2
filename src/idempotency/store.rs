use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::record::{IdempotencyRecord, StoredResponse};
use crate::error::Result;

/// Storage for idempotency records.
///
/// Races between concurrent identical requests are settled by the store's
/// uniqueness on `(org_id, key, endpoint)`, never by an in-process lock.
#[async_trait]
pub trait IdempotencyStore: Send + Sync {
    /// The unexpired record for this request, if any.
    async fn get(&self, org_id: Uuid, key: &str, endpoint: &str) -> Result<Option<IdempotencyRecord>>;

    /// Insert a placeholder.
    ///
    /// Returns `RelayError::Conflict` if an unexpired record exists. An expired
    /// record is replaced.
    async fn create_placeholder(&self, record: &IdempotencyRecord) -> Result<()>;

    /// Store the response of a completed request.
    async fn update_response(
        &self,
        org_id: Uuid,
        key: &str,
        endpoint: &str,
        response: &StoredResponse,
    ) -> Result<()>;

    /// Drop the record so the client may retry with the same key.
    async fn delete(&self, org_id: Uuid, key: &str, endpoint: &str) -> Result<bool>;

    /// Remove records that expired at or before `now`.
    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64>;
}
