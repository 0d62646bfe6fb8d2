use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::record::{NewEvent, OutboxEvent};
use crate::error::Result;

/// Durable queue of events awaiting publication.
///
/// `claim`, `mark_processed`, `mark_failed` and `schedule_retry` are the only
/// operations that mutate a row after it is enqueued. Claiming is the sole mutual exclusion
/// between concurrent publishers: two callers never receive the same row.
#[async_trait]
pub trait EventLog: Send + Sync {
    /// Insert a pending row (attempt 0, due now).
    ///
    /// Backends that support transactions also offer a variant that joins the
    /// caller's transaction; see `PgEventLog::enqueue_with`.
    async fn enqueue(&self, event: NewEvent) -> Result<OutboxEvent>;

    /// Lock up to `limit` pending, unlocked, due rows for `worker_id`,
    /// skipping rows another claimant holds.
    async fn claim(&self, worker_id: &str, limit: usize) -> Result<Vec<OutboxEvent>>;

    /// Terminal transition. Calling it again leaves `processed_at` untouched.
    async fn mark_processed(&self, id: Uuid, at: DateTime<Utc>) -> Result<()>;

    /// Terminal transition for an event that used up its attempts.
    ///
    /// Records the final attempt and error and closes the row in a single
    /// write, so a crash cannot leave it retryable after it was dead-lettered.
    /// A row that is already processed is left untouched.
    async fn mark_failed(&self, id: Uuid, attempt: u32, last_error: &str, at: DateTime<Utc>) -> Result<()>;

    /// Record a failed attempt and unlock the row until `next_attempt_at`.
    async fn schedule_retry(
        &self,
        id: Uuid,
        attempt: u32,
        next_attempt_at: DateTime<Utc>,
        last_error: &str,
    ) -> Result<()>;

    async fn get(&self, id: Uuid) -> Result<Option<OutboxEvent>>;

    /// Unlock pending rows whose claim is older than `locked_before`.
    ///
    /// Claims carry no expiry of their own: a publisher that dies between
    /// `claim` and recording the outcome leaves its rows locked
    /// until this is called.
    async fn release_stale_claims(&self, locked_before: DateTime<Utc>) -> Result<u64>;
}
