use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{RelayError, Result};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryStatus {
    #[default]
    Pending,
    Delivered,
    Failed,
}

impl DeliveryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryStatus::Pending => "pending",
            DeliveryStatus::Delivered => "delivered",
            DeliveryStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, DeliveryStatus::Pending)
    }
}

impl fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeliveryStatus {
    type Err = RelayError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(DeliveryStatus::Pending),
            "delivered" => Ok(DeliveryStatus::Delivered),
            "failed" => Ok(DeliveryStatus::Failed),
            other => Err(RelayError::Validation(format!("unknown delivery status '{other}'"))),
        }
    }
}

/// One webhook delivery and its attempt history.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Delivery {
    pub id: Uuid,
    pub org_id: Uuid,
    pub subscription_id: Uuid,
    pub event_id: Uuid,
    pub attempt_count: u32,
    pub last_error: Option<String>,
    pub next_attempt_at: DateTime<Utc>,
    pub status: DeliveryStatus,
    pub last_response_code: Option<u16>,
    pub last_response_body: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Delivery {
    pub fn pending(org_id: Uuid, subscription_id: Uuid, event_id: Uuid, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            org_id,
            subscription_id,
            event_id,
            attempt_count: 0,
            last_error: None,
            next_attempt_at: now,
            status: DeliveryStatus::Pending,
            last_response_code: None,
            last_response_body: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.status == DeliveryStatus::Pending
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.is_pending() && self.next_attempt_at <= now
    }
}

/// What the receiver answered, if it answered at all.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DeliveryResponse {
    pub status_code: Option<u16>,
    /// Truncated response body.
    pub body: Option<String>,
}

impl DeliveryResponse {
    pub fn none() -> Self {
        Self::default()
    }
}

/// Per-delivery attempt tracking.
///
/// Rows are created pending by the fan-out step and mutated only by the
/// dispatcher. The `mark_*` and `schedule_retry` transitions apply to pending
/// rows only; once delivered or failed a row never changes again.
#[async_trait]
pub trait DeliveryQueue: Send + Sync {
    /// Insert a pending delivery due at `now`.
    ///
    /// Returns `None` if a delivery for this `(subscription, event)` pair
    /// already exists, which keeps fan-out idempotent when an event is
    /// published more than once.
    async fn create_pending(
        &self,
        org_id: Uuid,
        subscription_id: Uuid,
        event_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Option<Delivery>>;

    /// Lease up to `limit` pending deliveries due at `now` by pushing their
    /// `next_attempt_at` to `lock_until` in the same operation.
    ///
    /// A dispatcher that dies mid-delivery needs no cleanup: the row becomes
    /// claimable again once `lock_until` passes.
    async fn claim_pending(
        &self,
        limit: usize,
        now: DateTime<Utc>,
        lock_until: DateTime<Utc>,
    ) -> Result<Vec<Delivery>>;

    async fn mark_delivered(
        &self,
        id: Uuid,
        attempt_count: u32,
        response: &DeliveryResponse,
        at: DateTime<Utc>,
    ) -> Result<()>;

    #[allow(clippy::too_many_arguments)]
    async fn schedule_retry(
        &self,
        id: Uuid,
        attempt_count: u32,
        next_attempt_at: DateTime<Utc>,
        error: &str,
        response: &DeliveryResponse,
        at: DateTime<Utc>,
    ) -> Result<()>;

    async fn mark_failed(
        &self,
        id: Uuid,
        attempt_count: u32,
        error: &str,
        response: &DeliveryResponse,
        at: DateTime<Utc>,
    ) -> Result<()>;

    async fn get(&self, id: Uuid) -> Result<Option<Delivery>>;

    async fn list_for_event(&self, event_id: Uuid) -> Result<Vec<Delivery>>;
}
