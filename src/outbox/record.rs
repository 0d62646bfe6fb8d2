use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// An event to be written to the outbox together with the business change it describes.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NewEvent {
    pub org_id: Uuid,
    pub event_type: String,
    pub aggregate_type: String,
    pub aggregate_id: String,
    pub payload: serde_json::Value,
    /// Unique per `(org_id, aggregate_type, aggregate_id)`.
    pub dedupe_key: String,
}

impl NewEvent {
    pub fn new(
        org_id: Uuid,
        event_type: impl Into<String>,
        aggregate_type: impl Into<String>,
        aggregate_id: impl Into<String>,
        payload: serde_json::Value,
        dedupe_key: impl Into<String>,
    ) -> Self {
        Self {
            org_id,
            event_type: event_type.into(),
            aggregate_type: aggregate_type.into(),
            aggregate_id: aggregate_id.into(),
            payload,
            dedupe_key: dedupe_key.into(),
        }
    }

    /// Serialize `payload` into the event.
    pub fn encode<T: Serialize>(
        org_id: Uuid,
        event_type: impl Into<String>,
        aggregate_type: impl Into<String>,
        aggregate_id: impl Into<String>,
        payload: &T,
        dedupe_key: impl Into<String>,
    ) -> Result<Self, serde_json::Error> {
        let payload = serde_json::to_value(payload)?;
        Ok(Self::new(
            org_id,
            event_type,
            aggregate_type,
            aggregate_id,
            payload,
            dedupe_key,
        ))
    }
}

/// A row of the outbox.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OutboxEvent {
    pub id: Uuid,
    pub org_id: Uuid,
    pub aggregate_type: String,
    pub aggregate_id: String,
    pub event_type: String,
    pub payload: serde_json::Value,
    pub dedupe_key: String,
    pub attempt_count: u32,
    pub last_error: Option<String>,
    pub next_attempt_at: DateTime<Utc>,
    pub locked_by: Option<String>,
    pub locked_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    /// `None` while pending. Set once; never cleared.
    pub processed_at: Option<DateTime<Utc>>,
}

impl OutboxEvent {
    /// Build the pending row for `event`, due immediately.
    pub fn pending(event: NewEvent, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            org_id: event.org_id,
            aggregate_type: event.aggregate_type,
            aggregate_id: event.aggregate_id,
            event_type: event.event_type,
            payload: event.payload,
            dedupe_key: event.dedupe_key,
            attempt_count: 0,
            last_error: None,
            next_attempt_at: now,
            locked_by: None,
            locked_at: None,
            created_at: now,
            processed_at: None,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.processed_at.is_none()
    }

    pub fn is_processed(&self) -> bool {
        self.processed_at.is_some()
    }

    pub fn is_locked(&self) -> bool {
        self.locked_by.is_some()
    }

    /// Pending, unlocked and due at `now`.
    pub fn is_claimable(&self, now: DateTime<Utc>) -> bool {
        self.is_pending() && !self.is_locked() && self.next_attempt_at <= now
    }

    /// Decode the payload into a concrete type.
    pub fn decode<T: serde::de::DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        T::deserialize(&self.payload)
    }
}
