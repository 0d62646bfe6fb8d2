use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::StreamError;
use crate::outbox::OutboxEvent;

/// What an [`EventStream`] receives for each published event.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StreamEntry {
    pub event_id: Uuid,
    pub org_id: Uuid,
    pub event_type: String,
    pub aggregate_type: String,
    pub aggregate_id: String,
    pub payload: serde_json::Value,
    pub occurred_at: DateTime<Utc>,
}

impl From<&OutboxEvent> for StreamEntry {
    fn from(event: &OutboxEvent) -> Self {
        Self {
            event_id: event.id,
            org_id: event.org_id,
            event_type: event.event_type.clone(),
            aggregate_type: event.aggregate_type.clone(),
            aggregate_id: event.aggregate_id.clone(),
            payload: event.payload.clone(),
            occurred_at: event.created_at,
        }
    }
}

/// An event given up on, kept for manual inspection.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DeadLetter {
    pub event: OutboxEvent,
    /// The error of the final attempt.
    pub error: String,
    pub attempts: u32,
    pub failed_at: DateTime<Utc>,
}

/// Append-only external log.
#[async_trait]
pub trait EventStream: Send + Sync {
    /// Append one entry; returns the stream's id for it.
    async fn append(&self, entry: &StreamEntry) -> Result<String, StreamError>;
}

#[async_trait]
pub trait DeadLetterSink: Send + Sync {
    async fn dead_letter(&self, letter: &DeadLetter) -> Result<(), StreamError>;
}
