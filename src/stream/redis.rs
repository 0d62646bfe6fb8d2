//! Redis stream backend. Requires the `redis` feature.

use async_trait::async_trait;
use redis::aio::ConnectionManager;

use super::sink::{DeadLetter, DeadLetterSink, EventStream, StreamEntry};
use crate::error::StreamError;

/// Appends events with `XADD` and dead letters to a second stream.
///
/// Entries are approximately trimmed to `max_len` when set.
#[derive(Clone)]
pub struct RedisStream {
    conn: ConnectionManager,
    stream_key: String,
    dead_letter_key: String,
    max_len: Option<usize>,
}

impl RedisStream {
    pub fn new(conn: ConnectionManager, stream_key: impl Into<String>) -> Self {
        let stream_key = stream_key.into();
        Self {
            conn,
            dead_letter_key: format!("{stream_key}:dlq"),
            stream_key,
            max_len: None,
        }
    }

    /// Connect to `redis_url` and build a stream writer.
    pub async fn connect(redis_url: &str, stream_key: impl Into<String>) -> Result<Self, StreamError> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| StreamError::Unavailable(format!("invalid redis url: {e}")))?;
        let conn = ConnectionManager::new(client)
            .await
            .map_err(|e| StreamError::Unavailable(e.to_string()))?;
        Ok(Self::new(conn, stream_key))
    }

    pub fn with_dead_letter_key(mut self, key: impl Into<String>) -> Self {
        self.dead_letter_key = key.into();
        self
    }

    pub fn with_max_len(mut self, max_len: usize) -> Self {
        self.max_len = Some(max_len);
        self
    }

    async fn xadd(&self, key: &str, fields: &[(&str, String)]) -> Result<String, StreamError> {
        let mut cmd = redis::cmd("XADD");
        cmd.arg(key);
        if let Some(max_len) = self.max_len {
            cmd.arg("MAXLEN").arg("~").arg(max_len);
        }
        cmd.arg("*");
        for (field, value) in fields {
            cmd.arg(*field).arg(value);
        }

        let mut conn = self.conn.clone();
        cmd.query_async(&mut conn)
            .await
            .map_err(|e| StreamError::Unavailable(e.to_string()))
    }
}

#[async_trait]
impl EventStream for RedisStream {
    async fn append(&self, entry: &StreamEntry) -> Result<String, StreamError> {
        let payload = serde_json::to_string(&entry.payload)
            .map_err(|e| StreamError::Serialization(e.to_string()))?;

        let fields = [
            ("event_id", entry.event_id.to_string()),
            ("org_id", entry.org_id.to_string()),
            ("event_type", entry.event_type.clone()),
            ("aggregate_type", entry.aggregate_type.clone()),
            ("aggregate_id", entry.aggregate_id.clone()),
            ("occurred_at", entry.occurred_at.to_rfc3339()),
            ("payload", payload),
        ];
        self.xadd(&self.stream_key, &fields).await
    }
}

#[async_trait]
impl DeadLetterSink for RedisStream {
    async fn dead_letter(&self, letter: &DeadLetter) -> Result<(), StreamError> {
        let payload = serde_json::to_string(&letter.event.payload)
            .map_err(|e| StreamError::Serialization(e.to_string()))?;

        let fields = [
            ("event_id", letter.event.id.to_string()),
            ("org_id", letter.event.org_id.to_string()),
            ("event_type", letter.event.event_type.clone()),
            ("payload", payload),
            ("error", letter.error.clone()),
            ("attempts", letter.attempts.to_string()),
            ("failed_at", letter.failed_at.to_rfc3339()),
        ];
        self.xadd(&self.dead_letter_key, &fields).await?;
        Ok(())
    }
}
