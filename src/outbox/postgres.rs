//! PostgreSQL event log. Requires the `postgres` feature.
//!
//! Table layout lives in `migrations/0001_event_delivery.sql`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgExecutor, PgPool};
use uuid::Uuid;

use super::log::EventLog;
use super::record::{NewEvent, OutboxEvent};
use crate::error::{RelayError, Result};

const COLUMNS: &str = "id, org_id, aggregate_type, aggregate_id, event_type, payload, \
     dedupe_key, attempt_count, last_error, next_attempt_at, locked_by, locked_at, \
     created_at, processed_at";

#[derive(Debug, FromRow)]
struct OutboxRow {
    id: Uuid,
    org_id: Uuid,
    aggregate_type: String,
    aggregate_id: String,
    event_type: String,
    payload: serde_json::Value,
    dedupe_key: String,
    attempt_count: i32,
    last_error: Option<String>,
    next_attempt_at: DateTime<Utc>,
    locked_by: Option<String>,
    locked_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    processed_at: Option<DateTime<Utc>>,
}

impl From<OutboxRow> for OutboxEvent {
    fn from(row: OutboxRow) -> Self {
        OutboxEvent {
            id: row.id,
            org_id: row.org_id,
            aggregate_type: row.aggregate_type,
            aggregate_id: row.aggregate_id,
            event_type: row.event_type,
            payload: row.payload,
            dedupe_key: row.dedupe_key,
            attempt_count: u32::try_from(row.attempt_count).unwrap_or(0),
            last_error: row.last_error,
            next_attempt_at: row.next_attempt_at,
            locked_by: row.locked_by,
            locked_at: row.locked_at,
            created_at: row.created_at,
            processed_at: row.processed_at,
        }
    }
}

/// Event log stored in the `outbox_events` table.
#[derive(Clone)]
pub struct PgEventLog {
    pool: PgPool,
}

impl PgEventLog {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Enqueue on any executor, typically the caller's open transaction:
    ///
    /// ```ignore
    /// let mut tx = pool.begin().await?;
    /// sqlx::query("UPDATE tasks SET status = 'done' WHERE id = $1")
    ///     .bind(task_id)
    ///     .execute(&mut *tx)
    ///     .await?;
    /// PgEventLog::enqueue_with(&mut *tx, event).await?;
    /// tx.commit().await?;
    /// ```
    pub async fn enqueue_with<'e, E>(executor: E, event: NewEvent) -> Result<OutboxEvent>
    where
        E: PgExecutor<'e>,
    {
        let org_id = event.org_id;
        let dedupe_key = event.dedupe_key.clone();

        let row: OutboxRow = sqlx::query_as(&format!(
            r"
            INSERT INTO outbox_events
                (id, org_id, aggregate_type, aggregate_id, event_type, payload, dedupe_key,
                 attempt_count, next_attempt_at, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, 0, now(), now())
            RETURNING {COLUMNS}
            "
        ))
        .bind(Uuid::new_v4())
        .bind(event.org_id)
        .bind(&event.aggregate_type)
        .bind(&event.aggregate_id)
        .bind(&event.event_type)
        .bind(&event.payload)
        .bind(&event.dedupe_key)
        .fetch_one(executor)
        .await
        .map_err(|e| match e {
            sqlx::Error::Database(ref db) if db.is_unique_violation() => {
                RelayError::DuplicateEvent { org_id, dedupe_key }
            }
            other => RelayError::from(other),
        })?;

        Ok(row.into())
    }
}

#[async_trait]
impl EventLog for PgEventLog {
    async fn enqueue(&self, event: NewEvent) -> Result<OutboxEvent> {
        Self::enqueue_with(&self.pool, event).await
    }

    async fn claim(&self, worker_id: &str, limit: usize) -> Result<Vec<OutboxEvent>> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows: Vec<OutboxRow> = sqlx::query_as(&format!(
            r"
            UPDATE outbox_events
            SET locked_by = $1, locked_at = now()
            WHERE id IN (
                SELECT id FROM outbox_events
                WHERE processed_at IS NULL
                  AND locked_by IS NULL
                  AND next_attempt_at <= now()
                ORDER BY next_attempt_at, created_at
                LIMIT $2
                FOR UPDATE SKIP LOCKED
            )
            RETURNING {COLUMNS}
            "
        ))
        .bind(worker_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        let mut events: Vec<OutboxEvent> = rows.into_iter().map(Into::into).collect();
        events.sort_by_key(|e| (e.next_attempt_at, e.created_at));
        Ok(events)
    }

    async fn mark_processed(&self, id: Uuid, at: DateTime<Utc>) -> Result<()> {
        let result = sqlx::query(
            r"
            UPDATE outbox_events
            SET processed_at = COALESCE(processed_at, $2),
                locked_by = NULL,
                locked_at = NULL
            WHERE id = $1
            ",
        )
        .bind(id)
        .bind(at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(RelayError::NotFound(format!("event {id}")));
        }
        Ok(())
    }

    async fn mark_failed(&self, id: Uuid, attempt: u32, last_error: &str, at: DateTime<Utc>) -> Result<()> {
        let result = sqlx::query(
            r"
            UPDATE outbox_events
            SET attempt_count = CASE WHEN processed_at IS NULL THEN $2 ELSE attempt_count END,
                last_error = CASE WHEN processed_at IS NULL THEN $3 ELSE last_error END,
                processed_at = COALESCE(processed_at, $4),
                locked_by = NULL,
                locked_at = NULL
            WHERE id = $1
            ",
        )
        .bind(id)
        .bind(i32::try_from(attempt).unwrap_or(i32::MAX))
        .bind(last_error)
        .bind(at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(RelayError::NotFound(format!("event {id}")));
        }
        Ok(())
    }

    async fn schedule_retry(
        &self,
        id: Uuid,
        attempt: u32,
        next_attempt_at: DateTime<Utc>,
        last_error: &str,
    ) -> Result<()> {
        sqlx::query(
            r"
            UPDATE outbox_events
            SET attempt_count = $2,
                next_attempt_at = $3,
                last_error = $4,
                locked_by = NULL,
                locked_at = NULL
            WHERE id = $1 AND processed_at IS NULL
            ",
        )
        .bind(id)
        .bind(i32::try_from(attempt).unwrap_or(i32::MAX))
        .bind(next_attempt_at)
        .bind(last_error)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<OutboxEvent>> {
        let row: Option<OutboxRow> =
            sqlx::query_as(&format!("SELECT {COLUMNS} FROM outbox_events WHERE id = $1"))
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(Into::into))
    }

    async fn release_stale_claims(&self, locked_before: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            r"
            UPDATE outbox_events
            SET locked_by = NULL, locked_at = NULL
            WHERE processed_at IS NULL
              AND locked_at IS NOT NULL
              AND locked_at < $1
            ",
        )
        .bind(locked_before)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}
