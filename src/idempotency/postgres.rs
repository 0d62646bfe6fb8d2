//! PostgreSQL idempotency store. Requires the `postgres` feature.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

use super::record::{IdempotencyRecord, StoredResponse};
use super::store::IdempotencyStore;
use crate::error::{RelayError, Result};

#[derive(Debug, FromRow)]
struct IdempotencyRow {
    org_id: Uuid,
    idem_key: String,
    endpoint: String,
    request_hash: String,
    response_status: Option<i32>,
    response_content_type: Option<String>,
    response_body: Option<Vec<u8>>,
    created_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
}

impl From<IdempotencyRow> for IdempotencyRecord {
    fn from(row: IdempotencyRow) -> Self {
        IdempotencyRecord {
            org_id: row.org_id,
            key: row.idem_key,
            endpoint: row.endpoint,
            request_hash: row.request_hash,
            response_status: row.response_status.and_then(|s| u16::try_from(s).ok()),
            response_content_type: row.response_content_type,
            response_body: row.response_body,
            created_at: row.created_at,
            expires_at: row.expires_at,
        }
    }
}

/// `idempotency_records`, unique on `(org_id, idem_key, endpoint)`.
#[derive(Clone)]
pub struct PgIdempotencyStore {
    pool: PgPool,
}

impl PgIdempotencyStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl IdempotencyStore for PgIdempotencyStore {
    async fn get(&self, org_id: Uuid, key: &str, endpoint: &str) -> Result<Option<IdempotencyRecord>> {
        let row: Option<IdempotencyRow> = sqlx::query_as(
            r"
            SELECT org_id, idem_key, endpoint, request_hash, response_status, response_content_type,
                   response_body,
                   created_at, expires_at
            FROM idempotency_records
            WHERE org_id = $1 AND idem_key = $2 AND endpoint = $3 AND expires_at > NOW()
            ",
        )
        .bind(org_id)
        .bind(key)
        .bind(endpoint)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Into::into))
    }

    async fn create_placeholder(&self, record: &IdempotencyRecord) -> Result<()> {
        // Only an expired row may be overwritten; a live one leaves the
        // statement with nothing to do.
        let result = sqlx::query(
            r"
            INSERT INTO idempotency_records
                (org_id, idem_key, endpoint, request_hash, created_at, expires_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (org_id, idem_key, endpoint) DO UPDATE
            SET request_hash = EXCLUDED.request_hash,
                response_status = NULL,
                response_content_type = NULL,
                response_body = NULL,
                created_at = EXCLUDED.created_at,
                expires_at = EXCLUDED.expires_at
            WHERE idempotency_records.expires_at <= EXCLUDED.created_at
            ",
        )
        .bind(record.org_id)
        .bind(&record.key)
        .bind(&record.endpoint)
        .bind(&record.request_hash)
        .bind(record.created_at)
        .bind(record.expires_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(RelayError::Conflict(format!(
                "idempotency key '{}' already used for {}",
                record.key, record.endpoint
            )));
        }
        Ok(())
    }

    async fn update_response(
        &self,
        org_id: Uuid,
        key: &str,
        endpoint: &str,
        response: &StoredResponse,
    ) -> Result<()> {
        let result = sqlx::query(
            r"
            UPDATE idempotency_records
            SET response_status = $4, response_content_type = $5, response_body = $6
            WHERE org_id = $1 AND idem_key = $2 AND endpoint = $3
            ",
        )
        .bind(org_id)
        .bind(key)
        .bind(endpoint)
        .bind(i32::from(response.status))
        .bind(response.content_type.as_deref())
        .bind(&response.body)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(RelayError::NotFound(format!("idempotency key '{key}'")));
        }
        Ok(())
    }

    async fn delete(&self, org_id: Uuid, key: &str, endpoint: &str) -> Result<bool> {
        let result = sqlx::query(
            "DELETE FROM idempotency_records WHERE org_id = $1 AND idem_key = $2 AND endpoint = $3",
        )
        .bind(org_id)
        .bind(key)
        .bind(endpoint)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM idempotency_records WHERE expires_at <= $1")
            .bind(now)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}
