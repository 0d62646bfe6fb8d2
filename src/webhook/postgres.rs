//! PostgreSQL subscriptions, deliveries and policies. Requires the `postgres` feature.

use std::collections::BTreeSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

use super::delivery::{Delivery, DeliveryQueue, DeliveryResponse};
use super::subscription::{Subscription, SubscriptionStore, WebhookPolicy};
use crate::error::{RelayError, Result};

const SUBSCRIPTION_COLUMNS: &str = "id, org_id, url, secret, event_types, created_at";

const DELIVERY_COLUMNS: &str = "id, org_id, subscription_id, event_id, attempt_count, \
     last_error, next_attempt_at, status, last_response_code, last_response_body, \
     created_at, updated_at";

#[derive(Debug, FromRow)]
struct SubscriptionRow {
    id: Uuid,
    org_id: Uuid,
    url: String,
    secret: String,
    event_types: Vec<String>,
    created_at: DateTime<Utc>,
}

impl From<SubscriptionRow> for Subscription {
    fn from(row: SubscriptionRow) -> Self {
        Subscription {
            id: row.id,
            org_id: row.org_id,
            url: row.url,
            secret: row.secret,
            event_types: row.event_types.into_iter().collect::<BTreeSet<_>>(),
            created_at: row.created_at,
        }
    }
}

#[derive(Debug, FromRow)]
struct DeliveryRow {
    id: Uuid,
    org_id: Uuid,
    subscription_id: Uuid,
    event_id: Uuid,
    attempt_count: i32,
    last_error: Option<String>,
    next_attempt_at: DateTime<Utc>,
    status: String,
    last_response_code: Option<i32>,
    last_response_body: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<DeliveryRow> for Delivery {
    type Error = RelayError;

    fn try_from(row: DeliveryRow) -> Result<Self> {
        Ok(Delivery {
            id: row.id,
            org_id: row.org_id,
            subscription_id: row.subscription_id,
            event_id: row.event_id,
            attempt_count: u32::try_from(row.attempt_count).unwrap_or(0),
            last_error: row.last_error,
            next_attempt_at: row.next_attempt_at,
            status: row.status.parse()?,
            last_response_code: row.last_response_code.and_then(|c| u16::try_from(c).ok()),
            last_response_body: row.last_response_body,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

fn to_i32(n: u32) -> i32 {
    i32::try_from(n).unwrap_or(i32::MAX)
}

/// Webhook tables: `webhook_subscriptions`, `webhook_deliveries`, `webhook_policies`.
#[derive(Clone)]
pub struct PgWebhookStore {
    pool: PgPool,
}

impl PgWebhookStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    #[allow(clippy::too_many_arguments)]
    async fn update_pending(
        &self,
        id: Uuid,
        sql: &str,
        attempt_count: u32,
        error: Option<&str>,
        next_attempt_at: Option<DateTime<Utc>>,
        response: &DeliveryResponse,
        at: DateTime<Utc>,
    ) -> Result<()> {
        let result = sqlx::query(sql)
            .bind(id)
            .bind(to_i32(attempt_count))
            .bind(error)
            .bind(next_attempt_at)
            .bind(response.status_code.map(i32::from))
            .bind(response.body.as_deref())
            .bind(at)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            let exists: Option<(Uuid,)> =
                sqlx::query_as("SELECT id FROM webhook_deliveries WHERE id = $1")
                    .bind(id)
                    .fetch_optional(&self.pool)
                    .await?;
            if exists.is_none() {
                return Err(RelayError::NotFound(format!("delivery {id}")));
            }
        }
        Ok(())
    }
}

#[async_trait]
impl SubscriptionStore for PgWebhookStore {
    async fn create(&self, subscription: Subscription) -> Result<Subscription> {
        let event_types: Vec<String> = subscription.event_types.iter().cloned().collect();
        let row: SubscriptionRow = sqlx::query_as(&format!(
            r"
            INSERT INTO webhook_subscriptions (id, org_id, url, secret, event_types, created_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING {SUBSCRIPTION_COLUMNS}
            "
        ))
        .bind(subscription.id)
        .bind(subscription.org_id)
        .bind(&subscription.url)
        .bind(&subscription.secret)
        .bind(&event_types)
        .bind(subscription.created_at)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| match e {
            sqlx::Error::Database(ref db) if db.is_unique_violation() => {
                RelayError::Conflict(format!("subscription {} exists", subscription.id))
            }
            other => RelayError::from(other),
        })?;
        Ok(row.into())
    }

    async fn delete(&self, org_id: Uuid, id: Uuid) -> Result<bool> {
        let result = sqlx::query("DELETE FROM webhook_subscriptions WHERE id = $1 AND org_id = $2")
            .bind(id)
            .bind(org_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn get(&self, id: Uuid) -> Result<Option<Subscription>> {
        let row: Option<SubscriptionRow> = sqlx::query_as(&format!(
            "SELECT {SUBSCRIPTION_COLUMNS} FROM webhook_subscriptions WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Into::into))
    }

    async fn find_matching(&self, org_id: Uuid, event_type: &str) -> Result<Vec<Subscription>> {
        let rows: Vec<SubscriptionRow> = sqlx::query_as(&format!(
            r"
            SELECT {SUBSCRIPTION_COLUMNS} FROM webhook_subscriptions
            WHERE org_id = $1 AND $2 = ANY(event_types)
            ORDER BY created_at
            "
        ))
        .bind(org_id)
        .bind(event_type)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }
}

#[async_trait]
impl WebhookPolicy for PgWebhookStore {
    async fn max_attempts(&self, org_id: Uuid) -> Result<Option<u32>> {
        let row: Option<(i32,)> =
            sqlx::query_as("SELECT max_attempts FROM webhook_policies WHERE org_id = $1")
                .bind(org_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.and_then(|(n,)| u32::try_from(n).ok()))
    }
}

#[async_trait]
impl DeliveryQueue for PgWebhookStore {
    async fn create_pending(
        &self,
        org_id: Uuid,
        subscription_id: Uuid,
        event_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Option<Delivery>> {
        let row: Option<DeliveryRow> = sqlx::query_as(&format!(
            r"
            INSERT INTO webhook_deliveries
                (id, org_id, subscription_id, event_id, attempt_count, next_attempt_at,
                 status, created_at, updated_at)
            VALUES ($1, $2, $3, $4, 0, $5, 'pending', $5, $5)
            ON CONFLICT (subscription_id, event_id) DO NOTHING
            RETURNING {DELIVERY_COLUMNS}
            "
        ))
        .bind(Uuid::new_v4())
        .bind(org_id)
        .bind(subscription_id)
        .bind(event_id)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;
        row.map(Delivery::try_from).transpose()
    }

    async fn claim_pending(
        &self,
        limit: usize,
        now: DateTime<Utc>,
        lock_until: DateTime<Utc>,
    ) -> Result<Vec<Delivery>> {
        // The CTE returns the pre-lease values so callers see the row as it was.
        let rows: Vec<DeliveryRow> = sqlx::query_as(&format!(
            r"
            WITH due AS (
                SELECT {DELIVERY_COLUMNS} FROM webhook_deliveries
                WHERE status = 'pending' AND next_attempt_at <= $1
                ORDER BY next_attempt_at, created_at
                LIMIT $3
                FOR UPDATE SKIP LOCKED
            ), leased AS (
                UPDATE webhook_deliveries d
                SET next_attempt_at = $2, updated_at = $1
                FROM due
                WHERE d.id = due.id
            )
            SELECT {DELIVERY_COLUMNS} FROM due
            ORDER BY next_attempt_at, created_at
            "
        ))
        .bind(now)
        .bind(lock_until)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Delivery::try_from).collect()
    }

    async fn mark_delivered(
        &self,
        id: Uuid,
        attempt_count: u32,
        response: &DeliveryResponse,
        at: DateTime<Utc>,
    ) -> Result<()> {
        self.update_pending(
            id,
            r"
            UPDATE webhook_deliveries
            SET status = 'delivered', attempt_count = $2, last_error = $3,
                next_attempt_at = COALESCE($4, next_attempt_at),
                last_response_code = $5, last_response_body = $6, updated_at = $7
            WHERE id = $1 AND status = 'pending'
            ",
            attempt_count,
            None,
            None,
            response,
            at,
        )
        .await
    }

    async fn schedule_retry(
        &self,
        id: Uuid,
        attempt_count: u32,
        next_attempt_at: DateTime<Utc>,
        error: &str,
        response: &DeliveryResponse,
        at: DateTime<Utc>,
    ) -> Result<()> {
        self.update_pending(
            id,
            r"
            UPDATE webhook_deliveries
            SET attempt_count = $2, last_error = $3,
                next_attempt_at = COALESCE($4, next_attempt_at),
                last_response_code = $5, last_response_body = $6, updated_at = $7
            WHERE id = $1 AND status = 'pending'
            ",
            attempt_count,
            Some(error),
            Some(next_attempt_at),
            response,
            at,
        )
        .await
    }

    async fn mark_failed(
        &self,
        id: Uuid,
        attempt_count: u32,
        error: &str,
        response: &DeliveryResponse,
        at: DateTime<Utc>,
    ) -> Result<()> {
        self.update_pending(
            id,
            r"
            UPDATE webhook_deliveries
            SET status = 'failed', attempt_count = $2, last_error = $3,
                next_attempt_at = COALESCE($4, next_attempt_at),
                last_response_code = $5, last_response_body = $6, updated_at = $7
            WHERE id = $1 AND status = 'pending'
            ",
            attempt_count,
            Some(error),
            None,
            response,
            at,
        )
        .await
    }

    async fn get(&self, id: Uuid) -> Result<Option<Delivery>> {
        let row: Option<DeliveryRow> = sqlx::query_as(&format!(
            "SELECT {DELIVERY_COLUMNS} FROM webhook_deliveries WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(Delivery::try_from).transpose()
    }

    async fn list_for_event(&self, event_id: Uuid) -> Result<Vec<Delivery>> {
        let rows: Vec<DeliveryRow> = sqlx::query_as(&format!(
            "SELECT {DELIVERY_COLUMNS} FROM webhook_deliveries WHERE event_id = $1 ORDER BY created_at"
        ))
        .bind(event_id)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(Delivery::try_from).collect()
    }
}
