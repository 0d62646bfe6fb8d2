//! Webhook delivery execution.
//!
//! The dispatcher leases due deliveries one at a time, POSTs a signed JSON
//! envelope to the subscriber and records the outcome. A lease is just a pushed-out
//! `next_attempt_at`, so a dispatcher that crashes mid-request leaves rows
//! that become due again once the lease runs out.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::header::{CONTENT_TYPE, RETRY_AFTER};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::delivery::{Delivery, DeliveryQueue, DeliveryResponse};
use super::signature::{self, DELIVERY_ID_HEADER, EVENT_TYPE_HEADER, SIGNATURE_HEADER, TIMESTAMP_HEADER};
use super::subscription::{Subscription, SubscriptionStore, WebhookPolicy};
use crate::backoff::{backoff, parse_retry_after};
use crate::clock::{add, Clock, SystemClock};
use crate::config::DispatcherConfig;
use crate::error::{RelayError, Result};
use crate::metrics::{names, Metrics, NoopMetrics};
use crate::outbox::{EventLog, OutboxEvent};
use crate::worker::PollingJob;

/// JSON body POSTed to subscribers.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WebhookEnvelope {
    pub event_type: String,
    pub event_id: Uuid,
    pub org_id: Uuid,
    pub data: serde_json::Value,
}

impl From<&OutboxEvent> for WebhookEnvelope {
    fn from(event: &OutboxEvent) -> Self {
        Self {
            event_type: event.event_type.clone(),
            event_id: event.id,
            org_id: event.org_id,
            data: event.payload.clone(),
        }
    }
}

/// What happened to one delivery.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Delivered { status_code: u16 },
    Retrying { attempt: u32, next_attempt_at: DateTime<Utc> },
    Failed { attempt: u32, error: String },
}

/// Counts from one dispatcher tick.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DispatchResult {
    pub claimed: usize,
    pub delivered: usize,
    pub retried: usize,
    pub failed: usize,
    /// Deliveries whose outcome could not be recorded; they become due again
    /// when their lease expires.
    pub errors: usize,
}

pub struct WebhookDispatcher {
    client: Client,
    subscriptions: Arc<dyn SubscriptionStore>,
    deliveries: Arc<dyn DeliveryQueue>,
    events: Arc<dyn EventLog>,
    policy: Option<Arc<dyn WebhookPolicy>>,
    clock: Arc<dyn Clock>,
    metrics: Arc<dyn Metrics>,
    config: DispatcherConfig,
}

impl WebhookDispatcher {
    /// Create a dispatcher with a shared HTTP client and default settings.
    ///
    /// # Errors
    ///
    /// Returns `RelayError::Http` if the HTTP client cannot be built.
    pub fn new(
        subscriptions: Arc<dyn SubscriptionStore>,
        deliveries: Arc<dyn DeliveryQueue>,
        events: Arc<dyn EventLog>,
    ) -> Result<Self> {
        let client = Client::builder()
            .user_agent(concat!("outbox-relay/", env!("CARGO_PKG_VERSION")))
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| RelayError::Http(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            subscriptions,
            deliveries,
            events,
            policy: None,
            clock: Arc::new(SystemClock),
            metrics: Arc::new(NoopMetrics),
            config: DispatcherConfig::default(),
        })
    }

    pub fn with_client(mut self, client: Client) -> Self {
        self.client = client;
        self
    }

    /// Per-organization attempt budget. Organizations without a configured
    /// budget get `DispatcherConfig::default_max_attempts`.
    pub fn with_policy(mut self, policy: Arc<dyn WebhookPolicy>) -> Self {
        self.policy = Some(policy);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn Metrics>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn with_config(mut self, config: DispatcherConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.config.batch_size = size;
        self
    }

    /// How long a claimed delivery stays invisible to other dispatchers.
    pub fn with_lease(mut self, lease: Duration) -> Self {
        self.config.lease = lease;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.config.request_timeout = timeout;
        self
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    /// Make up to `batch_size` delivery attempts on due deliveries.
    ///
    /// Deliveries are leased one at a time, right before their request, so
    /// every lease outlives the request it covers no matter how slow earlier
    /// subscribers in the same tick were.
    ///
    /// # Errors
    ///
    /// Returns `RelayError::Validation` if the lease is not longer than the
    /// request timeout, and store errors from claiming.
    #[tracing::instrument(skip(self), target = "outbox_relay::webhook")]
    pub async fn tick(&self) -> Result<DispatchResult> {
        if self.config.lease <= self.config.request_timeout {
            return Err(RelayError::Validation(format!(
                "dispatcher lease ({:?}) must be longer than the request timeout ({:?})",
                self.config.lease, self.config.request_timeout
            )));
        }

        let mut result = DispatchResult::default();
        while result.claimed < self.config.batch_size {
            let now = self.clock.now();
            let lock_until = add(now, self.config.lease);
            let Some(delivery) = self
                .deliveries
                .claim_pending(1, now, lock_until)
                .await?
                .into_iter()
                .next()
            else {
                break;
            };
            result.claimed += 1;
            self.metrics.incr(names::DELIVERIES_CLAIMED, 1);

            match self.deliver(&delivery).await {
                Ok(DeliveryOutcome::Delivered { .. }) => result.delivered += 1,
                Ok(DeliveryOutcome::Retrying { .. }) => result.retried += 1,
                Ok(DeliveryOutcome::Failed { .. }) => result.failed += 1,
                Err(e) => {
                    result.errors += 1;
                    tracing::error!(
                        target: "outbox_relay::webhook",
                        delivery_id = %delivery.id,
                        error = %e,
                        "Failed to record delivery outcome"
                    );
                }
            }
        }

        if result.claimed > 0 {
            tracing::debug!(
                target: "outbox_relay::webhook",
                claimed = result.claimed,
                delivered = result.delivered,
                retried = result.retried,
                failed = result.failed,
                "Dispatched webhook deliveries"
            );
        }
        Ok(result)
    }

    /// Attempt one claimed delivery and record the outcome.
    pub async fn deliver(&self, delivery: &Delivery) -> Result<DeliveryOutcome> {
        let subscription = self.subscriptions.get(delivery.subscription_id).await?;
        let event = self.events.get(delivery.event_id).await?;

        let (subscription, event) = match (subscription, event) {
            (Some(subscription), Some(event)) => (subscription, event),
            (None, _) => return self.fail_unresolvable(delivery, "subscription not found").await,
            (_, None) => return self.fail_unresolvable(delivery, "event not found").await,
        };

        let attempt = delivery.attempt_count.saturating_add(1);
        let (response, error, retry_after) = self.post(delivery, &subscription, &event).await?;
        let finished_at = self.clock.now();

        let Some(error) = error else {
            self.deliveries
                .mark_delivered(delivery.id, attempt, &response, finished_at)
                .await?;
            self.metrics.incr(names::DELIVERIES_SUCCEEDED, 1);
            tracing::info!(
                target: "outbox_relay::webhook",
                delivery_id = %delivery.id,
                subscription_id = %subscription.id,
                event_id = %event.id,
                attempt,
                "Webhook delivered"
            );
            return Ok(DeliveryOutcome::Delivered {
                status_code: response.status_code.unwrap_or_default(),
            });
        };

        let max_attempts = self.max_attempts(delivery.org_id).await?;

        if attempt >= max_attempts {
            self.deliveries
                .mark_failed(delivery.id, attempt, &error, &response, finished_at)
                .await?;
            self.metrics.incr(names::DELIVERIES_FAILED, 1);
            tracing::warn!(
                target: "outbox_relay::webhook",
                delivery_id = %delivery.id,
                subscription_id = %subscription.id,
                attempt,
                max_attempts,
                error = %error,
                "Webhook delivery failed permanently"
            );
            return Ok(DeliveryOutcome::Failed { attempt, error });
        }

        let delay = retry_after.unwrap_or_else(|| backoff(attempt));
        let next_attempt_at = add(finished_at, delay);
        self.deliveries
            .schedule_retry(delivery.id, attempt, next_attempt_at, &error, &response, finished_at)
            .await?;
        self.metrics.incr(names::DELIVERIES_RETRIED, 1);
        tracing::warn!(
            target: "outbox_relay::webhook",
            delivery_id = %delivery.id,
            subscription_id = %subscription.id,
            attempt,
            retry_in_secs = delay.as_secs(),
            error = %error,
            "Webhook delivery failed, will retry"
        );
        Ok(DeliveryOutcome::Retrying { attempt, next_attempt_at })
    }

    /// POST the signed envelope.
    ///
    /// Returns the response data, the error (if the attempt failed) and the
    /// delay the receiver asked for via `Retry-After`.
    async fn post(
        &self,
        delivery: &Delivery,
        subscription: &Subscription,
        event: &OutboxEvent,
    ) -> Result<(DeliveryResponse, Option<String>, Option<Duration>)> {
        let body = serde_json::to_vec(&WebhookEnvelope::from(event))?;
        let timestamp = signature::timestamp(self.clock.now());
        let signature = signature::signature_header(&subscription.secret, &timestamp, &body);

        let result = self
            .client
            .post(&subscription.url)
            .timeout(self.config.request_timeout)
            .header(CONTENT_TYPE, "application/json")
            .header(TIMESTAMP_HEADER, &timestamp)
            .header(SIGNATURE_HEADER, signature)
            .header(EVENT_TYPE_HEADER, &event.event_type)
            .header(DELIVERY_ID_HEADER, delivery.id.to_string())
            .body(body)
            .send()
            .await;

        let response = match result {
            Ok(response) => response,
            Err(e) => {
                let error = if e.is_timeout() {
                    format!("request timed out after {}s", self.config.request_timeout.as_secs())
                } else if e.is_connect() {
                    format!("connection failed: {e}")
                } else {
                    format!("request error: {e}")
                };
                return Ok((DeliveryResponse::none(), Some(error), None));
            }
        };

        let status = response.status();
        let retry_after = response
            .headers()
            .get(RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| parse_retry_after(v, self.clock.now()));
        let body: String = response
            .text()
            .await
            .unwrap_or_default()
            .chars()
            .take(self.config.response_body_limit)
            .collect();

        let recorded = DeliveryResponse {
            status_code: Some(status.as_u16()),
            body: Some(body),
        };
        if status.is_success() {
            Ok((recorded, None, None))
        } else {
            Ok((recorded, Some(format!("HTTP {}", status.as_u16())), retry_after))
        }
    }

    async fn max_attempts(&self, org_id: Uuid) -> Result<u32> {
        let configured = match &self.policy {
            Some(policy) => policy.max_attempts(org_id).await?,
            None => None,
        };
        Ok(configured.unwrap_or(self.config.default_max_attempts))
    }

    async fn fail_unresolvable(&self, delivery: &Delivery, reason: &str) -> Result<DeliveryOutcome> {
        self.deliveries
            .mark_failed(
                delivery.id,
                delivery.attempt_count,
                reason,
                &DeliveryResponse::none(),
                self.clock.now(),
            )
            .await?;
        self.metrics.incr(names::DELIVERIES_FAILED, 1);
        tracing::warn!(
            target: "outbox_relay::webhook",
            delivery_id = %delivery.id,
            subscription_id = %delivery.subscription_id,
            event_id = %delivery.event_id,
            reason,
            "Webhook delivery cannot be resolved"
        );
        Ok(DeliveryOutcome::Failed {
            attempt: delivery.attempt_count,
            error: reason.to_string(),
        })
    }
}

#[async_trait]
impl PollingJob for WebhookDispatcher {
    fn name(&self) -> &str {
        "webhook-dispatcher"
    }

    async fn poll(&self) -> Result<usize> {
        let result = self.tick().await?;
        Ok(result.claimed)
    }
}
