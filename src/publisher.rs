//! Outbox publisher.
//!
//! Claims due events from an [`EventLog`], appends each to the
//! [`EventStream`], fans it out to webhook subscriptions and marks it
//! processed. Failed events are rescheduled with exponential backoff until
//! they run out of attempts, then dead-lettered.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::backoff::backoff;
use crate::clock::{add, sub, Clock, SystemClock};
use crate::config::PublisherConfig;
use crate::error::Result;
use crate::metrics::{names, Metrics, NoopMetrics};
use crate::outbox::{EventLog, OutboxEvent};
use crate::stream::{DeadLetter, DeadLetterSink, EventStream, StreamEntry};
use crate::webhook::WebhookFanout;
use crate::worker::PollingJob;

/// Result of one publisher tick.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DrainResult {
    pub claimed: usize,
    pub published: usize,
    pub retried: usize,
    pub dead_lettered: usize,
    /// Stale claims released before claiming.
    pub released: u64,
    /// Events whose outcome could not be written back to the log.
    pub errors: usize,
}

/// What happened to a single event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishOutcome {
    Published { stream_id: String },
    Retrying { attempt: u32, next_attempt_at: DateTime<Utc> },
    DeadLettered { attempts: u32 },
}

pub struct EventPublisher {
    log: Arc<dyn EventLog>,
    stream: Arc<dyn EventStream>,
    dead_letters: Arc<dyn DeadLetterSink>,
    fanout: Option<WebhookFanout>,
    clock: Arc<dyn Clock>,
    metrics: Arc<dyn Metrics>,
    config: PublisherConfig,
}

impl EventPublisher {
    pub fn new(
        log: Arc<dyn EventLog>,
        stream: Arc<dyn EventStream>,
        dead_letters: Arc<dyn DeadLetterSink>,
    ) -> Self {
        Self {
            log,
            stream,
            dead_letters,
            fanout: None,
            clock: Arc::new(SystemClock),
            metrics: Arc::new(NoopMetrics),
            config: PublisherConfig::default(),
        }
    }

    /// Set the worker ID written to claimed rows.
    pub fn with_worker_id(mut self, id: impl Into<String>) -> Self {
        self.config.worker_id = id.into();
        self
    }

    /// Set the batch size (max events claimed per tick).
    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.config.batch_size = size;
        self
    }

    /// Set the number of attempts before an event is dead-lettered.
    pub fn with_max_attempts(mut self, max: u32) -> Self {
        self.config.max_attempts = max;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.config.poll_interval = interval;
        self
    }

    /// Release claims older than `timeout` at the start of every tick.
    ///
    /// Off by default: a publisher that dies mid-batch leaves its claimed rows
    /// locked until an operator (or a publisher with this set) releases them.
    /// The timeout must exceed the longest expected batch, or live claims get
    /// released and their events published twice.
    pub fn with_stale_claim_timeout(mut self, timeout: Duration) -> Self {
        self.config.stale_claim_timeout = Some(timeout);
        self
    }

    pub fn with_config(mut self, config: PublisherConfig) -> Self {
        self.config = config;
        self
    }

    /// Create pending webhook deliveries for every published event.
    pub fn with_fanout(mut self, fanout: WebhookFanout) -> Self {
        self.fanout = Some(fanout);
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

    pub fn config(&self) -> &PublisherConfig {
        &self.config
    }

    /// Claim a batch and process every claimed event.
    #[tracing::instrument(skip(self), target = "outbox_relay::publisher", fields(worker_id = %self.config.worker_id))]
    pub async fn tick(&self) -> Result<DrainResult> {
        let mut result = DrainResult::default();

        if let Some(timeout) = self.config.stale_claim_timeout {
            let cutoff = sub(self.clock.now(), timeout);
            result.released = self.log.release_stale_claims(cutoff).await?;
            if result.released > 0 {
                self.metrics.incr(names::STALE_CLAIMS_RELEASED, result.released);
                tracing::warn!(
                    target: "outbox_relay::publisher",
                    released = result.released,
                    %cutoff,
                    "Released stale outbox claims"
                );
            }
        }

        let events = self
            .log
            .claim(&self.config.worker_id, self.config.batch_size)
            .await?;
        result.claimed = events.len();
        if events.is_empty() {
            return Ok(result);
        }
        self.metrics.incr(names::EVENTS_CLAIMED, events.len() as u64);

        for event in &events {
            match self.process_event(event).await {
                Ok(PublishOutcome::Published { .. }) => result.published += 1,
                Ok(PublishOutcome::Retrying { .. }) => result.retried += 1,
                Ok(PublishOutcome::DeadLettered { .. }) => result.dead_lettered += 1,
                Err(e) => {
                    // The row stays claimed; see `with_stale_claim_timeout`.
                    result.errors += 1;
                    tracing::error!(
                        target: "outbox_relay::publisher",
                        event_id = %event.id,
                        error = %e,
                        "Failed to record publish outcome"
                    );
                }
            }
        }

        tracing::debug!(
            target: "outbox_relay::publisher",
            claimed = result.claimed,
            published = result.published,
            retried = result.retried,
            dead_lettered = result.dead_lettered,
            "Drained outbox batch"
        );
        Ok(result)
    }

    /// Publish one claimed event and record the outcome in the log.
    pub async fn process_event(&self, event: &OutboxEvent) -> Result<PublishOutcome> {
        let error = match self.stream.append(&StreamEntry::from(event)).await {
            Ok(stream_id) => match self.fan_out(event).await {
                Ok(()) => {
                    self.log.mark_processed(event.id, self.clock.now()).await?;
                    self.metrics.incr(names::EVENTS_PUBLISHED, 1);
                    tracing::debug!(
                        target: "outbox_relay::publisher",
                        event_id = %event.id,
                        event_type = %event.event_type,
                        stream_id = %stream_id,
                        "Published event"
                    );
                    return Ok(PublishOutcome::Published { stream_id });
                }
                Err(e) => format!("webhook fan-out failed: {e}"),
            },
            Err(e) => e.to_string(),
        };

        let now = self.clock.now();
        let attempt = event.attempt_count.saturating_add(1);
        let next_attempt_at = add(now, backoff(attempt));

        if attempt < self.config.max_attempts {
            return self.retry(event, attempt, next_attempt_at, &error).await;
        }

        let letter = DeadLetter {
            event: event.clone(),
            error: error.clone(),
            attempts: attempt,
            failed_at: now,
        };
        if let Err(dlq_error) = self.dead_letters.dead_letter(&letter).await {
            // Never drop the event: keep retrying until the dead letter lands.
            let error = format!("{error}; dead-letter failed: {dlq_error}");
            return self.retry(event, attempt, next_attempt_at, &error).await;
        }

        self.log.mark_failed(event.id, attempt, &error, now).await?;
        self.metrics.incr(names::EVENTS_DEAD_LETTERED, 1);
        tracing::error!(
            target: "outbox_relay::publisher",
            event_id = %event.id,
            event_type = %event.event_type,
            attempts = attempt,
            error = %error,
            "Event dead-lettered"
        );
        Ok(PublishOutcome::DeadLettered { attempts: attempt })
    }

    async fn fan_out(&self, event: &OutboxEvent) -> Result<()> {
        if let Some(fanout) = &self.fanout {
            let created = fanout.fan_out(event, self.clock.now()).await?;
            if created > 0 {
                self.metrics.incr(names::DELIVERIES_CREATED, created as u64);
            }
        }
        Ok(())
    }

    async fn retry(
        &self,
        event: &OutboxEvent,
        attempt: u32,
        next_attempt_at: DateTime<Utc>,
        error: &str,
    ) -> Result<PublishOutcome> {
        self.log
            .schedule_retry(event.id, attempt, next_attempt_at, error)
            .await?;
        self.metrics.incr(names::EVENTS_RETRIED, 1);
        tracing::warn!(
            target: "outbox_relay::publisher",
            event_id = %event.id,
            event_type = %event.event_type,
            attempt,
            %next_attempt_at,
            error = %error,
            "Publish failed, will retry"
        );
        Ok(PublishOutcome::Retrying { attempt, next_attempt_at })
    }
}

#[async_trait]
impl PollingJob for EventPublisher {
    fn name(&self) -> &str {
        "event-publisher"
    }

    async fn poll(&self) -> Result<usize> {
        let result = self.tick().await?;
        Ok(result.claimed)
    }
}
