use std::sync::Arc;

use chrono::{DateTime, Utc};

use super::delivery::DeliveryQueue;
use super::subscription::SubscriptionStore;
use crate::error::Result;
use crate::outbox::OutboxEvent;

/// Turns a published event into one pending delivery per matching subscription.
#[derive(Clone)]
pub struct WebhookFanout {
    subscriptions: Arc<dyn SubscriptionStore>,
    deliveries: Arc<dyn DeliveryQueue>,
}

impl WebhookFanout {
    pub fn new(subscriptions: Arc<dyn SubscriptionStore>, deliveries: Arc<dyn DeliveryQueue>) -> Self {
        Self { subscriptions, deliveries }
    }

    /// Returns the number of deliveries created.
    ///
    /// Subscriptions that already have a delivery for this event are skipped,
    /// so a republished event does not notify anyone twice.
    pub async fn fan_out(&self, event: &OutboxEvent, now: DateTime<Utc>) -> Result<usize> {
        let matching = self
            .subscriptions
            .find_matching(event.org_id, &event.event_type)
            .await?;

        if matching.is_empty() {
            tracing::debug!(
                target: "outbox_relay::webhook",
                event_id = %event.id,
                event_type = %event.event_type,
                "No subscriptions match event type"
            );
            return Ok(0);
        }

        let mut created = 0;
        for subscription in &matching {
            if self
                .deliveries
                .create_pending(event.org_id, subscription.id, event.id, now)
                .await?
                .is_some()
            {
                created += 1;
            }
        }

        tracing::debug!(
            target: "outbox_relay::webhook",
            event_id = %event.id,
            event_type = %event.event_type,
            subscriptions = matching.len(),
            created,
            "Fanned out event"
        );
        Ok(created)
    }
}
