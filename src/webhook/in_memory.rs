use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::delivery::{Delivery, DeliveryQueue, DeliveryResponse, DeliveryStatus};
use super::subscription::{Subscription, SubscriptionStore, WebhookPolicy};
use crate::error::{RelayError, Result};

#[derive(Default)]
struct State {
    subscriptions: HashMap<Uuid, Subscription>,
    deliveries: HashMap<Uuid, Delivery>,
    policies: HashMap<Uuid, u32>,
}

/// Subscriptions, deliveries and per-org policy held in memory.
///
/// One mutex guards all three maps; claims are therefore atomic and two
/// dispatchers never lease the same delivery. Clones share storage.
#[derive(Clone, Default)]
pub struct InMemoryWebhookStore {
    state: Arc<Mutex<State>>,
}

impl InMemoryWebhookStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Configure the attempt budget of an organization.
    pub fn set_max_attempts(&self, org_id: Uuid, max_attempts: u32) {
        if let Ok(mut state) = self.state.lock() {
            state.policies.insert(org_id, max_attempts);
        }
    }

    pub fn deliveries(&self) -> Vec<Delivery> {
        let mut deliveries: Vec<_> = self
            .state
            .lock()
            .map(|s| s.deliveries.values().cloned().collect())
            .unwrap_or_default();
        deliveries.sort_by_key(|d| d.created_at);
        deliveries
    }

    fn with_pending<F>(&self, id: Uuid, at: DateTime<Utc>, update: F) -> Result<()>
    where
        F: FnOnce(&mut Delivery),
    {
        let mut state = self.state.lock().map_err(|_| RelayError::poisoned("webhook store"))?;
        let delivery = state
            .deliveries
            .get_mut(&id)
            .ok_or_else(|| RelayError::NotFound(format!("delivery {id}")))?;

        if delivery.is_pending() {
            update(delivery);
            delivery.updated_at = at;
        }
        Ok(())
    }
}

#[async_trait]
impl SubscriptionStore for InMemoryWebhookStore {
    async fn create(&self, subscription: Subscription) -> Result<Subscription> {
        let mut state = self.state.lock().map_err(|_| RelayError::poisoned("webhook store"))?;
        if state.subscriptions.contains_key(&subscription.id) {
            return Err(RelayError::Conflict(format!("subscription {} exists", subscription.id)));
        }
        state.subscriptions.insert(subscription.id, subscription.clone());
        Ok(subscription)
    }

    async fn delete(&self, org_id: Uuid, id: Uuid) -> Result<bool> {
        let mut state = self.state.lock().map_err(|_| RelayError::poisoned("webhook store"))?;
        let owned = state.subscriptions.get(&id).is_some_and(|s| s.org_id == org_id);
        if owned {
            state.subscriptions.remove(&id);
        }
        Ok(owned)
    }

    async fn get(&self, id: Uuid) -> Result<Option<Subscription>> {
        let state = self.state.lock().map_err(|_| RelayError::poisoned("webhook store"))?;
        Ok(state.subscriptions.get(&id).cloned())
    }

    async fn find_matching(&self, org_id: Uuid, event_type: &str) -> Result<Vec<Subscription>> {
        let state = self.state.lock().map_err(|_| RelayError::poisoned("webhook store"))?;
        let mut matching: Vec<_> = state
            .subscriptions
            .values()
            .filter(|s| s.org_id == org_id && s.matches(event_type))
            .cloned()
            .collect();
        matching.sort_by_key(|s| s.created_at);
        Ok(matching)
    }
}

#[async_trait]
impl WebhookPolicy for InMemoryWebhookStore {
    async fn max_attempts(&self, org_id: Uuid) -> Result<Option<u32>> {
        let state = self.state.lock().map_err(|_| RelayError::poisoned("webhook store"))?;
        Ok(state.policies.get(&org_id).copied())
    }
}

#[async_trait]
impl DeliveryQueue for InMemoryWebhookStore {
    async fn create_pending(
        &self,
        org_id: Uuid,
        subscription_id: Uuid,
        event_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Option<Delivery>> {
        let mut state = self.state.lock().map_err(|_| RelayError::poisoned("webhook store"))?;
        let exists = state
            .deliveries
            .values()
            .any(|d| d.subscription_id == subscription_id && d.event_id == event_id);
        if exists {
            return Ok(None);
        }

        let delivery = Delivery::pending(org_id, subscription_id, event_id, now);
        state.deliveries.insert(delivery.id, delivery.clone());
        Ok(Some(delivery))
    }

    async fn claim_pending(
        &self,
        limit: usize,
        now: DateTime<Utc>,
        lock_until: DateTime<Utc>,
    ) -> Result<Vec<Delivery>> {
        let mut state = self.state.lock().map_err(|_| RelayError::poisoned("webhook store"))?;

        let mut due: Vec<&mut Delivery> =
            state.deliveries.values_mut().filter(|d| d.is_due(now)).collect();
        due.sort_by_key(|d| (d.next_attempt_at, d.created_at));

        let claimed = due
            .into_iter()
            .take(limit)
            .map(|d| {
                // Callers see the row as it was before the lease.
                let snapshot = d.clone();
                d.next_attempt_at = lock_until;
                d.updated_at = now;
                snapshot
            })
            .collect();
        Ok(claimed)
    }

    async fn mark_delivered(
        &self,
        id: Uuid,
        attempt_count: u32,
        response: &DeliveryResponse,
        at: DateTime<Utc>,
    ) -> Result<()> {
        self.with_pending(id, at, |d| {
            d.status = DeliveryStatus::Delivered;
            d.attempt_count = attempt_count;
            d.last_error = None;
            d.last_response_code = response.status_code;
            d.last_response_body = response.body.clone();
        })
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
        self.with_pending(id, at, |d| {
            d.attempt_count = attempt_count;
            d.next_attempt_at = next_attempt_at;
            d.last_error = Some(error.to_string());
            d.last_response_code = response.status_code;
            d.last_response_body = response.body.clone();
        })
    }

    async fn mark_failed(
        &self,
        id: Uuid,
        attempt_count: u32,
        error: &str,
        response: &DeliveryResponse,
        at: DateTime<Utc>,
    ) -> Result<()> {
        self.with_pending(id, at, |d| {
            d.status = DeliveryStatus::Failed;
            d.attempt_count = attempt_count;
            d.last_error = Some(error.to_string());
            d.last_response_code = response.status_code;
            d.last_response_body = response.body.clone();
        })
    }

    async fn get(&self, id: Uuid) -> Result<Option<Delivery>> {
        let state = self.state.lock().map_err(|_| RelayError::poisoned("webhook store"))?;
        Ok(state.deliveries.get(&id).cloned())
    }

    async fn list_for_event(&self, event_id: Uuid) -> Result<Vec<Delivery>> {
        let state = self.state.lock().map_err(|_| RelayError::poisoned("webhook store"))?;
        let mut deliveries: Vec<_> = state
            .deliveries
            .values()
            .filter(|d| d.event_id == event_id)
            .cloned()
            .collect();
        deliveries.sort_by_key(|d| d.created_at);
        Ok(deliveries)
    }
}
