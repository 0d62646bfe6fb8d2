use std::collections::BTreeSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Result;

/// Delivery attempts allowed per delivery when an organization has no policy.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 10;

/// A webhook registration.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscription {
    pub id: Uuid,
    pub org_id: Uuid,
    pub url: String,
    /// Shared HMAC secret.
    #[serde(skip_serializing, default)]
    pub secret: String,
    pub event_types: BTreeSet<String>,
    pub created_at: DateTime<Utc>,
}

impl Subscription {
    pub fn new<I, S>(org_id: Uuid, url: impl Into<String>, secret: impl Into<String>, event_types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            id: Uuid::new_v4(),
            org_id,
            url: url.into(),
            secret: secret.into(),
            event_types: event_types.into_iter().map(Into::into).collect(),
            created_at: Utc::now(),
        }
    }

    pub fn matches(&self, event_type: &str) -> bool {
        self.event_types.contains(event_type)
    }
}

/// Subscription lookup. Domain services own the lifecycle; the relay only reads.
#[async_trait]
pub trait SubscriptionStore: Send + Sync {
    async fn create(&self, subscription: Subscription) -> Result<Subscription>;

    /// Returns whether a subscription was removed.
    async fn delete(&self, org_id: Uuid, id: Uuid) -> Result<bool>;

    async fn get(&self, id: Uuid) -> Result<Option<Subscription>>;

    /// Subscriptions of `org_id` whose event types include `event_type`.
    async fn find_matching(&self, org_id: Uuid, event_type: &str) -> Result<Vec<Subscription>>;
}

/// Per-organization delivery policy.
#[async_trait]
pub trait WebhookPolicy: Send + Sync {
    /// Configured attempt budget, if the organization has one.
    async fn max_attempts(&self, org_id: Uuid) -> Result<Option<u32>>;
}

/// A policy that gives every organization the same budget.
#[derive(Debug, Clone, Copy)]
pub struct FixedPolicy(pub u32);

impl Default for FixedPolicy {
    fn default() -> Self {
        FixedPolicy(DEFAULT_MAX_ATTEMPTS)
    }
}

#[async_trait]
impl WebhookPolicy for FixedPolicy {
    async fn max_attempts(&self, _org_id: Uuid) -> Result<Option<u32>> {
        Ok(Some(self.0))
    }
}
