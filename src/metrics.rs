//! Injected counters.
//!
//! Components take an `Arc<dyn Metrics>` instead of touching a global
//! registry, so tests can assert on emitted counts.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Counter names emitted by the relay.
pub mod names {
    pub const EVENTS_CLAIMED: &str = "outbox.events.claimed";
    pub const EVENTS_PUBLISHED: &str = "outbox.events.published";
    pub const EVENTS_RETRIED: &str = "outbox.events.retried";
    pub const EVENTS_DEAD_LETTERED: &str = "outbox.events.dead_lettered";
    pub const STALE_CLAIMS_RELEASED: &str = "outbox.claims.released";
    pub const DELIVERIES_CREATED: &str = "webhook.deliveries.created";
    pub const DELIVERIES_CLAIMED: &str = "webhook.deliveries.claimed";
    pub const DELIVERIES_SUCCEEDED: &str = "webhook.deliveries.succeeded";
    pub const DELIVERIES_RETRIED: &str = "webhook.deliveries.retried";
    pub const DELIVERIES_FAILED: &str = "webhook.deliveries.failed";
}

pub trait Metrics: Send + Sync {
    fn incr(&self, name: &'static str, by: u64);
}

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl Metrics for NoopMetrics {
    fn incr(&self, _name: &'static str, _by: u64) {}
}

/// Keeps counters in memory. Clones share the same counters.
#[derive(Debug, Default, Clone)]
pub struct InMemoryMetrics {
    counters: Arc<Mutex<HashMap<&'static str, u64>>>,
}

impl InMemoryMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current value of a counter (zero if never incremented).
    pub fn get(&self, name: &str) -> u64 {
        self.counters
            .lock()
            .map(|c| c.get(name).copied().unwrap_or(0))
            .unwrap_or(0)
    }

    pub fn snapshot(&self) -> HashMap<&'static str, u64> {
        self.counters.lock().map(|c| c.clone()).unwrap_or_default()
    }
}

impl Metrics for InMemoryMetrics {
    fn incr(&self, name: &'static str, by: u64) {
        if by == 0 {
            return;
        }
        if let Ok(mut counters) = self.counters.lock() {
            *counters.entry(name).or_insert(0) += by;
        }
    }
}
