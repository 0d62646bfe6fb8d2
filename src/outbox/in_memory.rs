use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::log::EventLog;
use super::record::{NewEvent, OutboxEvent};
use crate::clock::{Clock, SystemClock};
use crate::error::{RelayError, Result};

/// In-memory event log.
///
/// Every operation runs inside one mutex critical section, which gives the
/// same guarantees the relational backend gets from `FOR UPDATE SKIP LOCKED`:
/// concurrent claimants never see the same row. Clones share storage.
#[derive(Clone)]
pub struct InMemoryEventLog {
    rows: Arc<Mutex<HashMap<Uuid, OutboxEvent>>>,
    clock: Arc<dyn Clock>,
}

impl Default for InMemoryEventLog {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryEventLog {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            rows: Arc::new(Mutex::new(HashMap::new())),
            clock,
        }
    }

    /// All rows, oldest first.
    pub fn events(&self) -> Vec<OutboxEvent> {
        let mut events: Vec<_> = self
            .rows
            .lock()
            .map(|rows| rows.values().cloned().collect())
            .unwrap_or_default();
        events.sort_by_key(|e| e.created_at);
        events
    }

    pub fn pending(&self) -> Vec<OutboxEvent> {
        self.events().into_iter().filter(|e| e.is_pending()).collect()
    }

    pub fn len(&self) -> usize {
        self.rows.lock().map(|rows| rows.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl EventLog for InMemoryEventLog {
    async fn enqueue(&self, event: NewEvent) -> Result<OutboxEvent> {
        let now = self.clock.now();
        let mut rows = self.rows.lock().map_err(|_| RelayError::poisoned("event log"))?;

        let duplicate = rows.values().any(|row| {
            row.org_id == event.org_id
                && row.aggregate_type == event.aggregate_type
                && row.aggregate_id == event.aggregate_id
                && row.dedupe_key == event.dedupe_key
        });
        if duplicate {
            return Err(RelayError::DuplicateEvent {
                org_id: event.org_id,
                dedupe_key: event.dedupe_key,
            });
        }

        let row = OutboxEvent::pending(event, now);
        rows.insert(row.id, row.clone());
        Ok(row)
    }

    async fn claim(&self, worker_id: &str, limit: usize) -> Result<Vec<OutboxEvent>> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        let now = self.clock.now();
        let mut rows = self.rows.lock().map_err(|_| RelayError::poisoned("event log"))?;

        let mut due: Vec<&mut OutboxEvent> =
            rows.values_mut().filter(|row| row.is_claimable(now)).collect();
        due.sort_by_key(|row| (row.next_attempt_at, row.created_at));

        let claimed = due
            .into_iter()
            .take(limit)
            .map(|row| {
                row.locked_by = Some(worker_id.to_string());
                row.locked_at = Some(now);
                row.clone()
            })
            .collect();

        Ok(claimed)
    }

    async fn mark_processed(&self, id: Uuid, at: DateTime<Utc>) -> Result<()> {
        let mut rows = self.rows.lock().map_err(|_| RelayError::poisoned("event log"))?;
        let row = rows
            .get_mut(&id)
            .ok_or_else(|| RelayError::NotFound(format!("event {id}")))?;

        if row.processed_at.is_none() {
            row.processed_at = Some(at);
        }
        row.locked_by = None;
        row.locked_at = None;
        Ok(())
    }

    async fn mark_failed(&self, id: Uuid, attempt: u32, last_error: &str, at: DateTime<Utc>) -> Result<()> {
        let mut rows = self.rows.lock().map_err(|_| RelayError::poisoned("event log"))?;
        let row = rows
            .get_mut(&id)
            .ok_or_else(|| RelayError::NotFound(format!("event {id}")))?;

        if row.is_processed() {
            return Ok(());
        }
        row.attempt_count = attempt;
        row.last_error = Some(last_error.to_string());
        row.processed_at = Some(at);
        row.locked_by = None;
        row.locked_at = None;
        Ok(())
    }

    async fn schedule_retry(
        &self,
        id: Uuid,
        attempt: u32,
        next_attempt_at: DateTime<Utc>,
        last_error: &str,
    ) -> Result<()> {
        let mut rows = self.rows.lock().map_err(|_| RelayError::poisoned("event log"))?;
        let row = rows
            .get_mut(&id)
            .ok_or_else(|| RelayError::NotFound(format!("event {id}")))?;

        if row.is_processed() {
            return Ok(());
        }
        row.attempt_count = attempt;
        row.next_attempt_at = next_attempt_at;
        row.last_error = Some(last_error.to_string());
        row.locked_by = None;
        row.locked_at = None;
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<OutboxEvent>> {
        let rows = self.rows.lock().map_err(|_| RelayError::poisoned("event log"))?;
        Ok(rows.get(&id).cloned())
    }

    async fn release_stale_claims(&self, locked_before: DateTime<Utc>) -> Result<u64> {
        let mut rows = self.rows.lock().map_err(|_| RelayError::poisoned("event log"))?;
        let mut released = 0;
        for row in rows.values_mut() {
            let stale = row.is_pending() && row.locked_at.is_some_and(|at| at < locked_before);
            if stale {
                row.locked_by = None;
                row.locked_at = None;
                released += 1;
            }
        }
        Ok(released)
    }
}
