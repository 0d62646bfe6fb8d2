use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::record::{IdempotencyRecord, StoredResponse};
use super::store::IdempotencyStore;
use crate::clock::{Clock, SystemClock};
use crate::error::{RelayError, Result};

type RecordKey = (Uuid, String, String);

fn record_key(org_id: Uuid, key: &str, endpoint: &str) -> RecordKey {
    (org_id, key.to_string(), endpoint.to_string())
}

/// Idempotency records held in memory. Clones share storage.
#[derive(Clone)]
pub struct InMemoryIdempotencyStore {
    records: Arc<Mutex<HashMap<RecordKey, IdempotencyRecord>>>,
    clock: Arc<dyn Clock>,
}

impl InMemoryIdempotencyStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            records: Arc::new(Mutex::new(HashMap::new())),
            clock,
        }
    }

    pub fn len(&self) -> usize {
        self.records.lock().map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for InMemoryIdempotencyStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl IdempotencyStore for InMemoryIdempotencyStore {
    async fn get(&self, org_id: Uuid, key: &str, endpoint: &str) -> Result<Option<IdempotencyRecord>> {
        let now = self.clock.now();
        let records = self.records.lock().map_err(|_| RelayError::poisoned("idempotency store"))?;
        Ok(records
            .get(&record_key(org_id, key, endpoint))
            .filter(|r| !r.is_expired(now))
            .cloned())
    }

    async fn create_placeholder(&self, record: &IdempotencyRecord) -> Result<()> {
        let now = self.clock.now();
        let mut records = self.records.lock().map_err(|_| RelayError::poisoned("idempotency store"))?;
        let k = record_key(record.org_id, &record.key, &record.endpoint);

        if records.get(&k).is_some_and(|r| !r.is_expired(now)) {
            return Err(RelayError::Conflict(format!(
                "idempotency key '{}' already used for {}",
                record.key, record.endpoint
            )));
        }
        records.insert(k, record.clone());
        Ok(())
    }

    async fn update_response(
        &self,
        org_id: Uuid,
        key: &str,
        endpoint: &str,
        response: &StoredResponse,
    ) -> Result<()> {
        let mut records = self.records.lock().map_err(|_| RelayError::poisoned("idempotency store"))?;
        let record = records
            .get_mut(&record_key(org_id, key, endpoint))
            .ok_or_else(|| RelayError::NotFound(format!("idempotency key '{key}'")))?;
        record.response_status = Some(response.status);
        record.response_content_type = response.content_type.clone();
        record.response_body = Some(response.body.clone());
        Ok(())
    }

    async fn delete(&self, org_id: Uuid, key: &str, endpoint: &str) -> Result<bool> {
        let mut records = self.records.lock().map_err(|_| RelayError::poisoned("idempotency store"))?;
        Ok(records.remove(&record_key(org_id, key, endpoint)).is_some())
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64> {
        let mut records = self.records.lock().map_err(|_| RelayError::poisoned("idempotency store"))?;
        let before = records.len();
        records.retain(|_, r| !r.is_expired(now));
        Ok((before - records.len()) as u64)
    }
}
