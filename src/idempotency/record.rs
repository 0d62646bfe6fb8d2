use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::clock::add;

/// Default lifetime of a stored request (24 hours).
pub const DEFAULT_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// A client request keyed by `(org_id, key, endpoint)`.
///
/// Created as a placeholder (no response) before the work runs and filled in
/// afterwards. Expired records are treated as absent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdempotencyRecord {
    pub org_id: Uuid,
    pub key: String,
    pub endpoint: String,
    /// Hex SHA-256 of the request body.
    pub request_hash: String,
    pub response_status: Option<u16>,
    pub response_content_type: Option<String>,
    pub response_body: Option<Vec<u8>>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl IdempotencyRecord {
    pub fn placeholder(
        org_id: Uuid,
        key: impl Into<String>,
        endpoint: impl Into<String>,
        request_hash: impl Into<String>,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> Self {
        Self {
            org_id,
            key: key.into(),
            endpoint: endpoint.into(),
            request_hash: request_hash.into(),
            response_status: None,
            response_content_type: None,
            response_body: None,
            created_at: now,
            expires_at: add(now, ttl),
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    /// The stored response, once the original request has completed.
    pub fn response(&self) -> Option<StoredResponse> {
        let status = self.response_status?;
        Some(StoredResponse {
            status,
            content_type: self.response_content_type.clone(),
            body: self.response_body.clone().unwrap_or_default(),
        })
    }
}

/// Response replayed for a repeated request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredResponse {
    pub status: u16,
    /// `Content-Type` of the original response, if it had one.
    pub content_type: Option<String>,
    pub body: Vec<u8>,
}

impl StoredResponse {
    pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
        Self {
            status,
            content_type: None,
            body: body.into(),
        }
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }
}

/// Hex SHA-256 of a request body.
pub fn request_hash(body: &[u8]) -> String {
    hex::encode(Sha256::digest(body))
}
