//! Error types shared by every component of the relay.

use uuid::Uuid;

/// Error returned by stream and dead-letter adapters.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StreamError {
    /// The stream could not be reached.
    #[error("stream unavailable: {0}")]
    Unavailable(String),
    /// The stream refused the entry.
    #[error("stream rejected entry: {0}")]
    Rejected(String),
    /// The entry could not be encoded for the stream.
    #[error("stream serialization failed: {0}")]
    Serialization(String),
}

/// Crate-wide error.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    /// A lock is held or an idempotent request is already in progress.
    /// Callers decide whether to retry; primitives never retry on their own.
    #[error("conflict: {0}")]
    Conflict(String),

    #[error("event with dedupe key '{dedupe_key}' already enqueued for org {org_id}")]
    DuplicateEvent { org_id: Uuid, dedupe_key: String },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid request: {0}")]
    Validation(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error(transparent)]
    Stream(#[from] StreamError),

    #[error("http error: {0}")]
    Http(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("invalid configuration {var}: {reason}")]
    ConfigInvalid { var: String, reason: String },
}

impl RelayError {
    /// Shorthand used by in-memory stores when a mutex was poisoned.
    pub(crate) fn poisoned(what: &str) -> Self {
        RelayError::Storage(format!("{what} lock poisoned"))
    }

    /// Whether the error is the conflict kind surfaced by locks and idempotency keys.
    pub fn is_conflict(&self) -> bool {
        matches!(self, RelayError::Conflict(_))
    }

    /// Transient errors are worth retrying later; everything else is permanent.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            RelayError::Storage(_) | RelayError::Stream(_) | RelayError::Http(_)
        )
    }
}

impl From<reqwest::Error> for RelayError {
    fn from(err: reqwest::Error) -> Self {
        RelayError::Http(err.to_string())
    }
}

#[cfg(feature = "postgres")]
impl From<sqlx::Error> for RelayError {
    fn from(err: sqlx::Error) -> Self {
        RelayError::Storage(err.to_string())
    }
}

#[cfg(feature = "redis")]
impl From<redis::RedisError> for RelayError {
    fn from(err: redis::RedisError) -> Self {
        RelayError::Storage(err.to_string())
    }
}

pub type Result<T, E = RelayError> = std::result::Result<T, E>;
