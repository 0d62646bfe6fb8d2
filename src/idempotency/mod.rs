//! Deduplication of retried client requests.
//!
//! A request carrying a client key is recorded as a placeholder before its
//! work runs. A concurrent duplicate loses the insert race and gets a
//! conflict; a later duplicate gets the stored response replayed.

mod in_memory;
#[cfg(feature = "postgres")]
mod postgres;
mod record;
mod service;
mod store;

pub use in_memory::InMemoryIdempotencyStore;
#[cfg(feature = "postgres")]
pub use postgres::PgIdempotencyStore;
pub use record::{request_hash, IdempotencyRecord, StoredResponse, DEFAULT_TTL};
pub use service::{Idempotency, IdempotencyDecision};
pub use store::IdempotencyStore;
