//! Transactional outbox.
//!
//! A domain write and an [`EventLog::enqueue`] happen in the same
//! transaction; the publisher later claims due rows and forwards them.
//! Delivery is at-least-once: a row leaves the log only through
//! `mark_processed`, which the publisher calls after a successful append or
//! after dead-lettering.
//!
//! - [`InMemoryEventLog`]: single-process log
//! - `PgEventLog`: PostgreSQL log (`postgres` feature)

mod in_memory;
mod log;
#[cfg(feature = "postgres")]
mod postgres;
mod record;

pub use in_memory::InMemoryEventLog;
pub use log::EventLog;
#[cfg(feature = "postgres")]
pub use postgres::PgEventLog;
pub use record::{NewEvent, OutboxEvent};
