//! The external durable log the publisher appends to, and the dead-letter
//! destination for events that exhausted their attempts.
//!
//! ```text
//!  EventLog ──claim──▶ EventPublisher ──append──▶ EventStream
//!                            │
//!                            └── attempts exhausted ──▶ DeadLetterSink
//! ```
//!
//! - [`InMemoryStream`] / [`InMemoryDeadLetters`]: single-process
//! - `RedisStream`: `XADD` into a redis stream (`redis` feature)

mod in_memory;
#[cfg(feature = "redis")]
mod redis;
mod sink;

pub use in_memory::{InMemoryDeadLetters, InMemoryStream};
#[cfg(feature = "redis")]
pub use self::redis::RedisStream;
pub use sink::{DeadLetter, DeadLetterSink, EventStream, StreamEntry};
