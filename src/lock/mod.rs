//! Distributed locks for short critical sections.
//!
//! - [`DistributedLock`]: acquire / conditional release
//! - [`InMemoryLock`]: single-process backend with clock-driven expiry
//! - `RedisLock`: `SET NX PX` plus a check-and-delete script (`redis` feature)

mod in_memory;
#[allow(clippy::module_inception)]
mod lock;
#[cfg(feature = "redis")]
mod redis;

pub use in_memory::InMemoryLock;
pub use lock::{with_lock, DistributedLock, HeldLock};
#[cfg(feature = "redis")]
pub use self::redis::RedisLock;
