//! Fixed-window rate limiting.

mod in_memory;
mod limiter;
#[cfg(feature = "redis")]
mod redis;

pub use in_memory::InMemoryRateLimiter;
pub use limiter::{RateLimitDecision, RateLimiter, DEFAULT_SCOPE};
#[cfg(feature = "redis")]
pub use self::redis::RedisRateLimiter;
