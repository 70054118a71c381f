//! Rate limiting implementations.

mod config;
mod memory;
mod selector;
mod shared;
mod store;

pub use config::{RateLimitBackend, RateLimitConfig, RedisConfig, parse_flag};
pub use memory::{DEFAULT_CLEANUP_INTERVAL, InMemoryRateLimiter};
pub use selector::build_rate_limiter;
pub use shared::{DEFAULT_STORE_TIMEOUT, SharedRateLimiter, StoreFailurePolicy};
pub use store::{InMemorySlidingLogStore, LogSnapshot, SlidingLogStore, StoreError};

#[cfg(feature = "redis")]
mod redis;
#[cfg(feature = "redis")]
pub use self::redis::RedisSlidingLogStore;
