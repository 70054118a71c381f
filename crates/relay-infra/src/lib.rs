//! # Relay Infrastructure
//!
//! Concrete implementations of the rate limiter port defined in `relay-core`.
//!
//! ## Feature Flags
//!
//! - `full` (default) - All features enabled
//! - `minimal` - No external dependencies, local limiter only
//! - `redis` - Redis-backed sliding log for limits shared across instances

pub mod rate_limit;

pub use rate_limit::{
    InMemoryRateLimiter, InMemorySlidingLogStore, RateLimitBackend, RateLimitConfig, RedisConfig,
    SharedRateLimiter, SlidingLogStore, StoreFailurePolicy, build_rate_limiter, parse_flag,
};

#[cfg(feature = "redis")]
pub use rate_limit::RedisSlidingLogStore;
