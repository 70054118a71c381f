//! # Relay Core
//!
//! The request-admission layer of the Relay gateway.
//! This crate holds the rate limiter contract shared by every backend and
//! has no infrastructure dependencies.

pub mod domain;
pub mod error;
pub mod ports;

pub use domain::{CallerKey, LimiterSettings, SkipPredicate};
pub use error::RateLimitError;
pub use ports::{ConsumptionResult, RateLimiter};
