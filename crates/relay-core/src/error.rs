//! Rate limiting error types.

use std::time::Duration;

use thiserror::Error;

/// Failures a limiter can report.
///
/// Throttling itself is not an error: a rejected request is an ordinary
/// [`ConsumptionResult`](crate::ports::ConsumptionResult) with `allowed == false`.
#[derive(Debug, Error)]
pub enum RateLimitError {
    #[error("Rate limit store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Rate limit store timed out after {0:?}")]
    Timeout(Duration),

    #[error("Invalid rate limit configuration: {0}")]
    Configuration(String),

    #[error("Rate limiter internal error: {0}")]
    Internal(String),
}
