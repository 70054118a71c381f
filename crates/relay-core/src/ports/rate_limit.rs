//! Rate limiting port.

use std::time::Duration;

use async_trait::async_trait;

use crate::error::RateLimitError;

/// Rate limiter trait - abstraction over rate limiting backends.
///
/// Every backend follows the same counting contract:
/// a skipped key is admitted without being charged, every other call to
/// [`consume`](RateLimiter::consume) is charged even when it is rejected,
/// and [`get_state`](RateLimiter::get_state) never mutates.
#[async_trait]
pub trait RateLimiter: Send + Sync {
    /// Charge one request to `key` and report the resulting window state.
    async fn consume(&self, key: &str) -> Result<ConsumptionResult, RateLimitError>;

    /// Report the window state for `key` without charging it.
    async fn get_state(&self, key: &str) -> Result<ConsumptionResult, RateLimitError>;

    /// Forget everything recorded for `key`.
    async fn reset(&self, key: &str) -> Result<(), RateLimitError>;

    /// Release background tasks and connections.
    async fn close(&self) -> Result<(), RateLimitError>;
}

/// Result of a rate limit check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConsumptionResult {
    pub allowed: bool,
    pub current: u64,
    pub limit: u64,
    pub remaining: u64,
    pub reset_after: Duration,
}

impl ConsumptionResult {
    /// Derive `allowed` and `remaining` from a count.
    pub fn charged(current: u64, limit: u64, reset_after: Duration) -> Self {
        Self {
            allowed: current <= limit,
            current,
            limit,
            remaining: limit.saturating_sub(current),
            reset_after,
        }
    }

    /// Admitted without touching any counter (skipped key or failed-open store).
    pub fn uncharged(limit: u64, reset_after: Duration) -> Self {
        Self {
            allowed: true,
            current: 0,
            limit,
            remaining: limit,
            reset_after,
        }
    }

    /// Whole seconds until the window frees up, rounded up.
    pub fn retry_after_secs(&self) -> u64 {
        let millis = self.reset_after.as_millis();
        u64::try_from(millis.div_ceil(1000)).unwrap_or(u64::MAX)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_charged_within_limit() {
        let result = ConsumptionResult::charged(3, 3, Duration::from_secs(1));
        assert!(result.allowed);
        assert_eq!(result.remaining, 0);
    }

    #[test]
    fn test_charged_over_limit() {
        let result = ConsumptionResult::charged(4, 3, Duration::from_secs(1));
        assert!(!result.allowed);
        assert_eq!(result.current, 4);
        assert_eq!(result.remaining, 0);
    }

    #[test]
    fn test_retry_after_rounds_up() {
        let result = ConsumptionResult::charged(4, 3, Duration::from_millis(1001));
        assert_eq!(result.retry_after_secs(), 2);

        let result = ConsumptionResult::charged(4, 3, Duration::from_millis(1000));
        assert_eq!(result.retry_after_secs(), 1);
    }
}
