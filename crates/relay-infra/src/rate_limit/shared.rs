//! Sliding-log rate limiter backed by a store shared between instances.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use relay_core::{ConsumptionResult, LimiterSettings, RateLimitError, RateLimiter};

use super::store::{LogSnapshot, SlidingLogStore, StoreError};

/// Default deadline for a single store round-trip.
pub const DEFAULT_STORE_TIMEOUT: Duration = Duration::from_secs(2);

/// What `consume` and `get_state` report when the store cannot answer.
///
/// `FailOpen` admits the request uncharged: a store outage must not turn
/// into an outage of the service behind the limiter. `FailClosed` rejects
/// instead, reporting `current = 0` since nothing could be counted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StoreFailurePolicy {
    #[default]
    FailOpen,
    FailClosed,
}

/// Rate limiter counting requests in a sliding log held by a [`SlidingLogStore`].
///
/// Counts are never cached locally; every call goes to the store so that all
/// instances sharing it see the same totals.
pub struct SharedRateLimiter<S: ?Sized> {
    settings: LimiterSettings,
    store: Arc<S>,
    timeout: Duration,
    policy: StoreFailurePolicy,
}

impl<S: SlidingLogStore + ?Sized> SharedRateLimiter<S> {
    pub fn new(settings: LimiterSettings, store: Arc<S>) -> Self {
        Self {
            settings,
            store,
            timeout: DEFAULT_STORE_TIMEOUT,
            policy: StoreFailurePolicy::default(),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_failure_policy(mut self, policy: StoreFailurePolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Whether the store answers within the operation deadline.
    pub async fn health_check(&self) -> bool {
        match self.bounded(self.store.ping()).await {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(error = %e, "Rate limit store health check failed");
                false
            }
        }
    }

    fn window_ms(&self) -> i64 {
        i64::try_from(self.settings.window.as_millis()).unwrap_or(i64::MAX)
    }

    async fn bounded<T>(
        &self,
        op: impl Future<Output = Result<T, StoreError>>,
    ) -> Result<T, StoreError> {
        tokio::time::timeout(self.timeout, op)
            .await
            .map_err(|_| StoreError::Timeout(self.timeout))?
    }

    fn result_from(&self, snapshot: LogSnapshot, now_ms: i64) -> ConsumptionResult {
        let window_ms = self.window_ms();
        // The window frees a slot when its oldest entry ages out.
        let reset_ms = snapshot
            .oldest_ms
            .map(|oldest| {
                oldest
                    .saturating_add(window_ms)
                    .saturating_sub(now_ms)
                    .clamp(0, window_ms)
            })
            .unwrap_or(window_ms);

        ConsumptionResult::charged(
            snapshot.count,
            self.settings.limit(),
            Duration::from_millis(reset_ms.unsigned_abs()),
        )
    }

    fn on_store_failure(
        &self,
        operation: &'static str,
        key: &str,
        err: StoreError,
    ) -> ConsumptionResult {
        let limit = self.settings.limit();
        match self.policy {
            StoreFailurePolicy::FailOpen => {
                tracing::warn!(
                    operation,
                    key = %key,
                    error = %err,
                    "Rate limit store unavailable, failing open"
                );
                ConsumptionResult::uncharged(limit, self.settings.window)
            }
            StoreFailurePolicy::FailClosed => {
                tracing::error!(
                    operation,
                    key = %key,
                    error = %err,
                    "Rate limit store unavailable, failing closed"
                );
                ConsumptionResult {
                    allowed: false,
                    current: 0,
                    limit,
                    remaining: 0,
                    reset_after: self.settings.window,
                }
            }
        }
    }
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[async_trait]
impl<S: SlidingLogStore + ?Sized + 'static> RateLimiter for SharedRateLimiter<S> {
    async fn consume(&self, key: &str) -> Result<ConsumptionResult, RateLimitError> {
        if self.settings.should_skip(key).await {
            return Ok(ConsumptionResult::uncharged(
                self.settings.limit(),
                self.settings.window,
            ));
        }

        let store_key = self.settings.namespaced_key(key);
        let now = now_ms();

        match self
            .bounded(self.store.record(&store_key, now, self.window_ms()))
            .await
        {
            Ok(snapshot) => Ok(self.result_from(snapshot, now)),
            Err(e) => Ok(self.on_store_failure("consume", key, e)),
        }
    }

    async fn get_state(&self, key: &str) -> Result<ConsumptionResult, RateLimitError> {
        if self.settings.should_skip(key).await {
            return Ok(ConsumptionResult::uncharged(
                self.settings.limit(),
                self.settings.window,
            ));
        }

        let store_key = self.settings.namespaced_key(key);
        let now = now_ms();

        match self
            .bounded(self.store.inspect(&store_key, now, self.window_ms()))
            .await
        {
            Ok(snapshot) => Ok(self.result_from(snapshot, now)),
            Err(e) => Ok(self.on_store_failure("get_state", key, e)),
        }
    }

    async fn reset(&self, key: &str) -> Result<(), RateLimitError> {
        let store_key = self.settings.namespaced_key(key);
        self.bounded(self.store.clear(&store_key)).await.map_err(|e| {
            tracing::warn!(key = %key, error = %e, "Failed to reset rate limit");
            RateLimitError::from(e)
        })
    }

    async fn close(&self) -> Result<(), RateLimitError> {
        self.store.close().await?;
        tracing::debug!("Shared rate limiter closed");
        Ok(())
    }
}
