//! In-memory fixed-window rate limiter.

use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use relay_core::{ConsumptionResult, LimiterSettings, RateLimitError, RateLimiter};

/// Default period of the background sweep.
pub const DEFAULT_CLEANUP_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy)]
struct WindowRecord {
    count: u64,
    window_start: Instant,
}

impl WindowRecord {
    fn is_expired(&self, now: Instant, window: Duration) -> bool {
        now.duration_since(self.window_start) >= window
    }
}

type Records = DashMap<String, WindowRecord>;

/// In-memory rate limiter using fixed windows per key.
///
/// A window opens on the first request for a key and closes `window` later;
/// the next request after that opens a fresh window with a count of one.
/// Two adjacent windows can therefore admit up to `2 * max_requests` requests
/// around the boundary.
///
/// Note: Limits are per-process, not distributed across instances.
pub struct InMemoryRateLimiter {
    settings: LimiterSettings,
    records: Arc<Records>,
    cleanup: Mutex<Option<JoinHandle<()>>>,
}

impl InMemoryRateLimiter {
    pub fn new(settings: LimiterSettings) -> Self {
        Self::with_cleanup_interval(settings, DEFAULT_CLEANUP_INTERVAL)
    }

    /// Must be called from within a Tokio runtime for the sweep to run.
    pub fn with_cleanup_interval(settings: LimiterSettings, cleanup_interval: Duration) -> Self {
        let records = Arc::new(Records::new());
        let cleanup = spawn_cleanup(Arc::downgrade(&records), settings.window, cleanup_interval);

        Self {
            settings,
            records,
            cleanup: Mutex::new(cleanup),
        }
    }

    /// Number of keys currently holding a window.
    pub fn tracked_keys(&self) -> usize {
        self.records.len()
    }

    /// Drop every window that has fully elapsed. Returns how many were dropped.
    pub fn evict_expired(&self) -> usize {
        evict_expired(&self.records, self.settings.window, Instant::now())
    }

    fn result_for(&self, record: WindowRecord, now: Instant) -> ConsumptionResult {
        let reset_after = (record.window_start + self.settings.window).saturating_duration_since(now);
        ConsumptionResult::charged(record.count, self.settings.limit(), reset_after)
    }
}

fn evict_expired(records: &Records, window: Duration, now: Instant) -> usize {
    let before = records.len();
    records.retain(|_, record| !record.is_expired(now, window));
    before.saturating_sub(records.len())
}

fn spawn_cleanup(
    records: Weak<Records>,
    window: Duration,
    interval: Duration,
) -> Option<JoinHandle<()>> {
    let handle = match tokio::runtime::Handle::try_current() {
        Ok(handle) => handle,
        Err(_) => {
            tracing::warn!("No Tokio runtime available, expired rate limit windows will not be swept");
            return None;
        }
    };

    Some(handle.spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately.
        ticker.tick().await;

        loop {
            ticker.tick().await;
            let Some(live) = records.upgrade() else {
                break;
            };
            let evicted = evict_expired(&live, window, Instant::now());
            if evicted > 0 {
                tracing::debug!(evicted, remaining = live.len(), "Swept expired rate limit windows");
            }
        }
    }))
}

#[async_trait]
impl RateLimiter for InMemoryRateLimiter {
    async fn consume(&self, key: &str) -> Result<ConsumptionResult, RateLimitError> {
        if self.settings.should_skip(key).await {
            return Ok(ConsumptionResult::uncharged(
                self.settings.limit(),
                self.settings.window,
            ));
        }

        let window = self.settings.window;
        let now = Instant::now();

        // The entry guard locks the shard, so read-modify-write is atomic per key.
        let record = {
            let mut entry = self
                .records
                .entry(self.settings.namespaced_key(key))
                .or_insert(WindowRecord {
                    count: 0,
                    window_start: now,
                });

            if entry.is_expired(now, window) {
                *entry = WindowRecord {
                    count: 1,
                    window_start: now,
                };
            } else {
                entry.count += 1;
            }
            *entry
        };

        Ok(self.result_for(record, now))
    }

    async fn get_state(&self, key: &str) -> Result<ConsumptionResult, RateLimitError> {
        if self.settings.should_skip(key).await {
            return Ok(ConsumptionResult::uncharged(
                self.settings.limit(),
                self.settings.window,
            ));
        }

        let now = Instant::now();
        let record = self
            .records
            .get(&self.settings.namespaced_key(key))
            .map(|entry| *entry)
            .filter(|record| !record.is_expired(now, self.settings.window));

        Ok(match record {
            Some(record) => self.result_for(record, now),
            None => ConsumptionResult::charged(0, self.settings.limit(), self.settings.window),
        })
    }

    async fn reset(&self, key: &str) -> Result<(), RateLimitError> {
        self.records.remove(&self.settings.namespaced_key(key));
        Ok(())
    }

    async fn close(&self) -> Result<(), RateLimitError> {
        if let Some(handle) = self.cleanup.lock().await.take() {
            handle.abort();
        }
        self.records.clear();
        tracing::debug!("In-memory rate limiter closed");
        Ok(())
    }
}

impl Drop for InMemoryRateLimiter {
    fn drop(&mut self) {
        if let Some(handle) = self.cleanup.get_mut().take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_core::domain::skip_keys;

    fn limiter(max_requests: u32, window_ms: u64) -> InMemoryRateLimiter {
        InMemoryRateLimiter::new(LimiterSettings::new(
            max_requests,
            Duration::from_millis(window_ms),
        ))
    }

    #[tokio::test(start_paused = true)]
    async fn test_counts_up_to_limit_then_rejects() {
        let limiter = limiter(3, 1000);

        for (expected_current, expected_remaining) in [(1, 2), (2, 1), (3, 0)] {
            let res = limiter.consume("u1").await.unwrap();
            assert!(res.allowed);
            assert_eq!(res.current, expected_current);
            assert_eq!(res.remaining, expected_remaining);
            assert_eq!(res.limit, 3);
        }

        let res = limiter.consume("u1").await.unwrap();
        assert!(!res.allowed);
        assert_eq!(res.current, 4);
        assert_eq!(res.remaining, 0);

        // Wait for the window to close
        tokio::time::sleep(Duration::from_millis(1100)).await;

        let res = limiter.consume("u1").await.unwrap();
        assert!(res.allowed);
        assert_eq!(res.current, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejected_requests_are_still_charged() {
        let limiter = limiter(1, 1000);
        limiter.consume("u1").await.unwrap();

        for expected in 2..=5 {
            let res = limiter.consume("u1").await.unwrap();
            assert!(!res.allowed);
            assert_eq!(res.current, expected);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_after_tracks_window_start() {
        let limiter = limiter(5, 1000);
        let res = limiter.consume("u1").await.unwrap();
        assert_eq!(res.reset_after, Duration::from_millis(1000));

        tokio::time::advance(Duration::from_millis(400)).await;
        let res = limiter.consume("u1").await.unwrap();
        assert_eq!(res.reset_after, Duration::from_millis(600));
    }

    #[tokio::test(start_paused = true)]
    async fn test_get_state_does_not_mutate() {
        let limiter = limiter(3, 1000);
        limiter.consume("u1").await.unwrap();
        limiter.consume("u1").await.unwrap();

        for _ in 0..5 {
            let state = limiter.get_state("u1").await.unwrap();
            assert_eq!(state.current, 2);
            assert_eq!(state.remaining, 1);
            assert!(state.allowed);
        }

        let fresh = limiter.get_state("nobody").await.unwrap();
        assert_eq!(fresh.current, 0);
        assert_eq!(fresh.remaining, 3);
        assert_eq!(limiter.tracked_keys(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_only_affects_one_key() {
        let limiter = limiter(3, 1000);
        for _ in 0..3 {
            limiter.consume("u1").await.unwrap();
            limiter.consume("u2").await.unwrap();
        }

        limiter.reset("u1").await.unwrap();

        let res = limiter.consume("u1").await.unwrap();
        assert_eq!(res.current, 1);
        let res = limiter.get_state("u2").await.unwrap();
        assert_eq!(res.current, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_skipped_keys_are_never_charged() {
        let settings = LimiterSettings::new(1, Duration::from_secs(1))
            .with_skip(skip_keys(["user:admin"]));
        let limiter = InMemoryRateLimiter::new(settings);

        for _ in 0..50 {
            let res = limiter.consume("user:admin").await.unwrap();
            assert!(res.allowed);
            assert_eq!(res.current, 0);
            assert_eq!(res.remaining, 1);
        }
        assert_eq!(limiter.tracked_keys(), 0);

        assert!(limiter.consume("user:1").await.unwrap().allowed);
        assert!(!limiter.consume("user:1").await.unwrap().allowed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fixed_window_allows_boundary_burst() {
        let limiter = limiter(2, 1000);
        limiter.consume("u1").await.unwrap();

        tokio::time::advance(Duration::from_millis(900)).await;
        assert!(limiter.consume("u1").await.unwrap().allowed);

        tokio::time::advance(Duration::from_millis(100)).await;
        // New window: the saturated one is forgotten entirely
        let res = limiter.consume("u1").await.unwrap();
        assert!(res.allowed);
        assert_eq!(res.current, 1);
        assert!(limiter.consume("u1").await.unwrap().allowed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_background_sweep_evicts_expired_windows() {
        let limiter = InMemoryRateLimiter::with_cleanup_interval(
            LimiterSettings::new(10, Duration::from_millis(500)),
            Duration::from_secs(1),
        );
        for i in 0..20 {
            limiter.consume(&format!("ip:10.0.0.{i}")).await.unwrap();
        }
        assert_eq!(limiter.tracked_keys(), 20);

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(limiter.tracked_keys(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_manual_eviction_keeps_live_windows() {
        let limiter = limiter(10, 1000);
        limiter.consume("old").await.unwrap();
        tokio::time::advance(Duration::from_millis(1000)).await;
        limiter.consume("new").await.unwrap();

        assert_eq!(limiter.evict_expired(), 1);
        assert_eq!(limiter.tracked_keys(), 1);
    }

    #[tokio::test]
    async fn test_close_clears_state() {
        let limiter = limiter(3, 1000);
        limiter.consume("u1").await.unwrap();
        limiter.close().await.unwrap();
        assert_eq!(limiter.tracked_keys(), 0);
        assert!(limiter.cleanup.lock().await.is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_consumers_never_over_admit() {
        let limiter = Arc::new(limiter(50, 60_000));

        let tasks: Vec<_> = (0..200)
            .map(|_| {
                let limiter = limiter.clone();
                tokio::spawn(async move { limiter.consume("shared").await.unwrap().allowed })
            })
            .collect();

        let mut admitted = 0;
        for task in tasks {
            if task.await.unwrap() {
                admitted += 1;
            }
        }

        assert_eq!(admitted, 50);
        assert_eq!(limiter.get_state("shared").await.unwrap().current, 200);
    }
}
