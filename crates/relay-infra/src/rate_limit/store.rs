//! Sliding-log storage used by the shared rate limiter.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;

use relay_core::RateLimitError;

/// Per-key log state observed by a store operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogSnapshot {
    /// Entries inside the trailing window (including the one just recorded).
    pub count: u64,
    /// Timestamp (ms since the epoch) of the oldest entry still inside the window.
    pub oldest_ms: Option<i64>,
}

/// Sliding log store errors.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Operation failed: {0}")]
    Operation(String),

    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("Store is closed")]
    Closed,
}

impl From<StoreError> for RateLimitError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Timeout(after) => RateLimitError::Timeout(after),
            other => RateLimitError::StoreUnavailable(other.to_string()),
        }
    }
}

/// Storage for per-key ordered logs of request timestamps.
///
/// Implementations shared between service instances must execute
/// [`record`](SlidingLogStore::record) as one indivisible step: purge entries
/// at or before `now_ms - window_ms`, count, append `now_ms`, and refresh the
/// key's expiry to `window_ms`.
#[async_trait]
pub trait SlidingLogStore: Send + Sync {
    /// Append a request at `now_ms`; the snapshot count includes it.
    async fn record(
        &self,
        key: &str,
        now_ms: i64,
        window_ms: i64,
    ) -> Result<LogSnapshot, StoreError>;

    /// Count entries inside the window without modifying the log.
    async fn inspect(
        &self,
        key: &str,
        now_ms: i64,
        window_ms: i64,
    ) -> Result<LogSnapshot, StoreError>;

    /// Delete the whole log for `key`.
    async fn clear(&self, key: &str) -> Result<(), StoreError>;

    /// Round-trip health check.
    async fn ping(&self) -> Result<(), StoreError>;

    /// Release connections. Later operations fail with [`StoreError::Closed`].
    async fn close(&self) -> Result<(), StoreError>;
}

/// Process-local sliding log store.
///
/// All limiters holding the same instance observe one consistent count, which
/// makes it a stand-in for the external store in single-process deployments
/// and tests. Each key expires one window after its last record, and expired
/// keys are swept at most once per window. Outages and slow round-trips can be
/// simulated.
pub struct InMemorySlidingLogStore {
    table: Mutex<LogTable>,
    available: AtomicBool,
    closed: AtomicBool,
    latency: Option<Duration>,
}

#[derive(Default)]
struct LogTable {
    logs: HashMap<String, KeyLog>,
    next_sweep_ms: i64,
}

impl LogTable {
    fn sweep(&mut self, now_ms: i64, window_ms: i64) {
        if now_ms < self.next_sweep_ms {
            return;
        }
        self.logs.retain(|_, log| log.expires_at_ms > now_ms);
        self.next_sweep_ms = now_ms.saturating_add(window_ms);
    }
}

#[derive(Default)]
struct KeyLog {
    entries: VecDeque<i64>,
    expires_at_ms: i64,
}

impl InMemorySlidingLogStore {
    pub fn new() -> Self {
        Self {
            table: Mutex::new(LogTable::default()),
            available: AtomicBool::new(true),
            closed: AtomicBool::new(false),
            latency: None,
        }
    }

    /// Delay every operation by `latency`.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Toggle a simulated outage.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Number of keys currently holding a log.
    pub async fn tracked_keys(&self) -> usize {
        self.table.lock().await.logs.len()
    }

    async fn round_trip(&self) -> Result<(), StoreError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(StoreError::Closed);
        }
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        if !self.available.load(Ordering::SeqCst) {
            return Err(StoreError::Connection("store unavailable".to_string()));
        }
        Ok(())
    }

    fn purge(log: &mut VecDeque<i64>, cutoff: i64) {
        while log.front().is_some_and(|&ts| ts <= cutoff) {
            log.pop_front();
        }
    }
}

impl Default for InMemorySlidingLogStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SlidingLogStore for InMemorySlidingLogStore {
    async fn record(
        &self,
        key: &str,
        now_ms: i64,
        window_ms: i64,
    ) -> Result<LogSnapshot, StoreError> {
        self.round_trip().await?;

        // One lock for purge, count, append and expiry.
        let mut table = self.table.lock().await;
        table.sweep(now_ms, window_ms);
        let log = table.logs.entry(key.to_string()).or_default();

        Self::purge(&mut log.entries, now_ms.saturating_sub(window_ms));
        // Clocks of different instances may disagree slightly; keep the log ordered.
        let at = log.entries.partition_point(|&ts| ts <= now_ms);
        log.entries.insert(at, now_ms);
        log.expires_at_ms = log.expires_at_ms.max(now_ms.saturating_add(window_ms));

        Ok(LogSnapshot {
            count: log.entries.len() as u64,
            oldest_ms: log.entries.front().copied(),
        })
    }

    async fn inspect(
        &self,
        key: &str,
        now_ms: i64,
        window_ms: i64,
    ) -> Result<LogSnapshot, StoreError> {
        self.round_trip().await?;

        let table = self.table.lock().await;
        let cutoff = now_ms.saturating_sub(window_ms);
        let mut live = table
            .logs
            .get(key)
            .filter(|log| log.expires_at_ms > now_ms)
            .into_iter()
            .flat_map(|log| log.entries.iter())
            .copied()
            .filter(|&ts| ts > cutoff)
            .peekable();

        let oldest_ms = live.peek().copied();
        Ok(LogSnapshot {
            count: live.count() as u64,
            oldest_ms,
        })
    }

    async fn clear(&self, key: &str) -> Result<(), StoreError> {
        self.round_trip().await?;
        self.table.lock().await.logs.remove(key);
        Ok(())
    }

    async fn ping(&self) -> Result<(), StoreError> {
        self.round_trip().await
    }

    async fn close(&self) -> Result<(), StoreError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_record_purges_entries_outside_window() {
        let store = InMemorySlidingLogStore::new();

        assert_eq!(store.record("k", 1_000, 100).await.unwrap().count, 1);
        assert_eq!(store.record("k", 1_050, 100).await.unwrap().count, 2);

        // 1_000 is exactly one window old and drops out
        let snapshot = store.record("k", 1_100, 100).await.unwrap();
        assert_eq!(snapshot.count, 2);
        assert_eq!(snapshot.oldest_ms, Some(1_050));
    }

    #[tokio::test]
    async fn test_inspect_is_read_only() {
        let store = InMemorySlidingLogStore::new();
        store.record("k", 1_000, 100).await.unwrap();
        store.record("k", 1_060, 100).await.unwrap();

        let snapshot = store.inspect("k", 1_120, 100).await.unwrap();
        assert_eq!(snapshot.count, 1);
        assert_eq!(snapshot.oldest_ms, Some(1_060));

        // The expired entry is still there until the next record
        let snapshot = store.inspect("k", 1_050, 100).await.unwrap();
        assert_eq!(snapshot.count, 2);
    }

    #[tokio::test]
    async fn test_out_of_order_timestamps_stay_sorted() {
        let store = InMemorySlidingLogStore::new();
        store.record("k", 1_010, 100).await.unwrap();
        let snapshot = store.record("k", 1_005, 100).await.unwrap();
        assert_eq!(snapshot.oldest_ms, Some(1_005));
    }

    #[tokio::test]
    async fn test_expired_keys_are_dropped() {
        let store = InMemorySlidingLogStore::new();
        for i in 0..1_000 {
            store.record(&format!("caller:{i}"), 1_000, 100).await.unwrap();
        }
        assert_eq!(store.tracked_keys().await, 1_000);

        // A key past its expiry reads as empty before any sweep
        assert_eq!(store.inspect("caller:0", 1_100, 100).await.unwrap().count, 0);

        store.record("late", 10_000_000, 100).await.unwrap();
        assert_eq!(store.tracked_keys().await, 1);
    }

    #[tokio::test]
    async fn test_live_keys_survive_sweep() {
        let store = InMemorySlidingLogStore::new();
        store.record("idle", 1_000, 100).await.unwrap();
        store.record("busy", 1_000, 100).await.unwrap();
        store.record("busy", 1_090, 100).await.unwrap();

        store.record("busy", 1_150, 100).await.unwrap();
        assert_eq!(store.tracked_keys().await, 1);
        assert_eq!(store.inspect("busy", 1_150, 100).await.unwrap().count, 2);
    }

    #[tokio::test]
    async fn test_outage_and_close() {
        let store = InMemorySlidingLogStore::new();
        store.set_available(false);
        assert!(matches!(
            store.record("k", 1, 100).await,
            Err(StoreError::Connection(_))
        ));

        store.set_available(true);
        assert!(store.ping().await.is_ok());

        store.close().await.unwrap();
        assert!(matches!(store.ping().await, Err(StoreError::Closed)));
    }
}
