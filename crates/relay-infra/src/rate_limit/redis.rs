//! Redis sliding log store using a sorted set per key.

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client, ConnectionInfo, IntoConnectionInfo, RedisError, Script};
use tokio::sync::Mutex;

use super::config::RedisConfig;
use super::store::{LogSnapshot, SlidingLogStore, StoreError};

/// Purge, count, append and expire in one server-side step.
/// Returns: [count_including_new_entry, oldest_score]
const RECORD_SCRIPT: &str = r#"
local key = KEYS[1]
local now = tonumber(ARGV[1])
local window = tonumber(ARGV[2])
local member = ARGV[3]

redis.call('ZREMRANGEBYSCORE', key, '-inf', now - window)
local current = redis.call('ZCARD', key)
redis.call('ZADD', key, now, member)
redis.call('PEXPIRE', key, window)

local oldest = redis.call('ZRANGE', key, 0, 0, 'WITHSCORES')
return {current + 1, tonumber(oldest[2])}
"#;

/// Count entries inside the window without writing.
/// Returns: [count, oldest_score or -1]
const INSPECT_SCRIPT: &str = r#"
local key = KEYS[1]
local cutoff = tonumber(ARGV[1]) - tonumber(ARGV[2])

local count = redis.call('ZCOUNT', key, '(' .. cutoff, '+inf')
local oldest = redis.call('ZRANGEBYSCORE', key, '(' .. cutoff, '+inf', 'WITHSCORES', 'LIMIT', 0, 1)
if oldest[2] then
    return {count, tonumber(oldest[2])}
end
return {count, -1}
"#;

/// Redis-backed sliding log store.
///
/// Connects lazily with a bounded connect timeout, and forgets the connection
/// after connection-level failures so the next call reconnects.
pub struct RedisSlidingLogStore {
    client: Client,
    config: RedisConfig,
    conn: Mutex<Option<ConnectionManager>>,
    closed: AtomicBool,
    record_script: Script,
    inspect_script: Script,
}

impl RedisSlidingLogStore {
    /// Validate the connection descriptor. No network I/O happens here.
    pub fn new(config: RedisConfig) -> Result<Self, StoreError> {
        let client = Client::open(connection_info(&config)?)
            .map_err(|e| StoreError::Connection(e.to_string()))?;

        Ok(Self {
            client,
            config,
            conn: Mutex::new(None),
            closed: AtomicBool::new(false),
            record_script: Script::new(RECORD_SCRIPT),
            inspect_script: Script::new(INSPECT_SCRIPT),
        })
    }

    /// Create from environment configuration.
    pub fn from_env() -> Result<Self, StoreError> {
        let config = RedisConfig::from_env()
            .map_err(|e| StoreError::Connection(e.to_string()))?
            .ok_or_else(|| StoreError::Connection("REDIS_URL is not set".to_string()))?;
        Self::new(config)
    }

    async fn connection(&self) -> Result<ConnectionManager, StoreError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(StoreError::Closed);
        }

        // Held across the connect so concurrent callers wait for one attempt.
        let mut guard = self.conn.lock().await;
        if let Some(conn) = guard.as_ref() {
            return Ok(conn.clone());
        }

        // Use timeout to prevent hanging if Redis is unreachable
        let conn_manager_fut = ConnectionManager::new(self.client.clone());
        let conn = tokio::time::timeout(self.config.connect_timeout, conn_manager_fut)
            .await
            .map_err(|_| StoreError::Timeout(self.config.connect_timeout))?
            .map_err(|e| StoreError::Connection(e.to_string()))?;

        tracing::info!(url = %self.config.url, "Connected to Redis rate limit store");
        *guard = Some(conn.clone());
        Ok(conn)
    }

    async fn on_error(&self, err: RedisError) -> StoreError {
        if err.is_connection_dropped() || err.is_connection_refusal() || err.is_io_error() {
            self.conn.lock().await.take();
            tracing::debug!(error = %err, "Dropped Redis rate limit connection");
            StoreError::Connection(err.to_string())
        } else {
            StoreError::Operation(err.to_string())
        }
    }

    async fn run_script(
        &self,
        script: &Script,
        key: &str,
        now_ms: i64,
        window_ms: i64,
        member: Option<String>,
    ) -> Result<LogSnapshot, StoreError> {
        let mut conn = self.connection().await?;

        let mut invocation = script.key(key);
        invocation.arg(now_ms).arg(window_ms);
        if let Some(member) = member {
            invocation.arg(member);
        }

        let result: Vec<i64> = match invocation.invoke_async(&mut conn).await {
            Ok(result) => result,
            Err(e) => return Err(self.on_error(e).await),
        };

        let count = result.first().copied().unwrap_or(0).max(0) as u64;
        let oldest_ms = result.get(1).copied().filter(|&score| score >= 0);

        Ok(LogSnapshot { count, oldest_ms })
    }
}

fn connection_info(config: &RedisConfig) -> Result<ConnectionInfo, StoreError> {
    let mut info = config
        .url
        .as_str()
        .into_connection_info()
        .map_err(|e| StoreError::Connection(e.to_string()))?;

    if let Some(password) = &config.password {
        info.redis.password = Some(password.clone());
    }
    if let Some(db) = config.db {
        info.redis.db = db;
    }
    Ok(info)
}

#[async_trait]
impl SlidingLogStore for RedisSlidingLogStore {
    async fn record(
        &self,
        key: &str,
        now_ms: i64,
        window_ms: i64,
    ) -> Result<LogSnapshot, StoreError> {
        // Members must be unique, several requests can share a millisecond.
        let member = format!("{}-{}", now_ms, uuid::Uuid::new_v4());
        self.run_script(&self.record_script, key, now_ms, window_ms, Some(member))
            .await
    }

    async fn inspect(
        &self,
        key: &str,
        now_ms: i64,
        window_ms: i64,
    ) -> Result<LogSnapshot, StoreError> {
        self.run_script(&self.inspect_script, key, now_ms, window_ms, None)
            .await
    }

    async fn clear(&self, key: &str) -> Result<(), StoreError> {
        let mut conn = self.connection().await?;
        match conn.del::<_, ()>(key).await {
            Ok(()) => Ok(()),
            Err(e) => Err(self.on_error(e).await),
        }
    }

    async fn ping(&self) -> Result<(), StoreError> {
        let mut conn = self.connection().await?;
        let pong: Result<String, RedisError> = redis::cmd("PING").query_async(&mut conn).await;
        match pong {
            Ok(_) => Ok(()),
            Err(e) => Err(self.on_error(e).await),
        }
    }

    async fn close(&self) -> Result<(), StoreError> {
        self.closed.store(true, Ordering::SeqCst);
        if self.conn.lock().await.take().is_some() {
            tracing::info!(url = %self.config.url, "Closed Redis rate limit store");
        }
        Ok(())
    }
}
