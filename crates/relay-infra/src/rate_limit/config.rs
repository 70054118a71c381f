//! Rate limiting configuration loaded from environment variables.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use relay_core::{LimiterSettings, RateLimitError};

use super::memory::DEFAULT_CLEANUP_INTERVAL;

/// Which limiter implementation to build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RateLimitBackend {
    /// Fixed windows in process memory.
    #[default]
    Local,
    /// Sliding log in Redis, consistent across instances.
    Shared,
}

impl FromStr for RateLimitBackend {
    type Err = RateLimitError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "local" | "memory" => Ok(Self::Local),
            "shared" | "redis" => Ok(Self::Shared),
            other => Err(RateLimitError::Configuration(format!(
                "unknown rate limit backend '{other}', expected 'local' or 'shared'"
            ))),
        }
    }
}

impl fmt::Display for RateLimitBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Local => f.write_str("local"),
            Self::Shared => f.write_str("shared"),
        }
    }
}

/// Redis connection configuration.
#[derive(Clone)]
pub struct RedisConfig {
    /// Redis URL (e.g., redis://localhost:6379)
    pub url: String,
    /// Password, overriding any password in the URL
    pub password: Option<String>,
    /// Database index, overriding any index in the URL
    pub db: Option<i64>,
    /// Connection timeout
    pub connect_timeout: Duration,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: "redis://localhost:6379".to_string(),
            password: None,
            db: None,
            connect_timeout: Duration::from_secs(5),
        }
    }
}

impl fmt::Debug for RedisConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisConfig")
            .field("url", &self.url)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .field("db", &self.db)
            .field("connect_timeout", &self.connect_timeout)
            .finish()
    }
}

impl RedisConfig {
    /// Load configuration from environment variables.
    /// Returns `None` when `REDIS_URL` is not set.
    pub fn from_env() -> Result<Option<Self>, RateLimitError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Option<Self>, RateLimitError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let Some(url) = lookup("REDIS_URL").filter(|url| !url.trim().is_empty()) else {
            return Ok(None);
        };

        Ok(Some(Self {
            url,
            password: lookup("REDIS_PASSWORD").filter(|p| !p.is_empty()),
            db: parse_optional(&lookup, "REDIS_DB")?,
            connect_timeout: Duration::from_secs(parse_or(
                &lookup,
                "REDIS_CONNECT_TIMEOUT_SECS",
                5,
            )?),
        }))
    }
}

/// Complete rate limiting configuration.
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// Whether requests are limited at all.
    pub enabled: bool,
    pub backend: RateLimitBackend,
    /// Maximum requests per window.
    pub max_requests: u32,
    /// Window duration.
    pub window: Duration,
    /// Key prefix for rate limit keys
    pub key_prefix: String,
    /// Sweep period for the local backend.
    pub cleanup_interval: Duration,
    /// Per-operation deadline for the shared backend's store.
    pub store_timeout: Duration,
    /// Connection to the shared store.
    pub redis: Option<RedisConfig>,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            backend: RateLimitBackend::Local,
            max_requests: 100,
            window: Duration::from_secs(60),
            key_prefix: "ratelimit".to_string(),
            cleanup_interval: DEFAULT_CLEANUP_INTERVAL,
            store_timeout: Duration::from_secs(2),
            redis: None,
        }
    }
}

impl RateLimitConfig {
    pub fn from_env() -> Result<Self, RateLimitError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Parse from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, RateLimitError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let backend = match lookup("RATE_LIMIT_BACKEND") {
            Some(name) => name.parse()?,
            None => defaults.backend,
        };

        Ok(Self {
            enabled: lookup("RATE_LIMIT_ENABLED")
                .map(|v| parse_flag(&v))
                .unwrap_or(defaults.enabled),
            backend,
            max_requests: parse_or(&lookup, "RATE_LIMIT_MAX_REQUESTS", defaults.max_requests)?,
            window: Duration::from_millis(parse_or(
                &lookup,
                "RATE_LIMIT_WINDOW_MS",
                60_000,
            )?),
            key_prefix: lookup("RATE_LIMIT_KEY_PREFIX").unwrap_or(defaults.key_prefix),
            cleanup_interval: Duration::from_millis(parse_or(
                &lookup,
                "RATE_LIMIT_CLEANUP_INTERVAL_MS",
                60_000,
            )?),
            store_timeout: Duration::from_millis(parse_or(
                &lookup,
                "RATE_LIMIT_STORE_TIMEOUT_MS",
                2_000,
            )?),
            redis: RedisConfig::from_lookup(&lookup)?,
        })
    }

    /// Check everything a limiter needs before it is built.
    pub fn validate(&self) -> Result<(), RateLimitError> {
        self.limiter_settings().validate()?;

        if self.cleanup_interval.is_zero() {
            return Err(RateLimitError::Configuration(
                "cleanup interval must be positive".to_string(),
            ));
        }
        if self.store_timeout.is_zero() {
            return Err(RateLimitError::Configuration(
                "store timeout must be positive".to_string(),
            ));
        }
        if self.backend == RateLimitBackend::Shared && self.redis.is_none() {
            return Err(RateLimitError::Configuration(
                "shared backend requires REDIS_URL".to_string(),
            ));
        }
        Ok(())
    }

    pub fn limiter_settings(&self) -> LimiterSettings {
        LimiterSettings::new(self.max_requests, self.window).with_key_prefix(self.key_prefix.clone())
    }
}

/// Anything but `false`/`0` (any case) turns a flag on.
pub fn parse_flag(raw: &str) -> bool {
    let raw = raw.trim();
    !(raw.eq_ignore_ascii_case("false") || raw == "0")
}

fn parse_or<T, F>(lookup: &F, name: &str, default: T) -> Result<T, RateLimitError>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    Ok(parse_optional(lookup, name)?.unwrap_or(default))
}

fn parse_optional<T, F>(lookup: &F, name: &str) -> Result<Option<T>, RateLimitError>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    match lookup(name) {
        Some(raw) => raw.trim().parse().map(Some).map_err(|_| {
            RateLimitError::Configuration(format!("{name} has an invalid value '{raw}'"))
        }),
        None => Ok(None),
    }
}
