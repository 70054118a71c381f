//! Limiter configuration shared by every backend.

use std::collections::HashSet;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use futures::future::BoxFuture;

use crate::error::RateLimitError;

/// Key-level bypass check. Returning `true` lets the key through uncharged.
pub type SkipPredicate = Arc<dyn Fn(&str) -> BoxFuture<'static, bool> + Send + Sync>;

/// Wrap a synchronous predicate.
pub fn skip_when<F>(predicate: F) -> SkipPredicate
where
    F: Fn(&str) -> bool + Send + Sync + 'static,
{
    Arc::new(move |key: &str| {
        let skip = predicate(key);
        async move { skip }.boxed()
    })
}

/// Wrap an asynchronous predicate, e.g. one that consults an allow-list service.
pub fn skip_when_async<F, Fut>(predicate: F) -> SkipPredicate
where
    F: Fn(String) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = bool> + Send + 'static,
{
    Arc::new(move |key: &str| predicate(key.to_string()).boxed())
}

/// Skip a fixed set of keys.
pub fn skip_keys<I, S>(keys: I) -> SkipPredicate
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let keys: HashSet<String> = keys.into_iter().map(Into::into).collect();
    skip_when(move |key| keys.contains(key))
}

/// Longest accepted window. Store timestamps are `i64` milliseconds.
pub const MAX_WINDOW: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// Immutable per-limiter configuration.
#[derive(Clone)]
pub struct LimiterSettings {
    /// Maximum requests per window.
    pub max_requests: u32,
    /// Window duration.
    pub window: Duration,
    /// Namespace prepended to every key.
    pub key_prefix: String,
    /// Optional key-level bypass.
    pub skip: Option<SkipPredicate>,
}

impl Default for LimiterSettings {
    fn default() -> Self {
        Self {
            max_requests: 100,
            window: Duration::from_secs(60),
            key_prefix: "ratelimit".to_string(),
            skip: None,
        }
    }
}

impl fmt::Debug for LimiterSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LimiterSettings")
            .field("max_requests", &self.max_requests)
            .field("window", &self.window)
            .field("key_prefix", &self.key_prefix)
            .field("skip", &self.skip.is_some())
            .finish()
    }
}

impl LimiterSettings {
    pub fn new(max_requests: u32, window: Duration) -> Self {
        Self {
            max_requests,
            window,
            ..Self::default()
        }
    }

    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    pub fn with_skip(mut self, skip: SkipPredicate) -> Self {
        self.skip = Some(skip);
        self
    }

    /// Reject values no limiter can work with.
    pub fn validate(&self) -> Result<(), RateLimitError> {
        if self.max_requests == 0 {
            return Err(RateLimitError::Configuration(
                "max_requests must be a positive integer".to_string(),
            ));
        }
        if self.window.is_zero() {
            return Err(RateLimitError::Configuration(
                "window must be a positive duration".to_string(),
            ));
        }
        if self.window > MAX_WINDOW {
            return Err(RateLimitError::Configuration(format!(
                "window must not exceed {} days",
                MAX_WINDOW.as_secs() / 86_400
            )));
        }
        Ok(())
    }

    pub fn limit(&self) -> u64 {
        u64::from(self.max_requests)
    }

    /// `"{prefix}:{key}"`, or the bare key when no prefix is configured.
    pub fn namespaced_key(&self, key: &str) -> String {
        if self.key_prefix.is_empty() {
            key.to_string()
        } else {
            format!("{}:{}", self.key_prefix, key)
        }
    }

    /// Evaluate the skip predicate, if any, against the un-prefixed key.
    pub async fn should_skip(&self, key: &str) -> bool {
        match &self.skip {
            Some(skip) => skip(key).await,
            None => false,
        }
    }
}
