//! Builds the configured limiter backend.

use std::sync::Arc;

use relay_core::{LimiterSettings, RateLimitError, RateLimiter, SkipPredicate};

use super::config::{RateLimitBackend, RateLimitConfig};
use super::memory::InMemoryRateLimiter;

/// Build the limiter selected by `config`.
///
/// Returns `Ok(None)` when rate limiting is disabled. Configuration problems
/// are returned as [`RateLimitError::Configuration`] and should abort startup.
/// A shared store that is down at startup is only logged: requests fail open
/// until it recovers.
pub async fn build_rate_limiter(
    config: &RateLimitConfig,
    skip: Option<SkipPredicate>,
) -> Result<Option<Arc<dyn RateLimiter>>, RateLimitError> {
    if !config.enabled {
        tracing::info!("Rate limiting disabled");
        return Ok(None);
    }

    config.validate()?;

    let mut settings = config.limiter_settings();
    if let Some(skip) = skip {
        settings = settings.with_skip(skip);
    }

    let limiter: Arc<dyn RateLimiter> = match config.backend {
        RateLimitBackend::Local => Arc::new(InMemoryRateLimiter::with_cleanup_interval(
            settings,
            config.cleanup_interval,
        )),
        RateLimitBackend::Shared => build_shared(config, settings).await?,
    };

    tracing::info!(
        backend = %config.backend,
        max_requests = config.max_requests,
        window_ms = config.window.as_millis() as u64,
        key_prefix = %config.key_prefix,
        "Rate limiter initialized"
    );

    Ok(Some(limiter))
}

#[cfg(feature = "redis")]
async fn build_shared(
    config: &RateLimitConfig,
    settings: LimiterSettings,
) -> Result<Arc<dyn RateLimiter>, RateLimitError> {
    use super::redis::RedisSlidingLogStore;
    use super::shared::SharedRateLimiter;

    let redis = config.redis.clone().ok_or_else(|| {
        RateLimitError::Configuration("shared backend requires REDIS_URL".to_string())
    })?;

    let store = RedisSlidingLogStore::new(redis)
        .map_err(|e| RateLimitError::Configuration(e.to_string()))?;
    let limiter = SharedRateLimiter::new(settings, Arc::new(store)).with_timeout(config.store_timeout);

    if !limiter.health_check().await {
        tracing::warn!("Rate limit store unreachable at startup, requests will be admitted until it recovers");
    }

    Ok(Arc::new(limiter))
}

#[cfg(not(feature = "redis"))]
async fn build_shared(
    _config: &RateLimitConfig,
    _settings: LimiterSettings,
) -> Result<Arc<dyn RateLimiter>, RateLimitError> {
    Err(RateLimitError::Configuration(
        "shared backend requires the `redis` feature".to_string(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use relay_core::domain::skip_keys;

    fn local_config(max_requests: u32) -> RateLimitConfig {
        RateLimitConfig {
            max_requests,
            window: Duration::from_secs(60),
            ..RateLimitConfig::default()
        }
    }

    #[tokio::test]
    async fn test_disabled_builds_nothing() {
        let config = RateLimitConfig {
            enabled: false,
            // Invalid values are irrelevant when disabled
            max_requests: 0,
            ..RateLimitConfig::default()
        };
        assert!(build_rate_limiter(&config, None).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_local_backend() {
        let limiter = build_rate_limiter(&local_config(2), None)
            .await
            .unwrap()
            .unwrap();

        assert!(limiter.consume("ip:1.2.3.4").await.unwrap().allowed);
        assert!(limiter.consume("ip:1.2.3.4").await.unwrap().allowed);
        assert!(!limiter.consume("ip:1.2.3.4").await.unwrap().allowed);
        limiter.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_skip_predicate_is_wired() {
        let limiter = build_rate_limiter(&local_config(1), Some(skip_keys(["user:ops"])))
            .await
            .unwrap()
            .unwrap();

        for _ in 0..5 {
            assert!(limiter.consume("user:ops").await.unwrap().allowed);
        }
    }

    #[tokio::test]
    async fn test_invalid_config_is_fatal() {
        let shared_without_store = RateLimitConfig {
            backend: RateLimitBackend::Shared,
            ..RateLimitConfig::default()
        };
        assert!(matches!(
            build_rate_limiter(&shared_without_store, None).await,
            Err(RateLimitError::Configuration(_))
        ));

        assert!(matches!(
            build_rate_limiter(&local_config(0), None).await,
            Err(RateLimitError::Configuration(_))
        ));
    }

    #[cfg(feature = "redis")]
    #[tokio::test]
    async fn test_shared_backend_with_unreachable_store_still_builds() {
        use super::super::config::RedisConfig;

        let config = RateLimitConfig {
            backend: RateLimitBackend::Shared,
            max_requests: 1,
            store_timeout: Duration::from_millis(300),
            redis: Some(RedisConfig {
                url: "redis://127.0.0.1:1".to_string(),
                connect_timeout: Duration::from_millis(100),
                ..RedisConfig::default()
            }),
            ..RateLimitConfig::default()
        };

        let limiter = build_rate_limiter(&config, None).await.unwrap().unwrap();
        let res = limiter.consume("anyKey").await.unwrap();
        assert!(res.allowed);
        assert_eq!(res.current, 0);
    }
}
