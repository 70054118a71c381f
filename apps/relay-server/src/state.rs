//! Application state - shared across all handlers.

use std::sync::Arc;

use relay_core::{RateLimitError, RateLimiter};
use relay_infra::{RateLimitConfig, build_rate_limiter};

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    /// `None` when rate limiting is disabled.
    pub limiter: Option<Arc<dyn RateLimiter>>,
}

impl AppState {
    /// Build the application state from configuration.
    ///
    /// Fails only on invalid rate limit configuration.
    pub async fn new(config: &RateLimitConfig) -> Result<Self, RateLimitError> {
        let limiter = build_rate_limiter(config, None).await?;

        tracing::info!("Application state initialized");

        Ok(Self::with_limiter(limiter))
    }

    pub fn with_limiter(limiter: Option<Arc<dyn RateLimiter>>) -> Self {
        Self { limiter }
    }

    /// Release limiter resources. Safe to call more than once.
    pub async fn shutdown(&self) {
        if let Some(limiter) = &self.limiter {
            match limiter.close().await {
                Ok(()) => tracing::info!("Rate limiter closed"),
                Err(e) => tracing::warn!(error = %e, "Failed to close rate limiter"),
            }
        }
    }
}
