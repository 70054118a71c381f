//! Application configuration loaded from environment variables.

use std::env;

use relay_core::RateLimitError;
use relay_infra::{RateLimitConfig, parse_flag};

use crate::middleware::AdmissionGateConfig;
use crate::middleware::rate_limit::DEFAULT_MESSAGE;

/// Application configuration.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub rate_limit: RateLimitConfig,
    pub gate: GateSettings,
}

/// Plain-data part of the admission gate configuration.
#[derive(Debug, Clone)]
pub struct GateSettings {
    pub headers: bool,
    pub message: String,
    pub skip_paths: Vec<String>,
    /// Key anonymous callers by `X-Forwarded-For` (behind a proxy only).
    pub trust_proxy: bool,
}

impl Default for GateSettings {
    fn default() -> Self {
        Self {
            headers: true,
            message: DEFAULT_MESSAGE.to_string(),
            skip_paths: vec!["/api/health".to_string()],
            trust_proxy: false,
        }
    }
}

impl AppConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, RateLimitError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, RateLimitError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let port = match lookup("PORT") {
            Some(raw) => raw.trim().parse().map_err(|_| {
                RateLimitError::Configuration(format!("PORT has an invalid value '{raw}'"))
            })?,
            None => 8080,
        };

        let defaults = GateSettings::default();
        let gate = GateSettings {
            headers: lookup("RATE_LIMIT_HEADERS")
                .map(|v| parse_flag(&v))
                .unwrap_or(defaults.headers),
            message: lookup("RATE_LIMIT_MESSAGE")
                .filter(|m| !m.trim().is_empty())
                .unwrap_or(defaults.message),
            skip_paths: lookup("RATE_LIMIT_SKIP_PATHS")
                .map(|paths| {
                    paths
                        .split(',')
                        .map(str::trim)
                        .filter(|p| !p.is_empty())
                        .map(String::from)
                        .collect()
                })
                .unwrap_or(defaults.skip_paths),
            trust_proxy: lookup("RATE_LIMIT_TRUST_PROXY")
                .map(|v| parse_flag(&v))
                .unwrap_or(defaults.trust_proxy),
        };

        Ok(Self {
            host: lookup("HOST").unwrap_or_else(|| "127.0.0.1".to_string()),
            port,
            rate_limit: RateLimitConfig::from_lookup(&lookup)?,
            gate,
        })
    }

    /// Gate configuration for the middleware.
    pub fn admission_gate(&self) -> AdmissionGateConfig {
        AdmissionGateConfig::default()
            .with_headers(self.gate.headers)
            .with_message(self.gate.message.clone())
            .with_trust_proxy(self.gate.trust_proxy)
            .skip_paths(self.gate.skip_paths.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name: &str| vars.get(name).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = AppConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.host, "127.0.0.1");
        assert_eq!(config.port, 8080);
        assert!(config.gate.headers);
        assert_eq!(config.gate.message, DEFAULT_MESSAGE);
        assert_eq!(config.gate.skip_paths, vec!["/api/health"]);
        assert!(!config.gate.trust_proxy);
        assert!(config.rate_limit.enabled);
    }

    #[test]
    fn test_gate_overrides() {
        let config = AppConfig::from_lookup(lookup(&[
            ("PORT", "9000"),
            ("RATE_LIMIT_HEADERS", "FALSE"),
            ("RATE_LIMIT_TRUST_PROXY", "true"),
            ("RATE_LIMIT_MESSAGE", "Easy there"),
            ("RATE_LIMIT_SKIP_PATHS", "/api/health, /metrics,"),
            ("RATE_LIMIT_MAX_REQUESTS", "7"),
        ]))
        .unwrap();

        assert_eq!(config.port, 9000);
        assert!(!config.gate.headers);
        assert_eq!(config.gate.message, "Easy there");
        assert_eq!(config.gate.skip_paths, vec!["/api/health", "/metrics"]);
        assert_eq!(config.rate_limit.max_requests, 7);

        assert!(config.gate.trust_proxy);

        let gate = config.admission_gate();
        assert!(!gate.headers);
        assert!(gate.trust_proxy);
        assert!(gate.skip.is_some());
    }

    #[test]
    fn test_invalid_port() {
        assert!(matches!(
            AppConfig::from_lookup(lookup(&[("PORT", "http")])),
            Err(RateLimitError::Configuration(_))
        ));
    }
}
