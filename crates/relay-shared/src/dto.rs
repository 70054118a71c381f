//! Data Transfer Objects - request/response types for the API.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Machine-readable details attached to a 429 rejection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitDetails {
    pub limit: u64,
    pub current: u64,
    /// When the window frees up again.
    pub reset_time: DateTime<Utc>,
}

/// Caller's current rate limit state, as reported by the introspection route.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitStatus {
    pub key: String,
    pub allowed: bool,
    pub limit: u64,
    pub current: u64,
    pub remaining: u64,
    pub reset_time: DateTime<Utc>,
}
