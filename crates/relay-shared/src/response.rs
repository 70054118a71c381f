//! Standardized API response envelopes.

use serde::{Deserialize, Serialize};

/// Standard successful API response wrapper.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl<T> ApiResponse<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            message: None,
        }
    }
}

/// Error envelope: `{ "success": false, "error": { "code", "message", "details" } }`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub success: bool,
    pub error: ErrorBody,
}

/// The error itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    /// The HTTP status code.
    pub code: u16,

    /// A human-readable explanation.
    pub message: String,

    /// Structured, error-specific data.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl ErrorResponse {
    pub fn new(code: u16, message: impl Into<String>) -> Self {
        Self {
            success: false,
            error: ErrorBody {
                code,
                message: message.into(),
                details: None,
            },
        }
    }

    /// Attach details. Values that fail to serialize are dropped.
    pub fn with_details(mut self, details: impl Serialize) -> Self {
        self.error.details = serde_json::to_value(details).ok();
        self
    }

    // Common error constructors
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(404, message)
    }

    pub fn too_many_requests(message: impl Into<String>) -> Self {
        Self::new(429, message)
    }

    pub fn internal_error() -> Self {
        Self::new(500, "Internal Server Error")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dto::RateLimitDetails;
    use chrono::{TimeZone, Utc};

    #[test]
    fn test_rejection_envelope_shape() {
        let details = RateLimitDetails {
            limit: 3,
            current: 4,
            reset_time: Utc.with_ymd_and_hms(2026, 1, 2, 3, 4, 5).unwrap(),
        };
        let body = ErrorResponse::too_many_requests("Too many requests, please try again later")
            .with_details(details);

        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["success"], false);
        assert_eq!(json["error"]["code"], 429);
        assert_eq!(json["error"]["details"]["limit"], 3);
        assert_eq!(json["error"]["details"]["current"], 4);
        assert_eq!(json["error"]["details"]["resetTime"], "2026-01-02T03:04:05Z");
    }

    #[test]
    fn test_details_omitted_when_absent() {
        let json = serde_json::to_value(ErrorResponse::internal_error()).unwrap();
        assert!(json["error"].get("details").is_none());
    }
}
