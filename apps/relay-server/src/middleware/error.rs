//! Error handling middleware - JSON error envelopes.

use actix_web::{HttpResponse, ResponseError, http::StatusCode};
use relay_core::RateLimitError;
use relay_shared::{ErrorResponse, RateLimitDetails};
use std::fmt;

/// Application-level error type that converts to the shared error envelope.
#[derive(Debug)]
pub enum AppError {
    NotFound(String),
    TooManyRequests {
        message: String,
        details: RateLimitDetails,
    },
    Internal(String),
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::NotFound(msg) => write!(f, "Not found: {}", msg),
            AppError::TooManyRequests { message, details } => write!(
                f,
                "Too many requests: {} ({}/{})",
                message, details.current, details.limit
            ),
            AppError::Internal(msg) => write!(f, "Internal error: {}", msg),
        }
    }
}

impl ResponseError for AppError {
    fn status_code(&self) -> StatusCode {
        match self {
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::TooManyRequests { .. } => StatusCode::TOO_MANY_REQUESTS,
            AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        let error = match self {
            AppError::NotFound(detail) => ErrorResponse::not_found(detail),
            AppError::TooManyRequests { message, details } => {
                ErrorResponse::too_many_requests(message).with_details(details)
            }
            AppError::Internal(detail) => {
                // Log internal errors
                tracing::error!("Internal error: {}", detail);
                ErrorResponse::internal_error()
            }
        };

        HttpResponse::build(self.status_code()).json(error)
    }
}

impl From<RateLimitError> for AppError {
    fn from(err: RateLimitError) -> Self {
        match err {
            RateLimitError::Configuration(msg) => AppError::Internal(format!(
                "Rate limit configuration error: {}",
                msg
            )),
            other => {
                tracing::error!("Rate limiter error: {}", other);
                AppError::Internal("Rate limiter error".to_string())
            }
        }
    }
}

/// Result type alias for handlers.
pub type AppResult<T> = Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::body::to_bytes;

    #[actix_web::test]
    async fn test_too_many_requests_envelope() {
        let error = AppError::TooManyRequests {
            message: "Slow down".to_string(),
            details: RateLimitDetails {
                limit: 1,
                current: 2,
                reset_time: chrono::Utc::now(),
            },
        };
        assert_eq!(error.status_code(), StatusCode::TOO_MANY_REQUESTS);

        let body = to_bytes(error.error_response().into_body()).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["success"], false);
        assert_eq!(json["error"]["code"], 429);
        assert_eq!(json["error"]["message"], "Slow down");
        assert_eq!(json["error"]["details"]["current"], 2);
    }

    #[test]
    fn test_rate_limit_errors_are_internal() {
        let error = AppError::from(RateLimitError::StoreUnavailable("down".to_string()));
        assert_eq!(error.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
