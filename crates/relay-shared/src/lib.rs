//! # Relay Shared
//!
//! Wire types shared between the gateway and its clients.

pub mod dto;
pub mod response;

pub use dto::{RateLimitDetails, RateLimitStatus};
pub use response::{ApiResponse, ErrorBody, ErrorResponse};
