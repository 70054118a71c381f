//! Middleware modules.

pub mod error;
pub mod identity;
pub mod rate_limit;

pub use error::{AppError, AppResult};
pub use identity::Caller;
pub use rate_limit::{AdmissionGateConfig, RateLimitMiddleware};
