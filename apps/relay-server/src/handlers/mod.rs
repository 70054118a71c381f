//! HTTP handlers and route configuration.

mod health;
mod rate_limit;

use actix_web::web;

/// Configure all application routes.
pub fn configure_routes(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/api")
            // Public routes
            .route("/health", web::get().to(health::health_check))
            // Caller's own budget
            .route("/rate-limit", web::get().to(rate_limit::rate_limit_status)),
    );
}
