//! Rate limit introspection endpoint.

use actix_web::{HttpResponse, web};
use chrono::{SubsecRound, TimeDelta, Utc};

use relay_shared::{ApiResponse, RateLimitStatus};

use crate::middleware::{AppError, AppResult, Caller};
use crate::state::AppState;

/// Report the caller's budget without charging it.
///
/// GET /api/rate-limit
pub async fn rate_limit_status(
    state: web::Data<AppState>,
    caller: Caller,
) -> AppResult<HttpResponse> {
    let limiter = state
        .limiter
        .as_ref()
        .ok_or_else(|| AppError::NotFound("Rate limiting is disabled".to_string()))?;

    let key = caller.0;
    let result = limiter.get_state(key.as_str()).await?;
    let until_reset = TimeDelta::from_std(result.reset_after).unwrap_or(TimeDelta::zero());

    let status = RateLimitStatus {
        key: key.into_inner(),
        allowed: result.allowed,
        limit: result.limit,
        current: result.current,
        remaining: result.remaining,
        reset_time: (Utc::now() + until_reset).trunc_subsecs(3),
    };

    Ok(HttpResponse::Ok().json(ApiResponse::ok(status)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::{App, test};
    use relay_core::{LimiterSettings, RateLimiter};
    use relay_infra::InMemoryRateLimiter;
    use std::net::SocketAddr;
    use std::sync::Arc;
    use std::time::Duration;

    use crate::middleware::{AdmissionGateConfig, RateLimitMiddleware};

    async fn ok() -> HttpResponse {
        HttpResponse::Ok().finish()
    }

    #[actix_web::test]
    async fn test_status_reflects_gate_charges() {
        let limiter: Arc<dyn RateLimiter> = Arc::new(InMemoryRateLimiter::new(
            LimiterSettings::new(10, Duration::from_secs(60)),
        ));
        let state = AppState::with_limiter(Some(limiter.clone()));
        // The gate is bypassed for the status route itself
        let gate = AdmissionGateConfig::default().skip_paths(["/status"]);

        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state))
                .wrap(RateLimitMiddleware::new(Some(limiter), gate))
                .route("/", web::get().to(ok))
                .route("/status", web::get().to(rate_limit_status)),
        )
        .await;

        let caller: SocketAddr = "10.0.0.7:41000".parse().unwrap();
        for _ in 0..3 {
            let req = test::TestRequest::get()
                .uri("/")
                .peer_addr(caller)
                .to_request();
            test::call_service(&app, req).await;
        }

        for _ in 0..2 {
            let req = test::TestRequest::get()
                .uri("/status")
                .peer_addr(caller)
                .to_request();
            let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;
            assert_eq!(body["success"], true);
            assert_eq!(body["data"]["key"], "ip:10.0.0.7");
            assert_eq!(body["data"]["current"], 3);
            assert_eq!(body["data"]["remaining"], 7);
            assert_eq!(body["data"]["allowed"], true);
        }
    }

    #[actix_web::test]
    async fn test_status_when_disabled() {
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(AppState::with_limiter(None)))
                .route("/status", web::get().to(rate_limit_status)),
        )
        .await;

        let req = test::TestRequest::get().uri("/status").to_request();
        let res = test::call_service(&app, req).await;
        assert_eq!(res.status(), 404);
    }
}
