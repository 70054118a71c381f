//! Rate limiting middleware - the admission gate in front of every route.

use actix_web::{
    Error, HttpMessage, HttpRequest, ResponseError,
    body::EitherBody,
    dev::{Service, ServiceRequest, ServiceResponse, Transform, forward_ready},
    http::header::{HeaderMap, HeaderName, HeaderValue, RETRY_AFTER},
};
use chrono::{DateTime, SecondsFormat, SubsecRound, TimeDelta, Utc};
use std::future::{Future, Ready, ready};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::pin::Pin;
use std::rc::Rc;
use std::sync::Arc;

use relay_core::{CallerKey, ConsumptionResult, RateLimiter};
use relay_shared::RateLimitDetails;

use super::error::AppError;
use super::identity::default_caller_key;

pub const DEFAULT_MESSAGE: &str = "Too many requests, please try again later";

const LIMIT_HEADER: HeaderName = HeaderName::from_static("x-ratelimit-limit");
const REMAINING_HEADER: HeaderName = HeaderName::from_static("x-ratelimit-remaining");
const RESET_HEADER: HeaderName = HeaderName::from_static("x-ratelimit-reset");

/// Request-level bypass, e.g. for health checks.
pub type RequestSkip = Arc<dyn Fn(&HttpRequest) -> bool + Send + Sync>;
/// Overrides how the caller key is derived.
pub type KeyResolver = Arc<dyn Fn(&HttpRequest) -> CallerKey + Send + Sync>;
/// Notified once per rejected request.
pub type LimitObserver = Arc<dyn Fn(&HttpRequest, &str) -> anyhow::Result<()> + Send + Sync>;

/// Admission gate behaviour.
#[derive(Clone)]
pub struct AdmissionGateConfig {
    /// Emit `X-RateLimit-*` headers.
    pub headers: bool,
    /// Rejection message.
    pub message: String,
    /// Key anonymous callers by forwarded headers instead of the socket peer.
    pub trust_proxy: bool,
    pub skip: Option<RequestSkip>,
    pub key_resolver: Option<KeyResolver>,
    pub on_limit_reached: Option<LimitObserver>,
}

impl Default for AdmissionGateConfig {
    fn default() -> Self {
        Self {
            headers: true,
            message: DEFAULT_MESSAGE.to_string(),
            trust_proxy: false,
            skip: None,
            key_resolver: None,
            on_limit_reached: None,
        }
    }
}

impl AdmissionGateConfig {
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }

    pub fn with_headers(mut self, headers: bool) -> Self {
        self.headers = headers;
        self
    }

    /// Only enable behind a proxy that overwrites `X-Forwarded-For`.
    pub fn with_trust_proxy(mut self, trust_proxy: bool) -> Self {
        self.trust_proxy = trust_proxy;
        self
    }

    pub fn with_skip(mut self, skip: RequestSkip) -> Self {
        self.skip = Some(skip);
        self
    }

    /// Bypass requests whose path matches one of `paths` exactly.
    pub fn skip_paths<I, S>(self, paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let paths: Vec<String> = paths.into_iter().map(Into::into).collect();
        if paths.is_empty() {
            return self;
        }
        self.with_skip(Arc::new(move |req: &HttpRequest| {
            paths.iter().any(|path| path == req.path())
        }))
    }

    #[allow(dead_code)]
    pub fn with_key_resolver(mut self, resolver: KeyResolver) -> Self {
        self.key_resolver = Some(resolver);
        self
    }

    #[allow(dead_code)]
    pub fn on_limit_reached(mut self, observer: LimitObserver) -> Self {
        self.on_limit_reached = Some(observer);
        self
    }

    fn should_skip(&self, req: &HttpRequest) -> bool {
        self.skip.as_ref().is_some_and(|skip| skip(req))
    }

    fn resolve_key(&self, req: &HttpRequest) -> CallerKey {
        match &self.key_resolver {
            Some(resolver) => resolver(req),
            None => default_caller_key(req, self.trust_proxy),
        }
    }

    fn notify_limit_reached(&self, req: &HttpRequest, key: &str) {
        let Some(observer) = &self.on_limit_reached else {
            return;
        };
        match catch_unwind(AssertUnwindSafe(|| observer(req, key))) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::error!(key = %key, error = %e, "Limit reached observer failed"),
            Err(_) => tracing::error!(key = %key, "Limit reached observer panicked"),
        }
    }
}

/// Rate limiting middleware factory.
///
/// Without a limiter the middleware passes every request straight through
/// and sets no headers.
pub struct RateLimitMiddleware {
    limiter: Option<Arc<dyn RateLimiter>>,
    config: Arc<AdmissionGateConfig>,
}

impl RateLimitMiddleware {
    pub fn new(limiter: Option<Arc<dyn RateLimiter>>, config: AdmissionGateConfig) -> Self {
        Self {
            limiter,
            config: Arc::new(config),
        }
    }
}

impl<S, B> Transform<S, ServiceRequest> for RateLimitMiddleware
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    B: 'static,
{
    type Response = ServiceResponse<EitherBody<B>>;
    type Error = Error;
    type Transform = RateLimitMiddlewareService<S>;
    type InitError = ();
    type Future = Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        ready(Ok(RateLimitMiddlewareService {
            service: Rc::new(service),
            limiter: self.limiter.clone(),
            config: self.config.clone(),
        }))
    }
}

pub struct RateLimitMiddlewareService<S> {
    service: Rc<S>,
    limiter: Option<Arc<dyn RateLimiter>>,
    config: Arc<AdmissionGateConfig>,
}

impl<S, B> Service<ServiceRequest> for RateLimitMiddlewareService<S>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    B: 'static,
{
    type Response = ServiceResponse<EitherBody<B>>;
    type Error = Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>>>>;

    forward_ready!(service);

    fn call(&self, req: ServiceRequest) -> Self::Future {
        let limiter = match &self.limiter {
            Some(limiter) if !self.config.should_skip(req.request()) => limiter.clone(),
            _ => {
                let fut = self.service.call(req);
                return Box::pin(async move { Ok(fut.await?.map_into_left_body()) });
            }
        };

        let service = self.service.clone();
        let config = self.config.clone();

        Box::pin(async move {
            let key = config.resolve_key(req.request());
            req.extensions_mut().insert(key.clone());

            let result = match limiter.consume(key.as_str()).await {
                Ok(result) => result,
                Err(e) => {
                    // Limiter failures never block traffic
                    tracing::error!(key = %key, error = %e, "Rate limiter error, failing open");
                    let res = service.call(req).await?;
                    return Ok(res.map_into_left_body());
                }
            };

            let reset_time = reset_time(&result);

            if !result.allowed {
                tracing::warn!(
                    key = %key,
                    current = result.current,
                    limit = result.limit,
                    "Rate limit exceeded"
                );
                config.notify_limit_reached(req.request(), key.as_str());

                let error = AppError::TooManyRequests {
                    message: config.message.clone(),
                    details: RateLimitDetails {
                        limit: result.limit,
                        current: result.current,
                        reset_time,
                    },
                };
                let mut response = error.error_response();
                if config.headers {
                    insert_limit_headers(response.headers_mut(), &result, reset_time);
                }
                response
                    .headers_mut()
                    .insert(RETRY_AFTER, HeaderValue::from(result.retry_after_secs()));

                let (http_req, _payload) = req.into_parts();
                let srv_response = ServiceResponse::new(http_req, response);
                return Ok(srv_response.map_into_right_body());
            }

            let mut res = service.call(req).await?;
            if config.headers {
                insert_limit_headers(res.headers_mut(), &result, reset_time);
            }
            Ok(res.map_into_left_body())
        })
    }
}

fn reset_time(result: &ConsumptionResult) -> DateTime<Utc> {
    let until_reset = TimeDelta::from_std(result.reset_after).unwrap_or(TimeDelta::zero());
    (Utc::now() + until_reset).trunc_subsecs(3)
}

fn insert_limit_headers(headers: &mut HeaderMap, result: &ConsumptionResult, reset_time: DateTime<Utc>) {
    headers.insert(LIMIT_HEADER.clone(), HeaderValue::from(result.limit));
    headers.insert(REMAINING_HEADER.clone(), HeaderValue::from(result.remaining));
    if let Ok(value) = HeaderValue::from_str(&reset_time.to_rfc3339_opts(SecondsFormat::Millis, true)) {
        headers.insert(RESET_HEADER.clone(), value);
    }
}
