//! Caller identity as seen by the admission gate.

use actix_web::{FromRequest, HttpMessage, HttpRequest, dev::Payload};
use std::future::{Ready, ready};

use relay_core::CallerKey;

/// Identity established by the authentication layer.
///
/// The authentication middleware inserts this into request extensions; the
/// gate only reads it.
#[derive(Debug, Clone)]
pub struct AuthenticatedCaller {
    pub id: String,
}

impl AuthenticatedCaller {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }
}

/// `user:<id>` for authenticated callers, `ip:<address>` otherwise.
///
/// The address is the socket peer. `Forwarded`/`X-Forwarded-For` are only
/// read when `trust_proxy` is set, since clients can put anything there.
pub fn default_caller_key(req: &HttpRequest, trust_proxy: bool) -> CallerKey {
    let user_id = req
        .extensions()
        .get::<AuthenticatedCaller>()
        .map(|caller| caller.id.clone());

    let address = if trust_proxy {
        req.connection_info()
            .realip_remote_addr()
            .map(str::to_owned)
    } else {
        req.peer_addr().map(|addr| addr.ip().to_string())
    };

    CallerKey::resolve(user_id.as_deref(), address.as_deref())
}

/// Caller key extractor.
///
/// Returns the key the gate charged when it ran, otherwise the peer-based
/// default key.
#[derive(Debug, Clone)]
pub struct Caller(pub CallerKey);

impl FromRequest for Caller {
    type Error = actix_web::Error;
    type Future = Ready<Result<Self, Self::Error>>;

    fn from_request(req: &HttpRequest, _payload: &mut Payload) -> Self::Future {
        let charged = req.extensions().get::<CallerKey>().cloned();
        let key = charged.unwrap_or_else(|| default_caller_key(req, false));
        ready(Ok(Caller(key)))
    }
}
