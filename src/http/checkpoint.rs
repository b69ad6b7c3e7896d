//! Per-request admission checkpoint.
//!
//! Resolves the caller's quota, counts the request under a
//! `tenant:ip:path` key and either decorates the response with the standard
//! rate limit headers or rejects it with `429 Too Many Requests`.
//! Keying by route path keeps one expensive endpoint from exhausting the
//! caller's budget for every other endpoint.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use axum::extract::{ConnectInfo, MatchedPath, Request, State};
use axum::http::header::RETRY_AFTER;
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, instrument, trace};

use crate::ratelimit::{QuotaResolver, RateDecision, RateLimiterBackend};

/// Quotas are per minute.
pub const QUOTA_WINDOW_MS: u32 = 60_000;
/// Key segment used for anonymous traffic.
pub const PUBLIC_TENANT: &str = "public";

pub const X_RATELIMIT_LIMIT: HeaderName = HeaderName::from_static("x-ratelimit-limit");
pub const X_RATELIMIT_REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");
pub const X_RATELIMIT_RESET: HeaderName = HeaderName::from_static("x-ratelimit-reset");

const X_FORWARDED_FOR: &str = "x-forwarded-for";

/// The authenticated tenant of a request.
///
/// Inserted into the request extensions by the authentication layer, which
/// must run before the checkpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TenantId(pub String);

/// Who is calling, and where.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestIdentity {
    pub tenant_id: Option<String>,
    pub client_ip: String,
    pub route_path: String,
}

impl RequestIdentity {
    /// Extract the identity from an incoming request.
    ///
    /// The route path is the matched route template (`/users/{id}`), so
    /// every concrete id shares one budget. Requests that did not go
    /// through the router fall back to the URI path.
    pub fn from_request<B>(req: &axum::http::Request<B>) -> Self {
        let peer = req
            .extensions()
            .get::<ConnectInfo<SocketAddr>>()
            .map(|info| info.0.ip());
        let route_path = match req.extensions().get::<MatchedPath>() {
            Some(matched) => matched.as_str().to_string(),
            None => req.uri().path().to_string(),
        };

        Self {
            tenant_id: req.extensions().get::<TenantId>().map(|t| t.0.clone()),
            client_ip: client_ip(req.headers(), peer),
            route_path,
        }
    }

    /// `tenantIdOrPublic:ip:routePath`
    pub fn rate_limit_key(&self) -> String {
        format!(
            "{}:{}:{}",
            self.tenant_id.as_deref().unwrap_or(PUBLIC_TENANT),
            self.client_ip,
            self.route_path
        )
    }
}

/// The left-most `X-Forwarded-For` entry if present, else the peer address.
pub fn client_ip(headers: &HeaderMap, peer: Option<IpAddr>) -> String {
    let forwarded = headers
        .get(X_FORWARDED_FOR)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .map(str::trim)
        .filter(|ip| !ip.is_empty());

    match (forwarded, peer) {
        (Some(ip), _) => ip.to_string(),
        (None, Some(peer)) => peer.to_string(),
        (None, None) => "unknown".to_string(),
    }
}

/// Rejection returned when a caller has used up its quota.
#[derive(Debug, Clone, Error)]
#[error("rate limit quota exceeded, retry after {} seconds", .0.retry_after_secs)]
pub struct QuotaExceeded(pub RateDecision);

#[derive(Serialize)]
struct QuotaExceededBody {
    error: &'static str,
    message: String,
    limit: u32,
    retry_after_secs: u32,
}

impl IntoResponse for QuotaExceeded {
    fn into_response(self) -> Response {
        let decision = self.0;
        let body = QuotaExceededBody {
            error: "quota_exceeded",
            message: self.to_string(),
            limit: decision.limit,
            retry_after_secs: decision.retry_after_secs,
        };

        let mut response = (StatusCode::TOO_MANY_REQUESTS, Json(body)).into_response();
        let headers = response.headers_mut();
        apply_rate_limit_headers(headers, &decision);
        headers.insert(RETRY_AFTER, HeaderValue::from(decision.retry_after_secs));
        response
    }
}

/// Set `X-RateLimit-Limit`, `X-RateLimit-Remaining` and `X-RateLimit-Reset`.
pub fn apply_rate_limit_headers(headers: &mut HeaderMap, decision: &RateDecision) {
    headers.insert(X_RATELIMIT_LIMIT, HeaderValue::from(decision.limit));
    headers.insert(X_RATELIMIT_REMAINING, HeaderValue::from(decision.remaining));
    headers.insert(X_RATELIMIT_RESET, HeaderValue::from(decision.reset_at_secs()));
}

/// Decides whether a request may proceed.
pub struct AdmissionCheckpoint {
    limiter: Arc<dyn RateLimiterBackend>,
    quotas: Arc<QuotaResolver>,
}

impl AdmissionCheckpoint {
    pub fn new(limiter: Arc<dyn RateLimiterBackend>, quotas: Arc<QuotaResolver>) -> Self {
        Self { limiter, quotas }
    }

    /// Count the request and return the decision, or the rejection.
    #[instrument(
        skip(self),
        fields(tenant = identity.tenant_id.as_deref().unwrap_or(PUBLIC_TENANT))
    )]
    pub async fn admit(&self, identity: &RequestIdentity) -> Result<RateDecision, QuotaExceeded> {
        let limit = self.quotas.resolve(identity.tenant_id.as_deref()).await;
        let key = identity.rate_limit_key();
        let decision = self.limiter.check(&key, limit, QUOTA_WINDOW_MS).await;

        if decision.allowed {
            trace!(key = %key, remaining = decision.remaining, "Request admitted");
            Ok(decision)
        } else {
            debug!(
                key = %key,
                limit = decision.limit,
                retry_after_secs = decision.retry_after_secs,
                "Request rejected, quota exceeded"
            );
            Err(QuotaExceeded(decision))
        }
    }
}

/// Axum middleware running the checkpoint in front of the inner service.
///
/// ```ignore
/// let app = Router::new()
///     .route("/api/things", get(list_things))
///     .layer(axum::middleware::from_fn_with_state(checkpoint, admission_checkpoint));
/// ```
pub async fn admission_checkpoint(
    State(checkpoint): State<Arc<AdmissionCheckpoint>>,
    req: Request,
    next: Next,
) -> Response {
    let identity = RequestIdentity::from_request(&req);

    match checkpoint.admit(&identity).await {
        Ok(decision) => {
            let mut response = next.run(req).await;
            apply_rate_limit_headers(response.headers_mut(), &decision);
            response
        }
        Err(rejection) => rejection.into_response(),
    }
}
