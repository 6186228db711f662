//! Sliding-window rate-limit middleware.
//!
//! Each protected route group gets its own (scope, window, quota) rule;
//! counters live in Redis so quotas hold across every instance.
//!
//! # Failure mode
//!
//! When the counter store is unreachable the middleware fails open: the
//! request proceeds and a warning is logged. Verification is an
//! availability-sensitive gate in front of humans; dropping it on a Redis
//! outage would lock members out entirely.

use crate::errors::GkError;
use crate::observability::metrics;
use crate::redis::{RateLimitRule, RateLimiter};
use axum::{
    extract::{ConnectInfo, Request, State},
    http::HeaderValue,
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::warn;

/// State for one rate-limited route group.
pub struct RateLimitState {
    pub limiter: RateLimiter,
    pub rule: RateLimitRule,
}

/// Axum middleware enforcing the state's rule per client ip.
pub async fn enforce_rate_limit(
    State(state): State<Arc<RateLimitState>>,
    request: Request,
    next: Next,
) -> Response {
    let identifier = client_ip(&request);

    let decision = match state.limiter.check_rule(&state.rule, &identifier).await {
        Ok(decision) => decision,
        Err(e) => {
            // Fail open: the request proceeds without a quota check
            warn!(
                target: "gk.middleware.rate_limit",
                scope = state.rule.scope,
                error = %e,
                "Rate-limit check failed, allowing request"
            );
            metrics::record_rate_limit(state.rule.scope, "failopen");
            return next.run(request).await;
        }
    };

    if !decision.allowed {
        metrics::record_rate_limit(state.rule.scope, "rejected");
        warn!(
            target: "gk.middleware.rate_limit",
            scope = state.rule.scope,
            identifier = %identifier,
            "Rate limit exceeded"
        );

        let retry_after_secs = state.rule.window_ms.div_ceil(1000);
        let mut response = GkError::RateLimited.into_response();
        insert_header(
            &mut response,
            "Retry-After",
            &retry_after_secs.to_string(),
        );
        apply_quota_headers(&mut response, &state.rule, decision.remaining, decision.reset_at);
        return response;
    }

    metrics::record_rate_limit(state.rule.scope, "allowed");
    let mut response = next.run(request).await;
    apply_quota_headers(&mut response, &state.rule, decision.remaining, decision.reset_at);
    response
}

/// Resolve the caller's network origin: first `X-Forwarded-For` hop when
/// present (deployments behind a proxy), else the socket peer address.
fn client_ip(request: &Request) -> String {
    if let Some(forwarded) = request
        .headers()
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
    {
        if let Some(first) = forwarded.split(',').next() {
            let first = first.trim();
            if !first.is_empty() {
                return first.to_string();
            }
        }
    }

    request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map_or_else(|| "unknown".to_string(), |info| info.0.ip().to_string())
}

fn apply_quota_headers(
    response: &mut Response,
    rule: &RateLimitRule,
    remaining: u32,
    reset_at: chrono::DateTime<chrono::Utc>,
) {
    insert_header(response, "X-RateLimit-Limit", &rule.max_requests.to_string());
    insert_header(response, "X-RateLimit-Remaining", &remaining.to_string());
    insert_header(response, "X-RateLimit-Reset", &reset_at.to_rfc3339());
}

fn insert_header(response: &mut Response, name: &'static str, value: &str) {
    if let Ok(value) = HeaderValue::from_str(value) {
        response.headers_mut().insert(name, value);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use axum::body::Body;

    #[test]
    fn test_client_ip_prefers_forwarded_header() {
        let request = Request::builder()
            .header("x-forwarded-for", "198.51.100.7, 10.0.0.1")
            .body(Body::empty())
            .unwrap();
        assert_eq!(client_ip(&request), "198.51.100.7");
    }

    #[test]
    fn test_client_ip_falls_back_to_socket_peer() {
        let mut request = Request::builder().body(Body::empty()).unwrap();
        request
            .extensions_mut()
            .insert(ConnectInfo(SocketAddr::from(([192, 0, 2, 1], 4000))));
        assert_eq!(client_ip(&request), "192.0.2.1");
    }

    #[test]
    fn test_client_ip_unknown_without_any_source() {
        let request = Request::builder().body(Body::empty()).unwrap();
        assert_eq!(client_ip(&request), "unknown");
    }

    #[test]
    fn test_empty_forwarded_header_is_ignored() {
        let request = Request::builder()
            .header("x-forwarded-for", "  ")
            .body(Body::empty())
            .unwrap();
        assert_eq!(client_ip(&request), "unknown");
    }
}
