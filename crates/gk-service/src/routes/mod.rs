//! HTTP routes for the Gatekeeper.
//!
//! Defines the Axum router and application state.

use crate::config::Config;
use crate::handlers;
use crate::middleware::{enforce_rate_limit, http_metrics_middleware, RateLimitState};
use crate::redis::{RateLimiter, MEMBERSHIP_EVENTS_RULE, VERIFY_PAGE_RULE, VERIFY_SUBMIT_RULE};
use crate::services::VerificationService;
use axum::{
    middleware,
    routing::{get, post},
    Router,
};
use metrics_exporter_prometheus::PrometheusHandle;
use sqlx::PgPool;
use std::sync::Arc;
use std::time::Duration;
use tower_http::{timeout::TimeoutLayer, trace::TraceLayer};

/// Application state shared across all handlers.
#[derive(Clone)]
pub struct AppState {
    /// Database connection pool.
    pub pool: PgPool,

    /// Service configuration.
    pub config: Config,

    /// Shared sliding-window rate limiter.
    pub limiter: RateLimiter,

    /// The verification orchestrator.
    pub verification: Arc<VerificationService>,
}

/// Build the application routes.
///
/// Creates an Axum router with:
/// - `/health` - Liveness probe (simple "OK") - public, unversioned
/// - `/ready` - Readiness probe (checks Postgres + Redis) - public, unversioned
/// - `/metrics` - Prometheus metrics endpoint - public, unversioned
/// - `/verify` - Challenge-page context (rate limited per ip)
/// - `/api/v1/verify` - Verification submission (rate limited per ip)
/// - `/api/v1/events/membership` - Membership webhook (rate limited per ip)
/// - TraceLayer for request logging
/// - HTTP metrics middleware
/// - 30 second request timeout
pub fn build_routes(state: Arc<AppState>, metrics_handle: PrometheusHandle) -> Router {
    // Operational routes (no rate limiting)
    let operational_routes = Router::new()
        .route("/health", get(handlers::health_check))
        .route("/ready", get(handlers::readiness_check))
        .with_state(state.clone());

    // Metrics route with its own state
    let metrics_routes = Router::new()
        .route("/metrics", get(handlers::metrics_handler))
        .with_state(metrics_handle);

    // Browser-facing verification routes, each under its own quota
    let page_limit = Arc::new(RateLimitState {
        limiter: state.limiter.clone(),
        rule: VERIFY_PAGE_RULE,
    });
    let submit_limit = Arc::new(RateLimitState {
        limiter: state.limiter.clone(),
        rule: VERIFY_SUBMIT_RULE,
    });
    let events_limit = Arc::new(RateLimitState {
        limiter: state.limiter.clone(),
        rule: MEMBERSHIP_EVENTS_RULE,
    });

    let page_routes = Router::new()
        .route("/verify", get(handlers::verify_page))
        .route_layer(middleware::from_fn_with_state(page_limit, enforce_rate_limit))
        .with_state(state.clone());

    let submit_routes = Router::new()
        .route("/api/v1/verify", post(handlers::submit_verification))
        .route_layer(middleware::from_fn_with_state(
            submit_limit,
            enforce_rate_limit,
        ))
        .with_state(state.clone());

    let event_routes = Router::new()
        .route(
            "/api/v1/events/membership",
            post(handlers::ingest_membership_event),
        )
        .route_layer(middleware::from_fn_with_state(
            events_limit,
            enforce_rate_limit,
        ))
        .with_state(state);

    // Merge routes and apply global middleware layers
    // Layer order (bottom-to-top execution):
    // 1. TimeoutLayer - Timeout the request (innermost)
    // 2. TraceLayer - Log request details
    // 3. http_metrics_middleware - Record ALL responses (outermost)
    operational_routes
        .merge(metrics_routes)
        .merge(page_routes)
        .merge(submit_routes)
        .merge(event_routes)
        .layer(TraceLayer::new_for_http())
        .layer(TimeoutLayer::new(Duration::from_secs(30)))
        .layer(middleware::from_fn(http_metrics_middleware))
}
