//! Health check handlers.
//!
//! Provides health check endpoints for Kubernetes liveness and readiness
//! probes.
//!
//! - `/health`: Liveness probe - returns OK if the process is running
//! - `/ready`: Readiness probe - checks dependencies (Postgres, Redis)

use crate::models::ReadinessResponse;
use crate::routes::AppState;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use std::sync::Arc;

/// Liveness probe handler.
///
/// Returns a simple "OK" response to indicate the process is running.
/// Does NOT check any dependencies - failure means the process is
/// hung/deadlocked.
pub async fn health_check() -> &'static str {
    "OK"
}

/// Readiness probe handler.
///
/// Checks critical dependencies to determine if the service can handle
/// traffic. Returns 200 if ready, 503 if not ready.
///
/// ## Checks
///
/// 1. Postgres connectivity - can execute a simple query
/// 2. Redis connectivity - counter store answers PING
///
/// ## Security
///
/// Error messages are intentionally generic to avoid leaking
/// infrastructure details. Actual errors are logged server-side.
#[tracing::instrument(skip_all, name = "gk.health.readiness")]
pub async fn readiness_check(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    // Check 1: database connectivity
    if let Err(e) = sqlx::query("SELECT 1").fetch_one(&state.pool).await {
        tracing::warn!("Readiness check failed: database error: {}", e);
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(ReadinessResponse {
                status: "not_ready",
                database: Some("unhealthy"),
                redis: None,
                error: Some("Service dependencies unavailable".to_string()),
            }),
        );
    }

    // Check 2: counter store connectivity
    if let Err(e) = state.limiter.ping().await {
        tracing::warn!("Readiness check failed: redis error: {}", e);
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(ReadinessResponse {
                status: "not_ready",
                database: Some("healthy"),
                redis: Some("unhealthy"),
                error: Some("Service dependencies unavailable".to_string()),
            }),
        );
    }

    (
        StatusCode::OK,
        Json(ReadinessResponse {
            status: "ready",
            database: Some("healthy"),
            redis: Some("healthy"),
            error: None,
        }),
    )
}
