//! Metrics definitions for the Gatekeeper.
//!
//! All metrics follow Prometheus naming conventions:
//! - `gk_` prefix for the Gatekeeper
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//!
//! # Cardinality
//!
//! Labels are bounded to prevent cardinality explosion:
//! - `method`: standard HTTP verbs
//! - `endpoint`: parameterized paths only (see [`normalize_endpoint`])
//! - `status`: success / error / timeout
//! - `event`, `transition`, `outcome`: bounded by code

use metrics::{counter, histogram};
use std::time::Duration;

// ============================================================================
// HTTP Request Metrics
// ============================================================================

/// Record HTTP request completion.
///
/// Metric: `gk_http_requests_total`, `gk_http_request_duration_seconds`
/// Labels: `method`, `endpoint`, `status` / `status_code`
pub fn record_http_request(method: &str, endpoint: &str, status_code: u16, duration: Duration) {
    let normalized_endpoint = normalize_endpoint(endpoint);
    let status = categorize_status_code(status_code);

    histogram!("gk_http_request_duration_seconds",
        "method" => method.to_string(),
        "endpoint" => normalized_endpoint.clone(),
        "status" => status.to_string()
    )
    .record(duration.as_secs_f64());

    counter!("gk_http_requests_total",
        "method" => method.to_string(),
        "endpoint" => normalized_endpoint,
        "status_code" => status_code.to_string()
    )
    .increment(1);
}

/// Categorize HTTP status code into success/error/timeout.
fn categorize_status_code(status_code: u16) -> &'static str {
    match status_code {
        200..=299 => "success",
        408 | 504 => "timeout",
        _ => "error",
    }
}

/// Normalize endpoint path to prevent label cardinality explosion.
fn normalize_endpoint(path: &str) -> String {
    match path {
        "/" | "/health" | "/ready" | "/metrics" | "/verify" | "/api/v1/verify"
        | "/api/v1/events/membership" => path.to_string(),
        // Unknown paths normalized to "/other" to bound cardinality
        _ => "/other".to_string(),
    }
}

// ============================================================================
// Verification flow metrics
// ============================================================================

/// Record a verification submission outcome.
///
/// Metric: `gk_verifications_total`, `gk_verification_duration_seconds`
/// Labels: `outcome` (bounded by `GkError::error_type_label` + "verified")
pub fn record_verification(outcome: &str, duration: Duration) {
    histogram!("gk_verification_duration_seconds",
        "outcome" => outcome.to_string()
    )
    .record(duration.as_secs_f64());

    counter!("gk_verifications_total",
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Record a session state-machine transition.
///
/// Metric: `gk_session_transitions_total`
/// Labels: `transition` ∈ {created, verified, expired, failed, cancelled}
pub fn record_session_transition(transition: &'static str) {
    counter!("gk_session_transitions_total",
        "transition" => transition
    )
    .increment(1);
}

/// Record a classified (or debounced) membership event.
///
/// Metric: `gk_membership_events_total`
/// Labels: `event` ∈ {joined, left, needs_check, none, debounced}
pub fn record_membership_event(event: &'static str) {
    counter!("gk_membership_events_total",
        "event" => event
    )
    .increment(1);
}

/// Record a rate-limit decision.
///
/// Metric: `gk_rate_limit_decisions_total`
/// Labels: `scope`, `decision` ∈ {allowed, rejected, failopen}
pub fn record_rate_limit(scope: &'static str, decision: &'static str) {
    counter!("gk_rate_limit_decisions_total",
        "scope" => scope,
        "decision" => decision
    )
    .increment(1);
}

/// Record sessions expired by the reconciliation sweep.
///
/// Metric: `gk_sweep_expired_sessions_total`
pub fn record_sweep(expired: usize) {
    counter!("gk_sweep_expired_sessions_total").increment(expired as u64);
}

// ============================================================================
// Database metrics
// ============================================================================

/// Record a repository query.
///
/// Metric: `gk_db_queries_total`, `gk_db_query_duration_seconds`
/// Labels: `operation` (bounded by code), `status`
pub fn record_db_query(operation: &'static str, status: &'static str, duration: Duration) {
    histogram!("gk_db_query_duration_seconds",
        "operation" => operation
    )
    .record(duration.as_secs_f64());

    counter!("gk_db_queries_total",
        "operation" => operation,
        "status" => status
    )
    .increment(1);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_categorization() {
        assert_eq!(categorize_status_code(200), "success");
        assert_eq!(categorize_status_code(204), "success");
        assert_eq!(categorize_status_code(400), "error");
        assert_eq!(categorize_status_code(429), "error");
        assert_eq!(categorize_status_code(500), "error");
        assert_eq!(categorize_status_code(408), "timeout");
        assert_eq!(categorize_status_code(504), "timeout");
    }

    #[test]
    fn test_known_endpoints_pass_through() {
        assert_eq!(normalize_endpoint("/health"), "/health");
        assert_eq!(normalize_endpoint("/verify"), "/verify");
        assert_eq!(normalize_endpoint("/api/v1/verify"), "/api/v1/verify");
        assert_eq!(
            normalize_endpoint("/api/v1/events/membership"),
            "/api/v1/events/membership"
        );
    }

    #[test]
    fn test_unknown_endpoints_are_bounded() {
        assert_eq!(normalize_endpoint("/api/v1/whatever/123"), "/other");
        assert_eq!(normalize_endpoint("/admin"), "/other");
    }
}
