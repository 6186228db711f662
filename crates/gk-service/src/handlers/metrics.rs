//! Prometheus metrics exposition handler.

use axum::extract::State;
use metrics_exporter_prometheus::PrometheusHandle;

/// Handler for GET /metrics
///
/// Renders the Prometheus exposition format from the recorder installed at
/// startup.
pub async fn metrics_handler(State(handle): State<PrometheusHandle>) -> String {
    handle.render()
}
