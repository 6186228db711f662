//! HTTP metrics middleware.
//!
//! Records every response, including framework-level errors (400/404/405)
//! that never reach a handler, so the request counters are complete.

use crate::observability::metrics;
use axum::{
    extract::Request,
    middleware::Next,
    response::Response,
};
use std::time::Instant;

/// Record method, endpoint, status and duration for every request.
pub async fn http_metrics_middleware(request: Request, next: Next) -> Response {
    let start = Instant::now();
    let method = request.method().to_string();
    let path = request.uri().path().to_string();

    let response = next.run(request).await;

    metrics::record_http_request(
        &method,
        &path,
        response.status().as_u16(),
        start.elapsed(),
    );

    response
}
