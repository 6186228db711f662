//! HTTP middleware.

pub mod http_metrics;
pub mod rate_limit;

pub use http_metrics::http_metrics_middleware;
pub use rate_limit::{enforce_rate_limit, RateLimitState};
