//! HTTP handlers.

mod events;
mod health;
mod metrics;
mod verify;

pub use events::ingest_membership_event;
pub use health::{health_check, readiness_check};
pub use metrics::metrics_handler;
pub use verify::{submit_verification, verify_page};
