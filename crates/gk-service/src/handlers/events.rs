//! Membership-event webhook handler.
//!
//! `POST /api/v1/events/membership` ingests raw membership transition
//! tuples from the upstream event source. Duplicates and reordering within
//! a bounded window are expected; the debouncer and classifier absorb
//! them, so a debounced event is still a 202, never an error.

use crate::errors::GkError;
use crate::models::MembershipTransition;
use crate::routes::AppState;
use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde::Serialize;
use std::sync::Arc;
use tracing::instrument;

/// Response body for accepted events.
#[derive(Debug, Serialize)]
pub struct EventAccepted {
    pub accepted: bool,
}

/// Handler for POST /api/v1/events/membership
#[instrument(
    skip_all,
    name = "gk.events.ingest",
    fields(method = "POST", endpoint = "/api/v1/events/membership")
)]
pub async fn ingest_membership_event(
    State(state): State<Arc<AppState>>,
    body: axum::body::Bytes,
) -> Result<(StatusCode, Json<EventAccepted>), GkError> {
    // Deserialize manually to return 400 (not Axum's default 422)
    let transition: MembershipTransition = serde_json::from_slice(&body).map_err(|e| {
        tracing::debug!(target: "gk.handlers.events", error = %e, "Invalid event body");
        GkError::BadRequest("Invalid event body".to_string())
    })?;

    state.verification.handle_transition(&transition).await?;

    Ok((StatusCode::ACCEPTED, Json(EventAccepted { accepted: true })))
}
