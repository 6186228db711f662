//! Browser verification handlers.
//!
//! - `GET /verify?token=…` - resolves a token into the challenge-page
//!   context (the page itself is rendered externally)
//! - `POST /api/v1/verify` - the verification-submission contract:
//!   `{token, challenge_proof}` in, `{success, message, redirect_url?}` out
//!
//! Both routes sit behind the sliding-window rate-limit middleware.

use crate::errors::GkError;
use crate::models::{ChallengePageContext, VerifyRequest, VerifyResponse};
use crate::routes::AppState;
use axum::extract::{ConnectInfo, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::Json;
use serde::Deserialize;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::instrument;

/// Query string of `GET /verify`.
#[derive(Debug, Deserialize)]
pub struct VerifyPageQuery {
    token: String,
}

/// Handler for GET /verify
///
/// Validates the signed token and returns the context the challenge page
/// renders from. Rejections use the standard error envelope.
#[instrument(
    skip_all,
    name = "gk.verify.page",
    fields(method = "GET", endpoint = "/verify")
)]
pub async fn verify_page(
    State(state): State<Arc<AppState>>,
    Query(query): Query<VerifyPageQuery>,
) -> Result<Json<ChallengePageContext>, GkError> {
    let context = state.verification.page_context(&query.token).await?;
    Ok(Json(context))
}

/// Handler for POST /api/v1/verify
///
/// The verification-submission contract. The response always has the
/// `{success, message, redirect_url?}` shape; failures carry the matching
/// HTTP status and an actionable message, never internal detail.
#[instrument(
    skip_all,
    name = "gk.verify.submit",
    fields(method = "POST", endpoint = "/api/v1/verify")
)]
pub async fn submit_verification(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    body: axum::body::Bytes,
) -> (StatusCode, Json<VerifyResponse>) {
    // Deserialize manually to return 400 (not Axum's default 422)
    let request: VerifyRequest = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(e) => {
            tracing::debug!(target: "gk.handlers.verify", error = %e, "Invalid request body");
            return reject(&GkError::BadRequest("Invalid request body".to_string()));
        }
    };

    let remote_ip = client_ip(&headers, connect_info.as_ref());
    let user_agent = headers
        .get("user-agent")
        .and_then(|v| v.to_str().ok())
        .map(ToString::to_string);

    match state
        .verification
        .submit(
            &request.token,
            &request.challenge_proof,
            remote_ip.as_deref(),
            user_agent.as_deref(),
        )
        .await
    {
        Ok(response) => (StatusCode::OK, Json(response)),
        Err(e) => reject(&e),
    }
}

/// Map an error into the submission contract's failure shape.
fn reject(error: &GkError) -> (StatusCode, Json<VerifyResponse>) {
    let status =
        StatusCode::from_u16(error.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (
        status,
        Json(VerifyResponse {
            success: false,
            message: error.client_message(),
            redirect_url: None,
        }),
    )
}

/// Caller origin: first `X-Forwarded-For` hop, else the socket peer.
fn client_ip(headers: &HeaderMap, connect_info: Option<&ConnectInfo<SocketAddr>>) -> Option<String> {
    if let Some(forwarded) = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
    {
        if let Some(first) = forwarded.split(',').next() {
            let first = first.trim();
            if !first.is_empty() {
                return Some(first.to_string());
            }
        }
    }

    connect_info.map(|info| info.0.ip().to_string())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_reject_shapes_match_the_contract() {
        let (status, Json(body)) = reject(&GkError::InvalidToken);
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert!(!body.success);
        assert!(body.redirect_url.is_none());
        assert!(!body.message.is_empty());
    }

    #[test]
    fn test_reject_rate_limited_is_429() {
        let (status, Json(body)) = reject(&GkError::TooManyAttempts);
        assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
        assert!(!body.success);
    }

    #[test]
    fn test_client_ip_prefers_forwarded_header() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", "198.51.100.7, 10.0.0.1".parse().unwrap());
        let peer = ConnectInfo(SocketAddr::from(([192, 0, 2, 1], 4000)));

        assert_eq!(
            client_ip(&headers, Some(&peer)).as_deref(),
            Some("198.51.100.7")
        );
    }

    #[test]
    fn test_client_ip_without_any_source() {
        assert_eq!(client_ip(&HeaderMap::new(), None), None);
    }
}
