//! Gatekeeper error types.
//!
//! All errors map to appropriate HTTP status codes via the `IntoResponse`
//! impl. Error messages returned to clients are intentionally generic and
//! actionable; internal details are logged server-side.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

/// Gatekeeper error type.
///
/// Maps to HTTP status codes:
/// - `Database`, `Redis`, `ChatApi`, `Internal`: 500 Internal Server Error
/// - `InvalidToken`: 401 Unauthorized
/// - `SessionNotFound`, `SessionNotPending`, `SessionExpired`,
///   `ChallengeFailed`, `BadRequest`: 400 Bad Request
/// - `TooManyAttempts`, `RateLimited`: 429 Too Many Requests
/// - `ServiceUnavailable`: 503 Service Unavailable
#[derive(Debug, Error)]
pub enum GkError {
    /// Database operation failed.
    #[error("Database error: {0}")]
    Database(String),

    /// Redis operation failed (rate-limit counter store).
    #[error("Redis error: {0}")]
    Redis(String),

    /// Messaging-API call failed.
    #[error("Chat API error: {0}")]
    ChatApi(String),

    /// Verification token rejected (bad signature, malformed, expired).
    #[error("Invalid verification token")]
    InvalidToken,

    /// No session matches the token.
    #[error("Session not found")]
    SessionNotFound,

    /// Session exists but is no longer pending.
    #[error("Session is not pending")]
    SessionNotPending,

    /// Session deadline has passed.
    #[error("Session expired")]
    SessionExpired,

    /// Attempt bound reached; the session is terminally failed.
    #[error("Too many verification attempts")]
    TooManyAttempts,

    /// Challenge proof rejected by the provider.
    #[error("Challenge verification failed")]
    ChallengeFailed,

    /// Sliding-window quota exceeded.
    #[error("Rate limit exceeded")]
    RateLimited,

    /// Malformed request.
    #[error("Bad request: {0}")]
    BadRequest(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Dependency unavailable.
    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),

    /// Internal error with context.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl GkError {
    /// Returns the HTTP status code for this error (for metrics recording).
    #[must_use]
    pub fn status_code(&self) -> u16 {
        match self {
            GkError::Database(_)
            | GkError::Redis(_)
            | GkError::ChatApi(_)
            | GkError::Config(_)
            | GkError::Internal(_) => 500,
            GkError::InvalidToken => 401,
            GkError::SessionNotFound
            | GkError::SessionNotPending
            | GkError::SessionExpired
            | GkError::ChallengeFailed
            | GkError::BadRequest(_) => 400,
            GkError::TooManyAttempts | GkError::RateLimited => 429,
            GkError::ServiceUnavailable(_) => 503,
        }
    }

    /// Returns a bounded label string for the error variant (for metrics).
    ///
    /// Uses enum variant names, not error message content, so label
    /// cardinality stays bounded.
    #[must_use]
    pub fn error_type_label(&self) -> &'static str {
        match self {
            GkError::Database(_) => "database",
            GkError::Redis(_) => "redis",
            GkError::ChatApi(_) => "chat_api",
            GkError::InvalidToken => "invalid_token",
            GkError::SessionNotFound => "session_not_found",
            GkError::SessionNotPending => "session_not_pending",
            GkError::SessionExpired => "session_expired",
            GkError::TooManyAttempts => "too_many_attempts",
            GkError::ChallengeFailed => "challenge_failed",
            GkError::RateLimited => "rate_limited",
            GkError::BadRequest(_) => "bad_request",
            GkError::Config(_) => "config",
            GkError::ServiceUnavailable(_) => "service_unavailable",
            GkError::Internal(_) => "internal",
        }
    }

    /// Returns a client-safe, actionable message (no internal details).
    #[must_use]
    pub fn client_message(&self) -> String {
        match self {
            GkError::Database(_)
            | GkError::Redis(_)
            | GkError::ChatApi(_)
            | GkError::Config(_)
            | GkError::Internal(_) => "An internal error occurred. Please try again.".to_string(),
            GkError::InvalidToken => {
                "The verification link is invalid or expired. Please return to the group and request a new one.".to_string()
            }
            GkError::SessionNotFound | GkError::SessionNotPending => {
                "This verification session does not exist or is already completed.".to_string()
            }
            GkError::SessionExpired => {
                "Verification has expired. Please return to the group and request a new link.".to_string()
            }
            GkError::TooManyAttempts => "Too many attempts. You have been removed from the group.".to_string(),
            GkError::ChallengeFailed => "Challenge verification failed. Please try again.".to_string(),
            GkError::RateLimited => "Too many requests. Please try again later.".to_string(),
            GkError::BadRequest(reason) => reason.clone(),
            GkError::ServiceUnavailable(_) => "Service temporarily unavailable".to_string(),
        }
    }
}

#[derive(Serialize)]
struct ErrorResponse {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

impl IntoResponse for GkError {
    fn into_response(self) -> Response {
        // Log internal failures server-side; the client sees only the
        // generic message.
        match &self {
            GkError::Database(err) => {
                tracing::error!(target: "gk.database", error = %err, "Database operation failed");
            }
            GkError::Redis(err) => {
                tracing::error!(target: "gk.redis", error = %err, "Redis operation failed");
            }
            GkError::ChatApi(err) => {
                tracing::error!(target: "gk.chat_api", error = %err, "Messaging API call failed");
            }
            GkError::ServiceUnavailable(reason) => {
                tracing::warn!(target: "gk.availability", reason = %reason, "Service unavailable");
            }
            _ => {}
        }

        let status = StatusCode::from_u16(self.status_code())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

        let error_response = ErrorResponse {
            error: ErrorDetail {
                code: self.error_type_label().to_uppercase(),
                message: self.client_message(),
            },
        };

        (status, Json(error_response)).into_response()
    }
}

impl From<sqlx::Error> for GkError {
    fn from(err: sqlx::Error) -> Self {
        GkError::Database(err.to_string())
    }
}

impl From<common::token::TokenError> for GkError {
    fn from(_: common::token::TokenError) -> Self {
        GkError::InvalidToken
    }
}
