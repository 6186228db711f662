//! Signed verification token codec.
//!
//! Verification links embed a compact, tamper-evident token binding
//! (member, group, session) with an absolute expiry:
//!
//! - **Format**: `base64url(json_claims) "." hex(signature)`
//! - **Signature**: `HMAC-SHA256(secret, base64url(json_claims))`
//! - **Validation**: constant-time comparison via `ring::hmac::verify`
//!
//! The token is the sole authorization artifact presented by the browser
//! flow; nothing else supplied by the client is trusted.
//!
//! # Security
//!
//! - Tokens are size-checked BEFORE any decoding (DoS prevention)
//! - Signature verification happens before the payload is parsed
//! - Error messages are generic to prevent information leakage; detail is
//!   logged at debug level
//! - Secret rotation is out of scope; a single static 32-byte secret is
//!   assumed for the process lifetime

use crate::types::{GroupId, MemberId, SessionId};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use ring::hmac;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Maximum allowed token size in bytes (8KB).
///
/// Typical tokens are ~250 bytes (claims + 64 hex signature chars); the
/// bound rejects oversized inputs before base64 decoding or HMAC work.
pub const MAX_TOKEN_SIZE_BYTES: usize = 8192;

/// Minimum signing-secret length in bytes.
pub const MIN_SECRET_BYTES: usize = 32;

/// Errors that can occur during token validation.
///
/// Note: Error messages are intentionally identical and generic to prevent
/// information leakage. Detailed causes are logged at debug level.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TokenError {
    /// Token size exceeds maximum allowed.
    #[error("The verification link is invalid or expired")]
    TokenTooLarge,

    /// Token format is invalid (wrong structure, bad base64/hex/JSON).
    #[error("The verification link is invalid or expired")]
    Malformed,

    /// Signature does not match the payload.
    #[error("The verification link is invalid or expired")]
    InvalidSignature,

    /// The encoded expiry is in the past.
    #[error("The verification link is invalid or expired")]
    Expired,
}

/// Claims carried by a verification token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenClaims {
    /// Member the verification link was issued to.
    pub member_id: MemberId,

    /// Group the member is verifying for.
    pub group_id: GroupId,

    /// Session the link is bound to.
    pub session_id: SessionId,

    /// Expiration timestamp (Unix epoch seconds).
    pub exp: i64,
}

/// Signed verification token codec.
///
/// Holds the process-wide signing key. Cheap to clone; construct once from
/// configuration and share.
#[derive(Clone)]
pub struct TokenCodec {
    key: hmac::Key,
}

impl TokenCodec {
    /// Create a new codec with the given signing secret.
    ///
    /// # Arguments
    ///
    /// * `secret` - Must be at least 32 bytes.
    ///
    /// # Panics
    ///
    /// Panics if `secret` is shorter than [`MIN_SECRET_BYTES`] (security
    /// requirement; configuration validates the length before this point).
    #[must_use]
    pub fn new(secret: &[u8]) -> Self {
        assert!(
            secret.len() >= MIN_SECRET_BYTES,
            "Token signing secret must be at least 32 bytes"
        );
        Self {
            key: hmac::Key::new(hmac::HMAC_SHA256, secret),
        }
    }

    /// Issue a token binding (member, group, session) with the given TTL.
    ///
    /// The expiry is absolute (`now + ttl`, Unix epoch seconds). The
    /// returned string is URL-safe and can be embedded in a query
    /// parameter without further encoding.
    #[must_use]
    #[allow(clippy::cast_possible_wrap)] // TTLs are minutes-scale, far below i64::MAX seconds
    pub fn issue(
        &self,
        member_id: MemberId,
        group_id: GroupId,
        session_id: SessionId,
        ttl: Duration,
    ) -> String {
        let exp = chrono::Utc::now().timestamp() + ttl.as_secs() as i64;
        self.issue_with_expiry(member_id, group_id, session_id, exp)
    }

    /// Issue a token with an explicit expiry timestamp.
    ///
    /// Prefer [`TokenCodec::issue`] in production code. This variant exists
    /// so that expiry boundaries can be unit-tested without wall-clock
    /// dependence.
    #[must_use]
    pub fn issue_with_expiry(
        &self,
        member_id: MemberId,
        group_id: GroupId,
        session_id: SessionId,
        exp: i64,
    ) -> String {
        let claims = TokenClaims {
            member_id,
            group_id,
            session_id,
            exp,
        };

        // Serialization of a plain struct with integer/UUID fields cannot
        // fail; fall back to an empty payload (which can never verify)
        // rather than panicking.
        let json = serde_json::to_vec(&claims).unwrap_or_default();
        let payload = URL_SAFE_NO_PAD.encode(json);
        let tag = hmac::sign(&self.key, payload.as_bytes());

        format!("{payload}.{}", hex::encode(tag.as_ref()))
    }

    /// Validate a token and return its claims.
    ///
    /// Checks, in order: size bound, structure, signature (constant time),
    /// payload decoding, expiry. A token is accepted iff the signature
    /// matches and `now <= exp`.
    ///
    /// # Errors
    ///
    /// Returns a [`TokenError`] variant describing the first check that
    /// failed. All variants render the same client-facing message.
    pub fn verify(&self, token: &str) -> Result<TokenClaims, TokenError> {
        self.verify_at(token, chrono::Utc::now().timestamp())
    }

    /// Deterministic validation against an explicit `now` timestamp.
    ///
    /// Prefer [`TokenCodec::verify`] in production code.
    pub fn verify_at(&self, token: &str, now: i64) -> Result<TokenClaims, TokenError> {
        // Check token size first (DoS prevention)
        if token.len() > MAX_TOKEN_SIZE_BYTES {
            tracing::debug!(
                target: "common.token",
                token_size = token.len(),
                max_size = MAX_TOKEN_SIZE_BYTES,
                "Token rejected: size exceeds maximum allowed"
            );
            return Err(TokenError::TokenTooLarge);
        }

        // Format: payload.signature
        let (payload, signature_hex) = token.split_once('.').ok_or_else(|| {
            tracing::debug!(target: "common.token", "Token rejected: missing separator");
            TokenError::Malformed
        })?;

        let signature = hex::decode(signature_hex).map_err(|e| {
            tracing::debug!(target: "common.token", error = %e, "Token rejected: signature is not hex");
            TokenError::Malformed
        })?;

        // Constant-time comparison: hmac::verify re-computes the tag and
        // compares via constant-time eq.
        hmac::verify(&self.key, payload.as_bytes(), &signature).map_err(|_| {
            tracing::debug!(target: "common.token", "Token rejected: signature mismatch");
            TokenError::InvalidSignature
        })?;

        // Signature is authentic; now the payload can be trusted enough to parse.
        let json = URL_SAFE_NO_PAD.decode(payload).map_err(|e| {
            tracing::debug!(target: "common.token", error = %e, "Token rejected: payload is not base64url");
            TokenError::Malformed
        })?;

        let claims: TokenClaims = serde_json::from_slice(&json).map_err(|e| {
            tracing::debug!(target: "common.token", error = %e, "Token rejected: payload is not valid claims JSON");
            TokenError::Malformed
        })?;

        if claims.exp < now {
            tracing::debug!(
                target: "common.token",
                exp = claims.exp,
                now = now,
                "Token rejected: expired"
            );
            return Err(TokenError::Expired);
        }

        Ok(claims)
    }
}
