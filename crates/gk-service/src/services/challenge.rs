//! Proof-of-humanity challenge collaborator.
//!
//! The browser flow submits a challenge proof alongside the signed token;
//! the Gatekeeper forwards the proof to the provider for validation and
//! trusts only the provider's verdict. `ChallengeVerifier` is the trait
//! seam; `TurnstileVerifier` speaks the Cloudflare Turnstile siteverify
//! protocol (form-encoded request, JSON verdict).

use crate::errors::GkError;
use async_trait::async_trait;
use common::secret::{ExposeSecret, SecretString};
use serde::Deserialize;
use std::time::Duration;
use tracing::{instrument, warn};

/// Default timeout for provider calls in seconds.
const CHALLENGE_TIMEOUT_SECS: u64 = 10;

/// Challenge-provider verdict.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChallengeVerdict {
    pub success: bool,
    /// Provider error codes, for logging only.
    pub error_codes: Vec<String>,
}

/// Validates browser-supplied challenge proofs.
#[async_trait]
pub trait ChallengeVerifier: Send + Sync {
    /// Validate a proof, optionally forwarding the client's network origin.
    ///
    /// Provider outages surface as a failed verdict, never as an error:
    /// a proof that cannot be validated is not accepted.
    async fn verify(&self, proof: &str, remote_ip: Option<&str>) -> ChallengeVerdict;
}

/// siteverify response body.
#[derive(Debug, Deserialize)]
struct SiteverifyResponse {
    success: bool,
    #[serde(default, rename = "error-codes")]
    error_codes: Vec<String>,
}

/// Cloudflare Turnstile implementation of [`ChallengeVerifier`].
pub struct TurnstileVerifier {
    http: reqwest::Client,
    verify_url: String,
    secret_key: SecretString,
}

impl TurnstileVerifier {
    /// Create a new verifier.
    #[must_use]
    pub fn new(verify_url: String, secret_key: SecretString) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(CHALLENGE_TIMEOUT_SECS))
            .build()
            .unwrap_or_default();

        Self {
            http,
            verify_url,
            secret_key,
        }
    }
}

#[async_trait]
impl ChallengeVerifier for TurnstileVerifier {
    #[instrument(skip_all)]
    async fn verify(&self, proof: &str, remote_ip: Option<&str>) -> ChallengeVerdict {
        let mut form = vec![
            ("secret", self.secret_key.expose_secret().to_string()),
            ("response", proof.to_string()),
        ];
        if let Some(ip) = remote_ip {
            form.push(("remoteip", ip.to_string()));
        }

        let response = match self.http.post(&self.verify_url).form(&form).send().await {
            Ok(response) => response,
            Err(e) => {
                warn!(target: "gk.challenge", error = %e, "Challenge provider unreachable");
                return ChallengeVerdict {
                    success: false,
                    error_codes: vec!["internal-error".to_string()],
                };
            }
        };

        match response.json::<SiteverifyResponse>().await {
            Ok(body) => {
                if !body.success {
                    warn!(
                        target: "gk.challenge",
                        error_codes = ?body.error_codes,
                        "Challenge verification failed"
                    );
                }
                ChallengeVerdict {
                    success: body.success,
                    error_codes: body.error_codes,
                }
            }
            Err(e) => {
                warn!(target: "gk.challenge", error = %e, "Challenge provider returned invalid body");
                ChallengeVerdict {
                    success: false,
                    error_codes: vec!["internal-error".to_string()],
                }
            }
        }
    }
}

/// The verdict as a `GkError` when rejected.
impl ChallengeVerdict {
    /// Convert a failed verdict into the user-facing rejection.
    ///
    /// # Errors
    ///
    /// Returns `GkError::ChallengeFailed` when the verdict is negative.
    pub fn into_result(self) -> Result<(), GkError> {
        if self.success {
            Ok(())
        } else {
            Err(GkError::ChallengeFailed)
        }
    }
}
