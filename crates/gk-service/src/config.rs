//! Gatekeeper service configuration.
//!
//! Configuration is loaded from environment variables. Sensitive fields are
//! wrapped in `SecretString` so they are redacted in Debug output.

use base64::{engine::general_purpose, Engine as _};
use common::secret::SecretString;
use std::collections::HashMap;
use std::env;
use std::fmt;
use thiserror::Error;

/// Default HTTP bind address.
pub const DEFAULT_BIND_ADDRESS: &str = "0.0.0.0:8080";

/// Default public base URL used to build verification links.
pub const DEFAULT_PUBLIC_BASE_URL: &str = "http://localhost:8080";

/// Default challenge-provider verification endpoint (Cloudflare Turnstile).
pub const DEFAULT_CHALLENGE_VERIFY_URL: &str =
    "https://challenges.cloudflare.com/turnstile/v0/siteverify";

/// Gatekeeper configuration.
///
/// Loaded from environment variables. Sensitive fields are redacted in
/// Debug output.
#[derive(Clone)]
pub struct Config {
    /// Postgres connection URL.
    pub database_url: String,

    /// Redis connection URL (rate-limit counters).
    /// Protected by `SecretString` to prevent accidental logging.
    pub redis_url: SecretString,

    /// HTTP bind address (default: "0.0.0.0:8080").
    pub bind_address: String,

    /// Public base URL embedded in verification links.
    pub public_base_url: String,

    /// 32-byte verification-token signing secret (decoded from base64).
    pub token_secret: Vec<u8>,

    /// Challenge-provider site key (public, embedded in the challenge page).
    pub challenge_site_key: String,

    /// Challenge-provider secret key.
    pub challenge_secret_key: SecretString,

    /// Challenge-provider verification endpoint.
    pub challenge_verify_url: String,

    /// Messaging-API base URL.
    pub chat_api_base_url: String,

    /// Messaging-API bot token.
    pub chat_api_token: SecretString,
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("database_url", &"[REDACTED]")
            .field("redis_url", &self.redis_url)
            .field("bind_address", &self.bind_address)
            .field("public_base_url", &self.public_base_url)
            .field("token_secret", &"[REDACTED]")
            .field("challenge_site_key", &self.challenge_site_key)
            .field("challenge_secret_key", &self.challenge_secret_key)
            .field("challenge_verify_url", &self.challenge_verify_url)
            .field("chat_api_base_url", &self.chat_api_base_url)
            .field("chat_api_token", &self.chat_api_token)
            .finish()
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid token secret: {0}")]
    InvalidTokenSecret(String),

    #[error("Base64 decode error: {0}")]
    Base64Error(#[from] base64::DecodeError),
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if a required variable is missing or the token
    /// secret is not 32 base64-decoded bytes.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(&env::vars().collect())
    }

    /// Load configuration from a `HashMap` (for testing).
    ///
    /// # Errors
    ///
    /// See [`Config::from_env`].
    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let database_url = vars
            .get("DATABASE_URL")
            .ok_or_else(|| ConfigError::MissingEnvVar("DATABASE_URL".to_string()))?
            .clone();

        let redis_url = vars
            .get("REDIS_URL")
            .ok_or_else(|| ConfigError::MissingEnvVar("REDIS_URL".to_string()))?
            .clone()
            .into();

        let bind_address = vars
            .get("GK_BIND_ADDRESS")
            .cloned()
            .unwrap_or_else(|| DEFAULT_BIND_ADDRESS.to_string());

        let public_base_url = vars
            .get("GK_PUBLIC_BASE_URL")
            .cloned()
            .unwrap_or_else(|| DEFAULT_PUBLIC_BASE_URL.to_string());

        let token_secret_base64 = vars
            .get("GK_TOKEN_SECRET")
            .ok_or_else(|| ConfigError::MissingEnvVar("GK_TOKEN_SECRET".to_string()))?;

        let token_secret = general_purpose::STANDARD
            .decode(token_secret_base64)
            .map_err(ConfigError::Base64Error)?;

        if token_secret.len() != 32 {
            return Err(ConfigError::InvalidTokenSecret(format!(
                "Expected 32 bytes, got {}",
                token_secret.len()
            )));
        }

        let challenge_site_key = vars
            .get("GK_CHALLENGE_SITE_KEY")
            .ok_or_else(|| ConfigError::MissingEnvVar("GK_CHALLENGE_SITE_KEY".to_string()))?
            .clone();

        let challenge_secret_key = vars
            .get("GK_CHALLENGE_SECRET_KEY")
            .ok_or_else(|| ConfigError::MissingEnvVar("GK_CHALLENGE_SECRET_KEY".to_string()))?
            .clone()
            .into();

        let challenge_verify_url = vars
            .get("GK_CHALLENGE_VERIFY_URL")
            .cloned()
            .unwrap_or_else(|| DEFAULT_CHALLENGE_VERIFY_URL.to_string());

        let chat_api_base_url = vars
            .get("GK_CHAT_API_BASE_URL")
            .ok_or_else(|| ConfigError::MissingEnvVar("GK_CHAT_API_BASE_URL".to_string()))?
            .clone();

        let chat_api_token = vars
            .get("GK_CHAT_API_TOKEN")
            .ok_or_else(|| ConfigError::MissingEnvVar("GK_CHAT_API_TOKEN".to_string()))?
            .clone()
            .into();

        Ok(Config {
            database_url,
            redis_url,
            bind_address,
            public_base_url,
            token_secret,
            challenge_site_key,
            challenge_secret_key,
            challenge_verify_url,
            chat_api_base_url,
            chat_api_token,
        })
    }
}
