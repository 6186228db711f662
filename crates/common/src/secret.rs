//! Secret types for protecting sensitive values from accidental logging.
//!
//! This module re-exports types from the [`secrecy`] crate with
//! Gatehouse-specific guidance. Use these types for all sensitive values
//! like signing secrets, API tokens, and connection strings that embed
//! credentials.
//!
//! # Compile-Time Safety
//!
//! `SecretBox<T>` and `SecretString` implement `Debug` with redaction, so any
//! code that derives `Debug` on a struct containing secrets automatically
//! gets safe logging behavior. This makes it **impossible** to accidentally
//! log secrets via `{:?}` or tracing.
//!
//! # Memory Safety
//!
//! Secrets are automatically zeroized when dropped, preventing sensitive
//! data from lingering in memory after use.
//!
//! # Gatehouse Usage Guidelines
//!
//! Use `SecretString` for:
//! - The verification-token signing secret (as a base64 string)
//! - Challenge-provider secret keys
//! - Messaging-API bot tokens
//! - Redis/Postgres URLs that may carry credentials
//!
//! # Example
//!
//! ```rust
//! use common::secret::SecretString;
//! use secrecy::ExposeSecret;
//!
//! #[derive(Debug)]
//! struct ProviderCredentials {
//!     site_key: String,
//!     secret_key: SecretString,  // Safe: Debug shows "[REDACTED]"
//! }
//!
//! let creds = ProviderCredentials {
//!     site_key: "0x4AAA".to_string(),
//!     secret_key: SecretString::from("hunter2"),
//! };
//!
//! // This is safe - secret_key is redacted
//! println!("{:?}", creds);
//!
//! // To access the actual value, you must explicitly call expose_secret()
//! let key: &str = creds.secret_key.expose_secret();
//! ```

// Re-export the main types from secrecy
pub use secrecy::{ExposeSecret, SecretBox, SecretString};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_debug_is_redacted() {
        let secret = SecretString::from("hunter2");
        let debug_str = format!("{secret:?}");

        assert!(debug_str.contains("REDACTED"));
        assert!(!debug_str.contains("hunter2"));
    }

    #[test]
    fn test_expose_secret_returns_inner_value() {
        let secret = SecretString::from("signing-secret");
        assert_eq!(secret.expose_secret(), "signing-secret");
    }

    #[test]
    fn test_struct_with_secret_is_safe() {
        #[allow(dead_code)]
        #[derive(Debug)]
        struct ProviderCredentials {
            site_key: String,
            secret_key: SecretString,
        }

        let creds = ProviderCredentials {
            site_key: "public-site-key".to_string(),
            secret_key: SecretString::from("super-secret"),
        };

        let debug_str = format!("{creds:?}");

        // Site key should be visible
        assert!(debug_str.contains("public-site-key"));
        // Secret key should be redacted
        assert!(debug_str.contains("REDACTED"));
        assert!(!debug_str.contains("super-secret"));
    }
}
