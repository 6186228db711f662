//! Service-layer collaborators and the verification orchestrator.

pub mod challenge;
pub mod chat_api;
pub mod verification;

pub use challenge::{ChallengeVerdict, ChallengeVerifier, TurnstileVerifier};
pub use chat_api::{ChatApi, HttpChatApi};
pub use verification::VerificationService;
