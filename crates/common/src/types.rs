//! Common data types for Gatehouse components.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// External chat-platform identifier for a member.
///
/// Member ids are assigned by the messaging platform and treated as opaque
/// 64-bit integers; Gatehouse never generates them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MemberId(pub i64);

impl fmt::Display for MemberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// External chat-platform identifier for a group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GroupId(pub i64);

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier for a verification session.
///
/// Generated at session creation from a CSPRNG-backed UUID so that session
/// ids embedded in verification links are unguessable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(pub Uuid);

impl SessionId {
    /// Create a new random session ID
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Message identifier returned by the messaging API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageId(pub i64);

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_session_ids_are_unique() {
        let a = SessionId::new();
        let b = SessionId::new();
        assert_ne!(a, b);
    }

    #[test]
    fn test_member_id_display_matches_inner() {
        assert_eq!(MemberId(42).to_string(), "42");
        assert_eq!(GroupId(-1001234567890).to_string(), "-1001234567890");
    }

    #[test]
    fn test_ids_serialize_transparently_enough_for_keys() {
        let member = MemberId(7);
        let json = serde_json::to_string(&member).unwrap();
        let back: MemberId = serde_json::from_str(&json).unwrap();
        assert_eq!(member, back);
    }
}
