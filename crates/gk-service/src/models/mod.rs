//! Domain models and API types for the Gatekeeper.
//!
//! Session status and the post-timeout action are closed enums (never
//! free-form strings) so invalid states are unrepresentable; the database
//! stores their canonical string forms.

use chrono::{DateTime, Utc};
use common::types::{GroupId, MemberId, SessionId};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Attempt bound: the 5th rejected attempt drives the session to `failed`
/// and removes the member.
pub const MAX_VERIFICATION_ATTEMPTS: i32 = 5;

/// Default welcome template. Placeholders: `{user_name}`, `{group_name}`,
/// `{ttl}` (seconds).
pub const DEFAULT_WELCOME_TEMPLATE: &str = "Hello {user_name}! Welcome to {group_name}.\n\
You need to complete verification within {ttl} seconds to lift the posting restriction.\n\
Members who do not verify in time are removed.";

// ============================================================================
// Session state machine
// ============================================================================

/// Verification session status.
///
/// `Pending` is the only non-terminal state; no transitions leave a
/// terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Pending,
    Verified,
    Expired,
    Failed,
    Cancelled,
}

impl SessionStatus {
    /// Canonical string form (stored in the database).
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Pending => "pending",
            SessionStatus::Verified => "verified",
            SessionStatus::Expired => "expired",
            SessionStatus::Failed => "failed",
            SessionStatus::Cancelled => "cancelled",
        }
    }

    /// Whether this status is terminal.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        !matches!(self, SessionStatus::Pending)
    }

    /// The state-machine transition law: `pending` may move to any
    /// terminal state; terminal states admit no transitions.
    #[must_use]
    pub fn can_transition_to(&self, next: SessionStatus) -> bool {
        matches!(self, SessionStatus::Pending) && next.is_terminal()
    }
}

impl FromStr for SessionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(SessionStatus::Pending),
            "verified" => Ok(SessionStatus::Verified),
            "expired" => Ok(SessionStatus::Expired),
            "failed" => Ok(SessionStatus::Failed),
            "cancelled" => Ok(SessionStatus::Cancelled),
            other => Err(format!("unknown session status: {other}")),
        }
    }
}

/// Action taken when a session's deadline fires while still pending.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PostTimeoutAction {
    /// Keep the join-time restriction in place (the member stays muted).
    Mute,
    /// Remove the member, allowing rejoin later.
    Kick,
}

impl PostTimeoutAction {
    /// Canonical string form (stored in the database).
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            PostTimeoutAction::Mute => "mute",
            PostTimeoutAction::Kick => "kick",
        }
    }
}

impl FromStr for PostTimeoutAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "mute" => Ok(PostTimeoutAction::Mute),
            "kick" => Ok(PostTimeoutAction::Kick),
            other => Err(format!("unknown post-timeout action: {other}")),
        }
    }
}

// ============================================================================
// Persistence rows
// ============================================================================

/// A verification session row.
#[derive(Debug, Clone)]
pub struct SessionRow {
    pub session_id: SessionId,
    pub member_id: MemberId,
    pub group_id: GroupId,
    pub status: SessionStatus,
    /// Welcome message to delete once the session resolves.
    pub welcome_message_id: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub verified_at: Option<DateTime<Utc>>,
    pub attempt_count: i32,
    /// Client network origin, captured only on successful verification.
    pub user_ip: Option<String>,
    pub user_agent: Option<String>,
}

impl SessionRow {
    /// Whether the deadline has passed relative to `now`.
    #[must_use]
    pub fn is_overdue(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }
}

/// Per-group verification settings.
///
/// Read once per event; the Gatekeeper never mutates group identity data.
#[derive(Debug, Clone)]
pub struct GroupSettings {
    pub group_id: GroupId,
    pub verification_enabled: bool,
    pub ttl_minutes: i32,
    pub post_timeout_action: PostTimeoutAction,
    pub welcome_template: String,
    pub admin_bypass: bool,
    pub rate_limit_per_minute: i32,
    pub delete_welcome_message: bool,
}

impl GroupSettings {
    /// Settings used when a group has no stored row yet.
    #[must_use]
    pub fn defaults_for(group_id: GroupId) -> Self {
        Self {
            group_id,
            verification_enabled: true,
            ttl_minutes: 10,
            post_timeout_action: PostTimeoutAction::Mute,
            welcome_template: DEFAULT_WELCOME_TEMPLATE.to_string(),
            admin_bypass: false,
            rate_limit_per_minute: 10,
            delete_welcome_message: true,
        }
    }
}

/// Member profile as delivered by the membership-event source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemberProfile {
    pub member_id: MemberId,
    pub display_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default)]
    pub is_bot: bool,
}

// ============================================================================
// Membership events (wire format)
// ============================================================================

/// Membership status reported by the event source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemberStatus {
    Member,
    Admin,
    Owner,
    Restricted,
    Left,
    Kicked,
    NotMember,
}

impl MemberStatus {
    /// Active statuses count as being in the group.
    #[must_use]
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            MemberStatus::Member
                | MemberStatus::Admin
                | MemberStatus::Owner
                | MemberStatus::Restricted
        )
    }
}

/// One side of a membership transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemberState {
    pub status: MemberStatus,
    /// Explicit membership flag, when the source provides one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_member: Option<bool>,
    /// Whether the state grants the send-message capability.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub can_send_messages: Option<bool>,
}

/// A raw membership transition tuple delivered by the event source.
///
/// Delivery may be duplicated or reordered within a bounded window; the
/// classifier and debouncer compensate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MembershipTransition {
    pub member: MemberProfile,
    pub group_id: GroupId,
    #[serde(default)]
    pub group_title: Option<String>,
    pub previous: MemberState,
    pub new: MemberState,
    pub timestamp: DateTime<Utc>,
}

// ============================================================================
// HTTP API types
// ============================================================================

/// Body of `POST /api/v1/verify`.
#[derive(Debug, Clone, Deserialize)]
pub struct VerifyRequest {
    pub token: String,
    pub challenge_proof: String,
}

/// Response of `POST /api/v1/verify`.
#[derive(Debug, Clone, Serialize)]
pub struct VerifyResponse {
    pub success: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub redirect_url: Option<String>,
}

/// Context returned by `GET /verify` for the (externally rendered)
/// challenge page.
#[derive(Debug, Clone, Serialize)]
pub struct ChallengePageContext {
    pub group_name: String,
    pub member_name: String,
    pub remaining_minutes: i64,
    pub site_key: String,
}

/// Response body for the readiness probe.
#[derive(Debug, Serialize)]
pub struct ReadinessResponse {
    pub status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub database: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub redis: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Render a welcome template, substituting the supported placeholders.
#[must_use]
pub fn render_welcome(template: &str, user_name: &str, group_name: &str, ttl_seconds: i64) -> String {
    template
        .replace("{user_name}", user_name)
        .replace("{group_name}", group_name)
        .replace("{ttl}", &ttl_seconds.to_string())
}
