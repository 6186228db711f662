//! End-to-end verification flow tests.
//!
//! Exercise the orchestrator against a real database with mock messaging
//! and challenge collaborators: join -> session -> verify/expire/fail.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use async_trait::async_trait;
use chrono::Utc;
use common::secret::SecretString;
use common::token::TokenCodec;
use common::types::{GroupId, MemberId, MessageId};
use gk_service::errors::GkError;
use gk_service::models::{
    MemberProfile, MemberState, MemberStatus, MembershipTransition, SessionStatus,
};
use gk_service::repositories::{AccessListsRepository, ListKind, SessionsRepository};
use gk_service::services::challenge::{ChallengeVerdict, ChallengeVerifier};
use gk_service::services::chat_api::ChatApi;
use gk_service::services::VerificationService;
use sqlx::PgPool;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex};

const TOKEN_SECRET: [u8; 32] = [7u8; 32];
const MEMBER: MemberId = MemberId(501);
const GROUP: GroupId = GroupId(-9001);

/// Recording mock of the messaging API.
#[derive(Default)]
struct RecordingChatApi {
    calls: Mutex<Vec<String>>,
    next_message_id: AtomicI64,
}

impl RecordingChatApi {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            calls: Mutex::new(Vec::new()),
            next_message_id: AtomicI64::new(100),
        })
    }

    fn record(&self, call: impl Into<String>) {
        self.calls.lock().unwrap().push(call.into());
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn called(&self, name: &str) -> bool {
        self.calls().iter().any(|c| c.starts_with(name))
    }
}

#[async_trait]
impl ChatApi for RecordingChatApi {
    async fn restrict(&self, group_id: GroupId, member_id: MemberId) -> Result<(), GkError> {
        self.record(format!("restrict:{group_id}:{member_id}"));
        Ok(())
    }

    async fn lift_restrictions(
        &self,
        group_id: GroupId,
        member_id: MemberId,
    ) -> Result<(), GkError> {
        self.record(format!("lift_restrictions:{group_id}:{member_id}"));
        Ok(())
    }

    async fn remove_and_allow_rejoin(
        &self,
        group_id: GroupId,
        member_id: MemberId,
    ) -> Result<(), GkError> {
        self.record(format!("remove:{group_id}:{member_id}"));
        Ok(())
    }

    async fn ban(&self, group_id: GroupId, member_id: MemberId) -> Result<(), GkError> {
        self.record(format!("ban:{group_id}:{member_id}"));
        Ok(())
    }

    async fn send_group_message(
        &self,
        group_id: GroupId,
        _text: &str,
    ) -> Result<MessageId, GkError> {
        self.record(format!("send_group_message:{group_id}"));
        Ok(MessageId(self.next_message_id.fetch_add(1, Ordering::SeqCst)))
    }

    async fn delete_message(
        &self,
        group_id: GroupId,
        message_id: MessageId,
    ) -> Result<(), GkError> {
        self.record(format!("delete_message:{group_id}:{message_id}"));
        Ok(())
    }

    async fn send_direct_message(&self, member_id: MemberId, _text: &str) -> Result<(), GkError> {
        self.record(format!("send_direct_message:{member_id}"));
        Ok(())
    }
}

/// Challenge mock with a switchable verdict.
struct ScriptedChallenge {
    succeed: AtomicBool,
}

impl ScriptedChallenge {
    fn passing() -> Arc<Self> {
        Arc::new(Self {
            succeed: AtomicBool::new(true),
        })
    }

    fn failing() -> Arc<Self> {
        Arc::new(Self {
            succeed: AtomicBool::new(false),
        })
    }
}

#[async_trait]
impl ChallengeVerifier for ScriptedChallenge {
    async fn verify(&self, _proof: &str, _remote_ip: Option<&str>) -> ChallengeVerdict {
        ChallengeVerdict {
            success: self.succeed.load(Ordering::SeqCst),
            error_codes: Vec::new(),
        }
    }
}

fn service(
    pool: &PgPool,
    chat: Arc<RecordingChatApi>,
    challenge: Arc<dyn ChallengeVerifier>,
) -> Arc<VerificationService> {
    Arc::new(VerificationService::new(
        pool.clone(),
        chat,
        challenge,
        TokenCodec::new(&TOKEN_SECRET),
        "http://localhost:8080".to_string(),
        "test-site-key".to_string(),
    ))
}

fn join_transition(member_id: MemberId) -> MembershipTransition {
    MembershipTransition {
        member: MemberProfile {
            member_id,
            display_name: "Alice".to_string(),
            username: Some("alice".to_string()),
            is_bot: false,
        },
        group_id: GROUP,
        group_title: Some("Rustaceans".to_string()),
        previous: MemberState {
            status: MemberStatus::Left,
            is_member: Some(false),
            can_send_messages: None,
        },
        new: MemberState {
            status: MemberStatus::Member,
            is_member: Some(true),
            can_send_messages: None,
        },
        timestamp: Utc::now(),
    }
}

fn leave_transition(member_id: MemberId) -> MembershipTransition {
    let mut transition = join_transition(member_id);
    transition.previous = MemberState {
        status: MemberStatus::Restricted,
        is_member: Some(true),
        can_send_messages: Some(false),
    };
    transition.new = MemberState {
        status: MemberStatus::Left,
        is_member: Some(false),
        can_send_messages: None,
    };
    transition
}

/// Issue the verification token the welcome link would carry.
fn token_for(session_id: common::types::SessionId) -> String {
    TokenCodec::new(&TOKEN_SECRET).issue(
        MEMBER,
        GROUP,
        session_id,
        std::time::Duration::from_secs(600),
    )
}

// ============================================================================
// Scenario A: join with verification enabled
// ============================================================================

#[sqlx::test(migrations = "../../migrations")]
async fn test_join_creates_pending_session_and_sends_welcome(pool: PgPool) {
    let chat = RecordingChatApi::new();
    let service = service(&pool, Arc::clone(&chat), ScriptedChallenge::passing());

    service
        .handle_transition(&join_transition(MEMBER))
        .await
        .expect("join should be processed");

    let session = SessionsRepository::find_pending(&pool, MEMBER, GROUP)
        .await
        .unwrap()
        .expect("a pending session should exist");

    assert_eq!(session.status, SessionStatus::Pending);
    assert_eq!(session.attempt_count, 0);

    // Expiry is ~10 minutes out (the default TTL)
    let remaining = session.expires_at - Utc::now();
    assert!(remaining > chrono::Duration::minutes(9));
    assert!(remaining <= chrono::Duration::minutes(10));

    // The member was restricted and the welcome message was sent and linked
    assert!(chat.called("restrict:"));
    assert!(chat.called("send_group_message:"));
    assert!(session.welcome_message_id.is_some());
}

#[sqlx::test(migrations = "../../migrations")]
async fn test_bot_join_is_ignored(pool: PgPool) {
    let chat = RecordingChatApi::new();
    let service = service(&pool, Arc::clone(&chat), ScriptedChallenge::passing());

    let mut transition = join_transition(MEMBER);
    transition.member.is_bot = true;

    service.handle_transition(&transition).await.unwrap();

    assert!(SessionsRepository::find_pending(&pool, MEMBER, GROUP)
        .await
        .unwrap()
        .is_none());
    assert!(chat.calls().is_empty());
}

// ============================================================================
// Scenario B: blacklisted member
// ============================================================================

#[sqlx::test(migrations = "../../migrations")]
async fn test_blacklisted_member_is_banned_without_session(pool: PgPool) {
    AccessListsRepository::add(
        &pool,
        ListKind::Blacklist,
        MEMBER,
        GROUP,
        MemberId(1),
        Some("spam"),
    )
    .await
    .unwrap();

    let chat = RecordingChatApi::new();
    let service = service(&pool, Arc::clone(&chat), ScriptedChallenge::passing());

    service
        .handle_transition(&join_transition(MEMBER))
        .await
        .unwrap();

    assert!(chat.called("ban:"));
    assert!(!chat.called("send_group_message:"));
    assert!(SessionsRepository::find_pending(&pool, MEMBER, GROUP)
        .await
        .unwrap()
        .is_none());
}

// ============================================================================
// Scenario C: successful verification before expiry
// ============================================================================

#[sqlx::test(migrations = "../../migrations")]
async fn test_valid_submission_verifies_and_unrestricts(pool: PgPool) {
    let chat = RecordingChatApi::new();
    let service = service(&pool, Arc::clone(&chat), ScriptedChallenge::passing());

    service
        .handle_transition(&join_transition(MEMBER))
        .await
        .unwrap();
    let session = SessionsRepository::find_pending(&pool, MEMBER, GROUP)
        .await
        .unwrap()
        .unwrap();

    let response = service
        .submit(
            &token_for(session.session_id),
            "valid-proof",
            Some("198.51.100.7"),
            Some("integration-test"),
        )
        .await
        .expect("submission should succeed");

    assert!(response.success);
    assert!(response.redirect_url.is_some());

    let row = SessionsRepository::find(&pool, session.session_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(row.status, SessionStatus::Verified);
    assert!(row.verified_at.is_some());
    assert_eq!(row.user_ip.as_deref(), Some("198.51.100.7"));
    assert_eq!(row.attempt_count, 1);

    // Restriction lifted, welcome message deleted
    assert!(chat.called("lift_restrictions:"));
    assert!(chat.called("delete_message:"));

    // A second submission against the now-terminal session is rejected
    let second = service
        .submit(&token_for(session.session_id), "valid-proof", None, None)
        .await;
    assert!(matches!(second, Err(GkError::SessionNotPending)));
}

#[sqlx::test(migrations = "../../migrations")]
async fn test_tampered_token_is_rejected_without_mutation(pool: PgPool) {
    let chat = RecordingChatApi::new();
    let service = service(&pool, Arc::clone(&chat), ScriptedChallenge::passing());

    service
        .handle_transition(&join_transition(MEMBER))
        .await
        .unwrap();
    let session = SessionsRepository::find_pending(&pool, MEMBER, GROUP)
        .await
        .unwrap()
        .unwrap();

    let mut token = token_for(session.session_id);
    token.push('x');

    let result = service.submit(&token, "valid-proof", None, None).await;
    assert!(matches!(result, Err(GkError::InvalidToken)));

    // No state mutation: still pending, no attempt recorded
    let row = SessionsRepository::find(&pool, session.session_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(row.status, SessionStatus::Pending);
    assert_eq!(row.attempt_count, 0);
}

// ============================================================================
// Scenario D: deadline fires with no verification attempt
// ============================================================================

#[sqlx::test(migrations = "../../migrations")]
async fn test_deadline_expires_session_and_kicks(pool: PgPool) {
    let chat = RecordingChatApi::new();
    let service = service(&pool, Arc::clone(&chat), ScriptedChallenge::passing());

    service
        .handle_transition(&join_transition(MEMBER))
        .await
        .unwrap();
    let session = SessionsRepository::find_pending(&pool, MEMBER, GROUP)
        .await
        .unwrap()
        .unwrap();

    // Configure removal on timeout and force the deadline into the past
    sqlx::query("UPDATE group_settings SET post_timeout_action = 'kick' WHERE group_id = $1")
        .bind(GROUP.0)
        .execute(&pool)
        .await
        .unwrap();
    sqlx::query(
        "UPDATE join_sessions SET expires_at = NOW() - INTERVAL '1 second' \
         WHERE session_id = $1",
    )
    .bind(session.session_id.0)
    .execute(&pool)
    .await
    .unwrap();

    service.expire_session(session.session_id).await.unwrap();

    let row = SessionsRepository::find(&pool, session.session_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(row.status, SessionStatus::Expired);
    assert!(chat.called("remove:"));
}

#[sqlx::test(migrations = "../../migrations")]
async fn test_deadline_is_noop_after_verification(pool: PgPool) {
    let chat = RecordingChatApi::new();
    let service = service(&pool, Arc::clone(&chat), ScriptedChallenge::passing());

    service
        .handle_transition(&join_transition(MEMBER))
        .await
        .unwrap();
    let session = SessionsRepository::find_pending(&pool, MEMBER, GROUP)
        .await
        .unwrap()
        .unwrap();

    service
        .submit(&token_for(session.session_id), "valid-proof", None, None)
        .await
        .unwrap();

    // A late deadline wake-up must not disturb the verified session
    service.expire_session(session.session_id).await.unwrap();

    let row = SessionsRepository::find(&pool, session.session_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(row.status, SessionStatus::Verified);
    assert!(!chat.called("remove:"));
}

// ============================================================================
// Scenario E: attempt bound
// ============================================================================

#[sqlx::test(migrations = "../../migrations")]
async fn test_five_failed_attempts_fail_the_session_and_remove(pool: PgPool) {
    let chat = RecordingChatApi::new();
    let service = service(&pool, Arc::clone(&chat), ScriptedChallenge::failing());

    service
        .handle_transition(&join_transition(MEMBER))
        .await
        .unwrap();
    let session = SessionsRepository::find_pending(&pool, MEMBER, GROUP)
        .await
        .unwrap()
        .unwrap();
    let token = token_for(session.session_id);

    // Four rejected attempts: challenge failures, session stays pending
    for _ in 0..4 {
        let result = service.submit(&token, "bad-proof", None, None).await;
        assert!(matches!(result, Err(GkError::ChallengeFailed)));
    }

    // The fifth rejected attempt is terminal
    let fifth = service.submit(&token, "bad-proof", None, None).await;
    assert!(matches!(fifth, Err(GkError::TooManyAttempts)));

    let row = SessionsRepository::find(&pool, session.session_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(row.status, SessionStatus::Failed);
    assert_eq!(row.attempt_count, 5);
    assert!(chat.called("remove:"));

    // Further attempts are rejected without reviving the session
    let sixth = service.submit(&token, "bad-proof", None, None).await;
    assert!(matches!(sixth, Err(GkError::SessionNotPending)));
}

// ============================================================================
// Duplicate / out-of-order event handling
// ============================================================================

#[sqlx::test(migrations = "../../migrations")]
async fn test_duplicate_join_events_are_debounced(pool: PgPool) {
    let chat = RecordingChatApi::new();
    let service = service(&pool, Arc::clone(&chat), ScriptedChallenge::passing());

    // Same pair, delivered back to back: the second is discarded
    service
        .handle_transition(&join_transition(MEMBER))
        .await
        .unwrap();
    service
        .handle_transition(&join_transition(MEMBER))
        .await
        .unwrap();

    let count: (i64,) = sqlx::query_as(
        "SELECT COUNT(*) FROM join_sessions WHERE member_id = $1 AND group_id = $2",
    )
    .bind(MEMBER.0)
    .bind(GROUP.0)
    .fetch_one(&pool)
    .await
    .unwrap();
    assert_eq!(count.0, 1, "the duplicate must not create a second session");
}

#[sqlx::test(migrations = "../../migrations")]
async fn test_late_duplicate_join_from_another_instance_supersedes(pool: PgPool) {
    // Two service instances (separate debounce maps and guards) simulate a
    // multi-instance deployment receiving the same join twice
    let chat_a = RecordingChatApi::new();
    let chat_b = RecordingChatApi::new();
    let instance_a = service(&pool, Arc::clone(&chat_a), ScriptedChallenge::passing());
    let instance_b = service(&pool, Arc::clone(&chat_b), ScriptedChallenge::passing());

    instance_a
        .handle_transition(&join_transition(MEMBER))
        .await
        .unwrap();
    let first = SessionsRepository::find_pending(&pool, MEMBER, GROUP)
        .await
        .unwrap()
        .unwrap();

    instance_b
        .handle_transition(&join_transition(MEMBER))
        .await
        .unwrap();
    let second = SessionsRepository::find_pending(&pool, MEMBER, GROUP)
        .await
        .unwrap()
        .unwrap();

    // The newer create cancelled the older pending session
    assert_ne!(first.session_id, second.session_id);
    let old = SessionsRepository::find(&pool, first.session_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(old.status, SessionStatus::Cancelled);
}

#[sqlx::test(migrations = "../../migrations")]
async fn test_leave_cancels_pending_session(pool: PgPool) {
    let chat = RecordingChatApi::new();
    let instance_a = service(&pool, Arc::clone(&chat), ScriptedChallenge::passing());
    // Second instance so the leave is not debounced away with the join
    let instance_b = service(&pool, Arc::clone(&chat), ScriptedChallenge::passing());

    instance_a
        .handle_transition(&join_transition(MEMBER))
        .await
        .unwrap();
    let session = SessionsRepository::find_pending(&pool, MEMBER, GROUP)
        .await
        .unwrap()
        .unwrap();

    instance_b
        .handle_transition(&leave_transition(MEMBER))
        .await
        .unwrap();

    let row = SessionsRepository::find(&pool, session.session_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(row.status, SessionStatus::Cancelled);
    assert!(chat.called("delete_message:"));
}
