//! Join-verification orchestrator.
//!
//! Entry point for every classified membership event and for the browser
//! verification flow. Consults group settings, the blacklist and the
//! admin-bypass flag, drives the session state machine, arms the per
//! session deadline and performs the messaging side effects.
//!
//! # Ordering & idempotency
//!
//! - The debouncer discards duplicate events per (member, group) before
//!   anything else runs.
//! - The single-flight guard drops re-entrant "new member" invocations;
//!   it is an optimization only. Correctness comes from the conditional
//!   transitions in the sessions repository: of any number of racing
//!   callers, exactly one commits each terminal transition.
//! - The expire transition is committed before the removal side effect is
//!   attempted, so a crash in between still leaves a terminal state for
//!   any retrying observer.

use crate::errors::GkError;
use crate::events::{classify, Classification, Debouncer, SingleFlight};
use crate::models::{
    render_welcome, ChallengePageContext, GroupSettings, MemberProfile, MemberStatus,
    MembershipTransition, PostTimeoutAction, SessionRow, SessionStatus, VerifyResponse,
    MAX_VERIFICATION_ATTEMPTS,
};
use crate::observability::metrics;
use crate::repositories::{
    AccessListsRepository, AuditAction, AuditEvent, AuditRepository, GroupSettingsRepository,
    MembersRepository, SessionsRepository,
};
use crate::services::challenge::ChallengeVerifier;
use crate::services::chat_api::ChatApi;
use chrono::Utc;
use common::token::TokenCodec;
use common::types::{GroupId, MemberId, MessageId, SessionId};
use sqlx::PgPool;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info, instrument, warn};

/// Join-verification orchestrator.
pub struct VerificationService {
    pool: PgPool,
    chat: Arc<dyn ChatApi>,
    challenge: Arc<dyn ChallengeVerifier>,
    codec: TokenCodec,
    debouncer: Debouncer,
    guard: SingleFlight,
    public_base_url: String,
    challenge_site_key: String,
}

impl VerificationService {
    /// Create the orchestrator.
    #[must_use]
    pub fn new(
        pool: PgPool,
        chat: Arc<dyn ChatApi>,
        challenge: Arc<dyn ChallengeVerifier>,
        codec: TokenCodec,
        public_base_url: String,
        challenge_site_key: String,
    ) -> Self {
        Self {
            pool,
            chat,
            challenge,
            codec,
            debouncer: Debouncer::new(),
            guard: SingleFlight::new(),
            public_base_url,
            challenge_site_key,
        }
    }

    /// Database pool handle (shared with the reconciliation sweep).
    #[must_use]
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    // ========================================================================
    // Membership event flow
    // ========================================================================

    /// Process one raw membership transition.
    ///
    /// Duplicates inside the debounce window are silently dropped (not an
    /// error). Classified events dispatch to the join/leave flows.
    ///
    /// # Errors
    ///
    /// Returns `GkError` on persistence failure; external-call failures
    /// inside the flows are logged and absorbed.
    #[instrument(skip_all, fields(member_id = %transition.member.member_id, group_id = %transition.group_id))]
    pub async fn handle_transition(
        self: &Arc<Self>,
        transition: &MembershipTransition,
    ) -> Result<(), GkError> {
        let member_id = transition.member.member_id;
        let group_id = transition.group_id;

        // Debounce before classification: duplicates are discarded
        // unconditionally, whatever they would have classified as
        if !self.debouncer.observe(member_id, group_id) {
            metrics::record_membership_event("debounced");
            return Ok(());
        }

        MembersRepository::upsert(&self.pool, &transition.member).await?;
        GroupSettingsRepository::ensure_exists(
            &self.pool,
            group_id,
            transition.group_title.as_deref(),
        )
        .await?;

        let has_pending = SessionsRepository::find_pending(&self.pool, member_id, group_id)
            .await?
            .is_some();

        match classify(&transition.previous, &transition.new, has_pending) {
            Classification::Joined => {
                metrics::record_membership_event("joined");
                self.process_joined(&transition.member, group_id, transition.new.status)
                    .await
            }
            Classification::Left => {
                metrics::record_membership_event("left");
                self.process_left(&transition.member, group_id).await
            }
            Classification::StillRestrictedNeedsCheck => {
                metrics::record_membership_event("needs_check");
                // Restriction exists but no session does; run the join flow
                // to create one
                self.process_joined(&transition.member, group_id, transition.new.status)
                    .await
            }
            Classification::None => {
                metrics::record_membership_event("none");
                Ok(())
            }
        }
    }

    /// The "new member" critical section.
    #[instrument(skip_all, fields(member_id = %member.member_id, group_id = %group_id))]
    async fn process_joined(
        self: &Arc<Self>,
        member: &MemberProfile,
        group_id: GroupId,
        new_status: MemberStatus,
    ) -> Result<(), GkError> {
        let member_id = member.member_id;

        // Bots are never challenged
        if member.is_bot {
            info!(
                target: "gk.verification",
                member_id = %member_id,
                "Bot joined, skipping verification"
            );
            return Ok(());
        }

        let settings = GroupSettingsRepository::get(&self.pool, group_id).await?;

        AuditRepository::record(
            &self.pool,
            &AuditEvent {
                group_id,
                member_id: Some(member_id),
                action: AuditAction::MemberJoined,
                details: format!("{} joined the group", member.display_name),
                ip: None,
            },
        )
        .await;

        if !settings.verification_enabled {
            return Ok(());
        }

        // Blacklisted members are banned outright; no session is created
        if AccessListsRepository::is_blacklisted(&self.pool, member_id, group_id).await? {
            if let Err(e) = self.chat.ban(group_id, member_id).await {
                error!(target: "gk.verification", error = %e, "Failed to ban blacklisted member");
            }
            AuditRepository::record(
                &self.pool,
                &AuditEvent {
                    group_id,
                    member_id: Some(member_id),
                    action: AuditAction::MemberBanned,
                    details: "Member is blacklisted".to_string(),
                    ip: None,
                },
            )
            .await;
            return Ok(());
        }

        // Administrators may be exempt per group settings
        if settings.admin_bypass
            && matches!(new_status, MemberStatus::Admin | MemberStatus::Owner)
        {
            AuditRepository::record(
                &self.pool,
                &AuditEvent {
                    group_id,
                    member_id: Some(member_id),
                    action: AuditAction::MemberVerified,
                    details: "Admin bypass".to_string(),
                    ip: None,
                },
            )
            .await;
            return Ok(());
        }

        // Restrict first so the member cannot post while the session is
        // being set up
        if let Err(e) = self.chat.restrict(group_id, member_id).await {
            error!(target: "gk.verification", error = %e, "Failed to apply restrictions");
        }

        // Single-flight: a concurrent invocation for this pair is already
        // creating the session
        if !self.guard.try_begin(member_id, group_id) {
            return Ok(());
        }

        let result = self.create_session_and_invite(member, group_id, &settings).await;
        self.guard.finish(member_id, group_id);
        result
    }

    /// Create the session, send the invite and arm the deadline.
    async fn create_session_and_invite(
        self: &Arc<Self>,
        member: &MemberProfile,
        group_id: GroupId,
        settings: &GroupSettings,
    ) -> Result<(), GkError> {
        let session = SessionsRepository::create(
            &self.pool,
            member.member_id,
            group_id,
            settings.ttl_minutes,
        )
        .await?;
        metrics::record_session_transition("created");

        let ttl_seconds = i64::from(settings.ttl_minutes) * 60;
        let group_name = GroupSettingsRepository::get_title(&self.pool, group_id)
            .await?
            .unwrap_or_else(|| "the group".to_string());

        let welcome = render_welcome(
            &settings.welcome_template,
            &member.display_name,
            &group_name,
            ttl_seconds,
        );
        let link = self.verification_url(member.member_id, group_id, session.session_id, ttl_seconds);
        let text = format!("{welcome}\n\nVerify here: {link}");

        match self.chat.send_group_message(group_id, &text).await {
            Ok(message_id) => {
                SessionsRepository::set_welcome_message(
                    &self.pool,
                    session.session_id,
                    message_id.0,
                )
                .await?;
            }
            Err(e) => {
                // The session stays live; the deadline still enforces the
                // time bound even without the invite message
                error!(target: "gk.verification", error = %e, "Failed to send welcome message");
            }
        }

        self.arm_deadline(&session);
        Ok(())
    }

    /// The "member left" flow: cancel any live session and clean up.
    #[instrument(skip_all, fields(member_id = %member.member_id, group_id = %group_id))]
    async fn process_left(
        self: &Arc<Self>,
        member: &MemberProfile,
        group_id: GroupId,
    ) -> Result<(), GkError> {
        let member_id = member.member_id;

        if let Some(session) =
            SessionsRepository::find_pending(&self.pool, member_id, group_id).await?
        {
            let cancelled = SessionsRepository::mark_cancelled(&self.pool, session.session_id).await?;
            if cancelled {
                metrics::record_session_transition("cancelled");
                info!(
                    target: "gk.verification",
                    session_id = %session.session_id,
                    "Cancelled pending session for leaving member"
                );
                self.delete_welcome_message(&session).await;
            }
        }

        AuditRepository::record(
            &self.pool,
            &AuditEvent {
                group_id,
                member_id: Some(member_id),
                action: AuditAction::MemberLeft,
                details: format!("{} left the group", member.display_name),
                ip: None,
            },
        )
        .await;

        Ok(())
    }

    // ========================================================================
    // Deadline scheduling
    // ========================================================================

    /// Arm the one-shot deadline timer for a session.
    ///
    /// The timer is an in-memory optimization: it is lost on restart, and
    /// the reconciliation sweep picks up any session it missed. The fire
    /// path re-checks status, so a session that verified or cancelled in
    /// the meantime makes the wake-up a no-op.
    pub fn arm_deadline(self: &Arc<Self>, session: &SessionRow) {
        let service = Arc::clone(self);
        let session_id = session.session_id;
        let fire_at = session.expires_at;

        tokio::spawn(async move {
            let now = Utc::now();
            if fire_at > now {
                let wait = (fire_at - now)
                    .to_std()
                    .unwrap_or(Duration::ZERO);
                tokio::time::sleep(wait).await;
            }

            if let Err(e) = service.expire_session(session_id).await {
                error!(
                    target: "gk.verification.deadline",
                    session_id = %session_id,
                    error = %e,
                    "Deadline processing failed"
                );
            }
        });
    }

    /// Drive a session to `expired` and perform the post-timeout action.
    ///
    /// Idempotent: the conditional transition makes this a no-op when the
    /// session already left `pending` (verified, cancelled, or expired by
    /// a concurrent sweep). The transition commits before any external
    /// call is attempted.
    ///
    /// # Errors
    ///
    /// Returns `GkError` on persistence failure.
    #[instrument(skip_all, fields(session_id = %session_id))]
    pub async fn expire_session(self: &Arc<Self>, session_id: SessionId) -> Result<(), GkError> {
        let Some(session) = SessionsRepository::find(&self.pool, session_id).await? else {
            return Ok(());
        };
        if session.status != SessionStatus::Pending {
            return Ok(());
        }

        // Fire-time status re-check is the conditional update itself: only
        // one caller observes true
        if !SessionsRepository::mark_expired(&self.pool, session_id).await? {
            return Ok(());
        }
        metrics::record_session_transition("expired");

        self.finalize_expired(&session).await;
        Ok(())
    }

    /// Side effects for a session whose expire transition just committed.
    ///
    /// Shared by the in-memory deadline and the reconciliation sweep.
    /// Every step is best-effort: failures are logged and the remaining
    /// steps still run.
    pub async fn finalize_expired(self: &Arc<Self>, session: &SessionRow) {
        let settings = match GroupSettingsRepository::get(&self.pool, session.group_id).await {
            Ok(settings) => settings,
            Err(e) => {
                error!(target: "gk.verification", error = %e, "Failed to load settings for expiry");
                GroupSettings::defaults_for(session.group_id)
            }
        };

        match settings.post_timeout_action {
            PostTimeoutAction::Kick => {
                if let Err(e) = self
                    .chat
                    .remove_and_allow_rejoin(session.group_id, session.member_id)
                    .await
                {
                    // Removal is not retried here; the session stays expired
                    error!(target: "gk.verification", error = %e, "Failed to remove member on timeout");
                }
                AuditRepository::record(
                    &self.pool,
                    &AuditEvent {
                        group_id: session.group_id,
                        member_id: Some(session.member_id),
                        action: AuditAction::MemberKicked,
                        details: "Verification timeout".to_string(),
                        ip: None,
                    },
                )
                .await;
            }
            PostTimeoutAction::Mute => {
                // The join-time restriction is already in place; expiry
                // just makes it permanent until an admin intervenes
                AuditRepository::record(
                    &self.pool,
                    &AuditEvent {
                        group_id: session.group_id,
                        member_id: Some(session.member_id),
                        action: AuditAction::VerificationExpired,
                        details: "Verification timeout, member stays muted".to_string(),
                        ip: None,
                    },
                )
                .await;
            }
        }

        if let Err(e) = self
            .chat
            .send_group_message(
                session.group_id,
                "A member did not complete verification in time and was removed.",
            )
            .await
        {
            warn!(target: "gk.verification", error = %e, "Failed to send timeout notification");
        }

        if settings.delete_welcome_message {
            self.delete_welcome_message(session).await;
        }
    }

    // ========================================================================
    // Browser verification flow
    // ========================================================================

    /// Resolve a token into the challenge-page context.
    ///
    /// # Errors
    ///
    /// Returns `GkError::InvalidToken`, `SessionNotFound`,
    /// `SessionNotPending` or `SessionExpired` as user-facing rejections.
    #[instrument(skip_all)]
    pub async fn page_context(
        self: &Arc<Self>,
        token: &str,
    ) -> Result<ChallengePageContext, GkError> {
        let claims = self.codec.verify(token)?;
        let session = self.load_pending_session(claims.session_id).await?;

        let now = Utc::now();
        if session.is_overdue(now) {
            // Opportunistic expiry; attempts are not counted against a
            // session already determined to be expired
            self.expire_session(session.session_id).await?;
            return Err(GkError::SessionExpired);
        }

        let member_name = MembersRepository::find(&self.pool, session.member_id)
            .await?
            .map_or_else(|| "member".to_string(), |m| m.display_name);
        let group_name = GroupSettingsRepository::get_title(&self.pool, session.group_id)
            .await?
            .unwrap_or_else(|| "the group".to_string());

        let remaining_minutes = ((session.expires_at - now).num_seconds() + 59) / 60;

        Ok(ChallengePageContext {
            group_name,
            member_name,
            remaining_minutes,
            site_key: self.challenge_site_key.clone(),
        })
    }

    /// Process a verification submission from the browser flow.
    ///
    /// # Errors
    ///
    /// Returns user-facing `GkError` rejections; persistence failures as
    /// `GkError::Database`.
    #[instrument(skip_all)]
    pub async fn submit(
        self: &Arc<Self>,
        token: &str,
        challenge_proof: &str,
        remote_ip: Option<&str>,
        user_agent: Option<&str>,
    ) -> Result<VerifyResponse, GkError> {
        let start = Instant::now();
        let result = self
            .submit_inner(token, challenge_proof, remote_ip, user_agent)
            .await;

        match &result {
            Ok(_) => metrics::record_verification("verified", start.elapsed()),
            Err(e) => metrics::record_verification(e.error_type_label(), start.elapsed()),
        }
        result
    }

    async fn submit_inner(
        self: &Arc<Self>,
        token: &str,
        challenge_proof: &str,
        remote_ip: Option<&str>,
        user_agent: Option<&str>,
    ) -> Result<VerifyResponse, GkError> {
        let claims = self.codec.verify(token)?;
        let session = self.load_pending_session(claims.session_id).await?;

        // Expiry is checked (and committed) before the attempt is counted:
        // attempts against a dead session never walk it toward `failed`
        if session.is_overdue(Utc::now()) {
            self.expire_session(session.session_id).await?;
            return Err(GkError::SessionExpired);
        }

        // Attempt bound already reached on a still-pending session (e.g.,
        // racing submissions): fail terminally and remove
        if session.attempt_count >= MAX_VERIFICATION_ATTEMPTS {
            self.fail_session(&session, remote_ip).await?;
            return Err(GkError::TooManyAttempts);
        }

        // Attempts count unconditionally, whatever happens next
        let attempts = SessionsRepository::record_attempt(&self.pool, session.session_id).await?;

        let verdict = self.challenge.verify(challenge_proof, remote_ip).await;
        if !verdict.success {
            if attempts >= MAX_VERIFICATION_ATTEMPTS {
                self.fail_session(&session, remote_ip).await?;
                return Err(GkError::TooManyAttempts);
            }
            return Err(GkError::ChallengeFailed);
        }

        // Exactly-once verify: the conditional update decides the winner
        let verified = SessionsRepository::mark_verified(
            &self.pool,
            session.session_id,
            remote_ip,
            user_agent,
        )
        .await?;
        if !verified {
            // Lost a race with expiry or another submission; report the
            // session's current state
            return match SessionsRepository::find(&self.pool, session.session_id).await? {
                Some(row) if row.status == SessionStatus::Expired => Err(GkError::SessionExpired),
                _ => Err(GkError::SessionNotPending),
            };
        }
        metrics::record_session_transition("verified");

        // State transition is committed; everything below is best-effort
        if let Err(e) = self
            .chat
            .lift_restrictions(session.group_id, session.member_id)
            .await
        {
            error!(target: "gk.verification", error = %e, "Failed to lift restrictions");
        }

        self.delete_welcome_message(&session).await;

        AuditRepository::record(
            &self.pool,
            &AuditEvent {
                group_id: session.group_id,
                member_id: Some(session.member_id),
                action: AuditAction::MemberVerified,
                details: "Verification completed successfully".to_string(),
                ip: remote_ip.map(ToString::to_string),
            },
        )
        .await;

        if let Err(e) = self
            .chat
            .send_direct_message(
                session.member_id,
                "Verification successful! You can now post in the group.",
            )
            .await
        {
            warn!(target: "gk.verification", error = %e, "Failed to send success notification");
        }

        Ok(VerifyResponse {
            success: true,
            message: "Verification successful".to_string(),
            redirect_url: Some("/verify/success".to_string()),
        })
    }

    /// Terminal failure path: 5th rejected attempt. Commits `failed`, then
    /// removes the member.
    async fn fail_session(
        self: &Arc<Self>,
        session: &SessionRow,
        remote_ip: Option<&str>,
    ) -> Result<(), GkError> {
        let failed = SessionsRepository::mark_failed(&self.pool, session.session_id).await?;
        if !failed {
            return Ok(());
        }
        metrics::record_session_transition("failed");

        AuditRepository::record(
            &self.pool,
            &AuditEvent {
                group_id: session.group_id,
                member_id: Some(session.member_id),
                action: AuditAction::VerificationFailed,
                details: "Too many attempts".to_string(),
                ip: remote_ip.map(ToString::to_string),
            },
        )
        .await;

        if let Err(e) = self
            .chat
            .remove_and_allow_rejoin(session.group_id, session.member_id)
            .await
        {
            error!(target: "gk.verification", error = %e, "Failed to remove member after failed verification");
        }

        self.delete_welcome_message(session).await;
        Ok(())
    }

    // ========================================================================
    // Helpers
    // ========================================================================

    /// Load the session a token refers to, rejecting missing or
    /// already-terminal sessions.
    async fn load_pending_session(
        self: &Arc<Self>,
        session_id: SessionId,
    ) -> Result<SessionRow, GkError> {
        let session = SessionsRepository::find(&self.pool, session_id)
            .await?
            .ok_or(GkError::SessionNotFound)?;

        if session.status != SessionStatus::Pending {
            return Err(GkError::SessionNotPending);
        }
        Ok(session)
    }

    /// Build the browser verification link for a session.
    fn verification_url(
        &self,
        member_id: MemberId,
        group_id: GroupId,
        session_id: SessionId,
        ttl_seconds: i64,
    ) -> String {
        #[allow(clippy::cast_sign_loss)] // TTLs are positive minutes-scale values
        let ttl = Duration::from_secs(ttl_seconds.max(0) as u64);
        let token = self.codec.issue(member_id, group_id, session_id, ttl);
        format!("{}/verify?token={token}", self.public_base_url)
    }

    /// Best-effort deletion of a session's welcome message.
    async fn delete_welcome_message(&self, session: &SessionRow) {
        if let Some(message_id) = session.welcome_message_id {
            if let Err(e) = self
                .chat
                .delete_message(session.group_id, MessageId(message_id))
                .await
            {
                warn!(
                    target: "gk.verification",
                    session_id = %session.session_id,
                    error = %e,
                    "Could not delete welcome message"
                );
            }
        }
    }
}
