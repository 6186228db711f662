//! Audit log repository.
//!
//! Audit writes are fire-and-forget: failures are logged at warn level and
//! never block the verification flow. Retention pruning runs from the
//! reconciliation sweep.

use crate::errors::GkError;
use common::types::{GroupId, MemberId};
use sqlx::PgPool;
use tracing::{instrument, warn};

/// Audit actions recorded by the Gatekeeper.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuditAction {
    MemberJoined,
    MemberLeft,
    MemberVerified,
    MemberKicked,
    MemberBanned,
    VerificationFailed,
    VerificationExpired,
}

impl AuditAction {
    /// Canonical string form (stored in the database).
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            AuditAction::MemberJoined => "member_joined",
            AuditAction::MemberLeft => "member_left",
            AuditAction::MemberVerified => "member_verified",
            AuditAction::MemberKicked => "member_kicked",
            AuditAction::MemberBanned => "member_banned",
            AuditAction::VerificationFailed => "verification_failed",
            AuditAction::VerificationExpired => "verification_expired",
        }
    }
}

/// A single audit event.
#[derive(Debug, Clone)]
pub struct AuditEvent {
    pub group_id: GroupId,
    pub member_id: Option<MemberId>,
    pub action: AuditAction,
    pub details: String,
    pub ip: Option<String>,
}

/// Audit log repository.
pub struct AuditRepository;

impl AuditRepository {
    /// Record an audit event. Fire-and-forget: failures are logged at warn
    /// level and swallowed so they never block the core flow.
    #[instrument(skip_all, fields(group_id = %event.group_id, action = event.action.as_str()))]
    pub async fn record(pool: &PgPool, event: &AuditEvent) {
        let result = sqlx::query(
            "INSERT INTO audit_log (group_id, member_id, action, details, ip) \
             VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(event.group_id.0)
        .bind(event.member_id.map(|m| m.0))
        .bind(event.action.as_str())
        .bind(&event.details)
        .bind(event.ip.as_deref())
        .execute(pool)
        .await;

        if let Err(e) = result {
            warn!(
                target: "gk.audit",
                error = %e,
                action = event.action.as_str(),
                "Failed to record audit event"
            );
        }
    }

    /// Delete audit rows older than `retention_days`. Returns the number
    /// deleted.
    ///
    /// # Errors
    ///
    /// Returns `GkError::Database` on query failure.
    #[instrument(skip_all)]
    pub async fn prune_older_than(pool: &PgPool, retention_days: i32) -> Result<u64, GkError> {
        let result = sqlx::query(
            "DELETE FROM audit_log WHERE created_at < NOW() - make_interval(days => $1)",
        )
        .bind(retention_days)
        .execute(pool)
        .await
        .map_err(|e| GkError::Database(e.to_string()))?;

        Ok(result.rows_affected())
    }
}

/// Integration tests requiring a database.
#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod integration_tests {
    use super::*;

    #[sqlx::test(migrations = "../../migrations")]
    async fn test_record_inserts_event(pool: PgPool) {
        let event = AuditEvent {
            group_id: GroupId(-4001),
            member_id: Some(MemberId(5)),
            action: AuditAction::MemberVerified,
            details: "Verification completed successfully".to_string(),
            ip: Some("1.2.3.4".to_string()),
        };

        AuditRepository::record(&pool, &event).await;

        let count: (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM audit_log WHERE group_id = $1 AND action = 'member_verified'",
        )
        .bind(-4001_i64)
        .fetch_one(&pool)
        .await
        .unwrap();
        assert_eq!(count.0, 1);
    }

    #[sqlx::test(migrations = "../../migrations")]
    async fn test_prune_deletes_only_old_rows(pool: PgPool) {
        let event = AuditEvent {
            group_id: GroupId(-4001),
            member_id: None,
            action: AuditAction::MemberJoined,
            details: "joined".to_string(),
            ip: None,
        };
        AuditRepository::record(&pool, &event).await;

        // Backdate one row beyond the retention window
        sqlx::query(
            "INSERT INTO audit_log (group_id, member_id, action, details, created_at) \
             VALUES ($1, NULL, 'member_left', 'old', NOW() - INTERVAL '120 days')",
        )
        .bind(-4001_i64)
        .execute(&pool)
        .await
        .unwrap();

        let pruned = AuditRepository::prune_older_than(&pool, 90).await.unwrap();
        assert_eq!(pruned, 1);

        let remaining: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM audit_log")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(remaining.0, 1);
    }
}
