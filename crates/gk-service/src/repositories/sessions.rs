//! Verification session repository.
//!
//! All state-machine transitions execute as conditional updates
//! (`... WHERE status = 'pending'`), so `verify`, `expire` and `cancel`
//! are idempotent and exactly-once under concurrent callers and across
//! multiple service instances. Process-local guards are never the
//! correctness mechanism; this layer is.
//!
//! # Invariants
//!
//! - At most one `pending` session per (member, group): `create` cancels
//!   any existing pending session inside the same transaction before
//!   inserting (a partial unique index backs this up at the schema level).
//! - Terminal states are final: no query here updates a non-pending row's
//!   status.

use crate::errors::GkError;
use crate::models::{SessionRow, SessionStatus};
use crate::observability::metrics;
use chrono::{DateTime, Utc};
use common::types::{GroupId, MemberId, SessionId};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use std::str::FromStr;
use std::time::Instant;
use tracing::instrument;
use uuid::Uuid;

/// Default batch size for the overdue-session sweep.
const DEFAULT_SWEEP_BATCH_SIZE: i64 = 100;

/// Collision retries when two instances race the same join.
const MAX_CREATE_RETRIES: u32 = 3;

/// Columns selected for session rows.
const SESSION_COLUMNS: &str = "session_id, member_id, group_id, status, welcome_message_id, \
     created_at, expires_at, verified_at, attempt_count, user_ip, user_agent";

/// Verification sessions repository.
pub struct SessionsRepository;

impl SessionsRepository {
    /// Create a new pending session for (member, group).
    ///
    /// Cancels any existing pending session for the pair first, inside the
    /// same transaction, so the at-most-one-pending invariant holds even
    /// when a late duplicate "joined" event races a live session.
    ///
    /// # Errors
    ///
    /// Returns `GkError::Database` on connection or query failure.
    #[instrument(skip_all, fields(member_id = %member_id, group_id = %group_id))]
    pub async fn create(
        pool: &PgPool,
        member_id: MemberId,
        group_id: GroupId,
        ttl_minutes: i32,
    ) -> Result<SessionRow, GkError> {
        let start = Instant::now();

        // Two instances racing the same join can both pass the cancel step
        // and collide on the partial unique index at insert; one retry lets
        // the loser cancel the winner's row and supersede it.
        for attempt in 0..MAX_CREATE_RETRIES {
            match Self::try_create(pool, member_id, group_id, ttl_minutes).await {
                Ok(row) => {
                    metrics::record_db_query("create_session", "success", start.elapsed());
                    return map_row_to_session(&row);
                }
                Err(e)
                    if attempt + 1 < MAX_CREATE_RETRIES
                        && (e.to_string().contains("unique constraint")
                            || e.to_string().contains("duplicate key")) =>
                {
                    tracing::debug!(
                        target: "gk.repo.sessions",
                        attempt = attempt + 1,
                        "Pending-session collision, retrying create"
                    );
                }
                Err(e) => {
                    metrics::record_db_query("create_session", "error", start.elapsed());
                    return Err(GkError::Database(e.to_string()));
                }
            }
        }

        metrics::record_db_query("create_session", "error", start.elapsed());
        Err(GkError::Database(
            "failed to create session after collision retries".to_string(),
        ))
    }

    /// One cancel-then-insert transaction.
    async fn try_create(
        pool: &PgPool,
        member_id: MemberId,
        group_id: GroupId,
        ttl_minutes: i32,
    ) -> Result<PgRow, sqlx::Error> {
        let session_id = Uuid::new_v4();
        let mut tx = pool.begin().await?;

        // Supersede any live session for this pair (at-most-one-pending)
        sqlx::query(
            "UPDATE join_sessions SET status = 'cancelled' \
             WHERE member_id = $1 AND group_id = $2 AND status = 'pending'",
        )
        .bind(member_id.0)
        .bind(group_id.0)
        .execute(&mut *tx)
        .await?;

        let row = sqlx::query(&format!(
            "INSERT INTO join_sessions \
                 (session_id, member_id, group_id, status, expires_at) \
             VALUES ($1, $2, $3, 'pending', NOW() + make_interval(mins => $4)) \
             RETURNING {SESSION_COLUMNS}"
        ))
        .bind(session_id)
        .bind(member_id.0)
        .bind(group_id.0)
        .bind(ttl_minutes)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(row)
    }

    /// Fetch a session by id.
    ///
    /// # Errors
    ///
    /// Returns `GkError::Database` on query failure.
    #[instrument(skip_all, fields(session_id = %session_id))]
    pub async fn find(
        pool: &PgPool,
        session_id: SessionId,
    ) -> Result<Option<SessionRow>, GkError> {
        let start = Instant::now();

        let row = sqlx::query(&format!(
            "SELECT {SESSION_COLUMNS} FROM join_sessions WHERE session_id = $1"
        ))
        .bind(session_id.0)
        .fetch_optional(pool)
        .await
        .map_err(|e| {
            metrics::record_db_query("find_session", "error", start.elapsed());
            GkError::Database(e.to_string())
        })?;

        metrics::record_db_query("find_session", "success", start.elapsed());
        row.as_ref().map(map_row_to_session).transpose()
    }

    /// Fetch the pending session for (member, group), if any.
    ///
    /// # Errors
    ///
    /// Returns `GkError::Database` on query failure.
    #[instrument(skip_all, fields(member_id = %member_id, group_id = %group_id))]
    pub async fn find_pending(
        pool: &PgPool,
        member_id: MemberId,
        group_id: GroupId,
    ) -> Result<Option<SessionRow>, GkError> {
        let start = Instant::now();

        let row = sqlx::query(&format!(
            "SELECT {SESSION_COLUMNS} FROM join_sessions \
             WHERE member_id = $1 AND group_id = $2 AND status = 'pending' \
             ORDER BY created_at DESC LIMIT 1"
        ))
        .bind(member_id.0)
        .bind(group_id.0)
        .fetch_optional(pool)
        .await
        .map_err(|e| {
            metrics::record_db_query("find_pending_session", "error", start.elapsed());
            GkError::Database(e.to_string())
        })?;

        metrics::record_db_query("find_pending_session", "success", start.elapsed());
        row.as_ref().map(map_row_to_session).transpose()
    }

    /// Record the welcome message id on a session (for later deletion).
    ///
    /// # Errors
    ///
    /// Returns `GkError::Database` on query failure.
    #[instrument(skip_all, fields(session_id = %session_id))]
    pub async fn set_welcome_message(
        pool: &PgPool,
        session_id: SessionId,
        message_id: i64,
    ) -> Result<(), GkError> {
        sqlx::query("UPDATE join_sessions SET welcome_message_id = $2 WHERE session_id = $1")
            .bind(session_id.0)
            .bind(message_id)
            .execute(pool)
            .await
            .map_err(|e| GkError::Database(e.to_string()))?;
        Ok(())
    }

    /// Increment the attempt counter unconditionally and return the new
    /// count. Attempts are counted even on submissions that will be
    /// rejected for other reasons, so retries stay bounded regardless of
    /// terminal outcome.
    ///
    /// # Errors
    ///
    /// Returns `GkError::SessionNotFound` if the session does not exist,
    /// `GkError::Database` on query failure.
    #[instrument(skip_all, fields(session_id = %session_id))]
    pub async fn record_attempt(
        pool: &PgPool,
        session_id: SessionId,
    ) -> Result<i32, GkError> {
        let row = sqlx::query(
            "UPDATE join_sessions SET attempt_count = attempt_count + 1 \
             WHERE session_id = $1 RETURNING attempt_count",
        )
        .bind(session_id.0)
        .fetch_optional(pool)
        .await
        .map_err(|e| GkError::Database(e.to_string()))?;

        match row {
            Some(row) => row
                .try_get("attempt_count")
                .map_err(|e| GkError::Database(e.to_string())),
            None => Err(GkError::SessionNotFound),
        }
    }

    /// Transition a pending, unexpired session to `verified`, stamping the
    /// verification time and the client's network origin.
    ///
    /// The `status = 'pending' AND expires_at > NOW()` predicate makes this
    /// exactly-once: of any number of concurrent callers, one observes
    /// `true` and the rest `false`.
    ///
    /// # Errors
    ///
    /// Returns `GkError::Database` on query failure.
    #[instrument(skip_all, fields(session_id = %session_id))]
    pub async fn mark_verified(
        pool: &PgPool,
        session_id: SessionId,
        user_ip: Option<&str>,
        user_agent: Option<&str>,
    ) -> Result<bool, GkError> {
        let start = Instant::now();

        let result = sqlx::query(
            "UPDATE join_sessions \
             SET status = 'verified', verified_at = NOW(), user_ip = $2, user_agent = $3 \
             WHERE session_id = $1 AND status = 'pending' AND expires_at > NOW()",
        )
        .bind(session_id.0)
        .bind(user_ip)
        .bind(user_agent)
        .execute(pool)
        .await
        .map_err(|e| {
            metrics::record_db_query("mark_verified", "error", start.elapsed());
            GkError::Database(e.to_string())
        })?;

        metrics::record_db_query("mark_verified", "success", start.elapsed());
        Ok(result.rows_affected() == 1)
    }

    /// Transition a pending session to `expired`. Idempotent: a no-op
    /// (returning `false`) unless the session is still pending.
    ///
    /// # Errors
    ///
    /// Returns `GkError::Database` on query failure.
    #[instrument(skip_all, fields(session_id = %session_id))]
    pub async fn mark_expired(pool: &PgPool, session_id: SessionId) -> Result<bool, GkError> {
        Self::terminal_transition(pool, session_id, SessionStatus::Expired).await
    }

    /// Transition a pending session to `cancelled` (member left, or a new
    /// session superseded it). Idempotent like [`Self::mark_expired`].
    ///
    /// # Errors
    ///
    /// Returns `GkError::Database` on query failure.
    #[instrument(skip_all, fields(session_id = %session_id))]
    pub async fn mark_cancelled(pool: &PgPool, session_id: SessionId) -> Result<bool, GkError> {
        Self::terminal_transition(pool, session_id, SessionStatus::Cancelled).await
    }

    /// Transition a pending session to `failed` (attempt bound reached).
    /// Idempotent like [`Self::mark_expired`].
    ///
    /// # Errors
    ///
    /// Returns `GkError::Database` on query failure.
    #[instrument(skip_all, fields(session_id = %session_id))]
    pub async fn mark_failed(pool: &PgPool, session_id: SessionId) -> Result<bool, GkError> {
        Self::terminal_transition(pool, session_id, SessionStatus::Failed).await
    }

    /// Shared conditional transition out of `pending`.
    async fn terminal_transition(
        pool: &PgPool,
        session_id: SessionId,
        to: SessionStatus,
    ) -> Result<bool, GkError> {
        let start = Instant::now();

        let result = sqlx::query(
            "UPDATE join_sessions SET status = $2 \
             WHERE session_id = $1 AND status = 'pending'",
        )
        .bind(session_id.0)
        .bind(to.as_str())
        .execute(pool)
        .await
        .map_err(|e| {
            metrics::record_db_query("terminal_transition", "error", start.elapsed());
            GkError::Database(e.to_string())
        })?;

        metrics::record_db_query("terminal_transition", "success", start.elapsed());
        Ok(result.rows_affected() == 1)
    }

    /// Expire a batch of overdue pending sessions and return them.
    ///
    /// Used by the reconciliation sweep. `FOR UPDATE SKIP LOCKED` lets
    /// multiple instances sweep concurrently without double-processing a
    /// session; the conditional update itself remains the correctness
    /// mechanism.
    ///
    /// # Errors
    ///
    /// Returns `GkError::Database` on query failure.
    #[instrument(skip_all)]
    pub async fn expire_overdue(
        pool: &PgPool,
        batch_size: Option<i64>,
    ) -> Result<Vec<SessionRow>, GkError> {
        let start = Instant::now();
        let batch = batch_size.unwrap_or(DEFAULT_SWEEP_BATCH_SIZE);

        let rows = sqlx::query(&format!(
            "UPDATE join_sessions SET status = 'expired' \
             WHERE session_id IN ( \
                 SELECT session_id FROM join_sessions \
                 WHERE status = 'pending' AND expires_at < NOW() \
                 ORDER BY expires_at \
                 LIMIT $1 \
                 FOR UPDATE SKIP LOCKED \
             ) \
             RETURNING {SESSION_COLUMNS}"
        ))
        .bind(batch)
        .fetch_all(pool)
        .await
        .map_err(|e| {
            metrics::record_db_query("expire_overdue", "error", start.elapsed());
            GkError::Database(e.to_string())
        })?;

        metrics::record_db_query("expire_overdue", "success", start.elapsed());
        rows.iter().map(map_row_to_session).collect()
    }
}

/// Map a database row to a `SessionRow`.
pub(crate) fn map_row_to_session(row: &PgRow) -> Result<SessionRow, GkError> {
    let status_str: String = row
        .try_get("status")
        .map_err(|e| GkError::Database(e.to_string()))?;
    let status = SessionStatus::from_str(&status_str).map_err(GkError::Database)?;

    let session_id: Uuid = row
        .try_get("session_id")
        .map_err(|e| GkError::Database(e.to_string()))?;
    let member_id: i64 = row
        .try_get("member_id")
        .map_err(|e| GkError::Database(e.to_string()))?;
    let group_id: i64 = row
        .try_get("group_id")
        .map_err(|e| GkError::Database(e.to_string()))?;
    let welcome_message_id: Option<i64> = row
        .try_get("welcome_message_id")
        .map_err(|e| GkError::Database(e.to_string()))?;
    let created_at: DateTime<Utc> = row
        .try_get("created_at")
        .map_err(|e| GkError::Database(e.to_string()))?;
    let expires_at: DateTime<Utc> = row
        .try_get("expires_at")
        .map_err(|e| GkError::Database(e.to_string()))?;
    let verified_at: Option<DateTime<Utc>> = row
        .try_get("verified_at")
        .map_err(|e| GkError::Database(e.to_string()))?;
    let attempt_count: i32 = row
        .try_get("attempt_count")
        .map_err(|e| GkError::Database(e.to_string()))?;
    let user_ip: Option<String> = row
        .try_get("user_ip")
        .map_err(|e| GkError::Database(e.to_string()))?;
    let user_agent: Option<String> = row
        .try_get("user_agent")
        .map_err(|e| GkError::Database(e.to_string()))?;

    Ok(SessionRow {
        session_id: SessionId(session_id),
        member_id: MemberId(member_id),
        group_id: GroupId(group_id),
        status,
        welcome_message_id,
        created_at,
        expires_at,
        verified_at,
        attempt_count,
        user_ip,
        user_agent,
    })
}
