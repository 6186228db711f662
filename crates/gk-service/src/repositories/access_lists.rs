//! Access list repository (blacklist / whitelist).
//!
//! Blacklisted members are banned on join without a session being created.
//! Whitelist entries are stored and queryable for the administrative
//! surface, but deliberately do not bypass verification.

use crate::errors::GkError;
use common::types::{GroupId, MemberId};
use sqlx::PgPool;
use tracing::instrument;

/// Which list an entry belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListKind {
    Blacklist,
    Whitelist,
}

impl ListKind {
    fn as_str(self) -> &'static str {
        match self {
            ListKind::Blacklist => "blacklist",
            ListKind::Whitelist => "whitelist",
        }
    }
}

/// Access lists repository.
pub struct AccessListsRepository;

impl AccessListsRepository {
    /// Whether (member, group) is on the blacklist.
    ///
    /// # Errors
    ///
    /// Returns `GkError::Database` on query failure.
    #[instrument(skip_all, fields(member_id = %member_id, group_id = %group_id))]
    pub async fn is_blacklisted(
        pool: &PgPool,
        member_id: MemberId,
        group_id: GroupId,
    ) -> Result<bool, GkError> {
        Self::contains(pool, ListKind::Blacklist, member_id, group_id).await
    }

    /// Whether (member, group) is on the whitelist.
    ///
    /// # Errors
    ///
    /// Returns `GkError::Database` on query failure.
    #[instrument(skip_all, fields(member_id = %member_id, group_id = %group_id))]
    pub async fn is_whitelisted(
        pool: &PgPool,
        member_id: MemberId,
        group_id: GroupId,
    ) -> Result<bool, GkError> {
        Self::contains(pool, ListKind::Whitelist, member_id, group_id).await
    }

    async fn contains(
        pool: &PgPool,
        kind: ListKind,
        member_id: MemberId,
        group_id: GroupId,
    ) -> Result<bool, GkError> {
        let row: (bool,) = sqlx::query_as(
            "SELECT EXISTS( \
                 SELECT 1 FROM access_lists \
                 WHERE kind = $1 AND member_id = $2 AND group_id = $3)",
        )
        .bind(kind.as_str())
        .bind(member_id.0)
        .bind(group_id.0)
        .fetch_one(pool)
        .await
        .map_err(|e| GkError::Database(e.to_string()))?;

        Ok(row.0)
    }

    /// Add an entry; a no-op if the pair is already on the list.
    ///
    /// # Errors
    ///
    /// Returns `GkError::Database` on query failure.
    #[instrument(skip_all, fields(member_id = %member_id, group_id = %group_id))]
    pub async fn add(
        pool: &PgPool,
        kind: ListKind,
        member_id: MemberId,
        group_id: GroupId,
        added_by: MemberId,
        reason: Option<&str>,
    ) -> Result<(), GkError> {
        sqlx::query(
            "INSERT INTO access_lists (kind, member_id, group_id, added_by, reason) \
             VALUES ($1, $2, $3, $4, $5) \
             ON CONFLICT (kind, member_id, group_id) DO NOTHING",
        )
        .bind(kind.as_str())
        .bind(member_id.0)
        .bind(group_id.0)
        .bind(added_by.0)
        .bind(reason)
        .execute(pool)
        .await
        .map_err(|e| GkError::Database(e.to_string()))?;

        Ok(())
    }

    /// Remove an entry; returns whether anything was deleted.
    ///
    /// # Errors
    ///
    /// Returns `GkError::Database` on query failure.
    #[instrument(skip_all, fields(member_id = %member_id, group_id = %group_id))]
    pub async fn remove(
        pool: &PgPool,
        kind: ListKind,
        member_id: MemberId,
        group_id: GroupId,
    ) -> Result<bool, GkError> {
        let result = sqlx::query(
            "DELETE FROM access_lists WHERE kind = $1 AND member_id = $2 AND group_id = $3",
        )
        .bind(kind.as_str())
        .bind(member_id.0)
        .bind(group_id.0)
        .execute(pool)
        .await
        .map_err(|e| GkError::Database(e.to_string()))?;

        Ok(result.rows_affected() > 0)
    }
}

/// Integration tests requiring a database.
#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod integration_tests {
    use super::*;

    const MEMBER: MemberId = MemberId(9);
    const ADMIN: MemberId = MemberId(1);
    const GROUP: GroupId = GroupId(-3001);

    #[sqlx::test(migrations = "../../migrations")]
    async fn test_blacklist_round_trip(pool: PgPool) {
        assert!(!AccessListsRepository::is_blacklisted(&pool, MEMBER, GROUP)
            .await
            .unwrap());

        AccessListsRepository::add(
            &pool,
            ListKind::Blacklist,
            MEMBER,
            GROUP,
            ADMIN,
            Some("spam"),
        )
        .await
        .unwrap();

        assert!(AccessListsRepository::is_blacklisted(&pool, MEMBER, GROUP)
            .await
            .unwrap());

        // The two lists are independent
        assert!(!AccessListsRepository::is_whitelisted(&pool, MEMBER, GROUP)
            .await
            .unwrap());

        assert!(
            AccessListsRepository::remove(&pool, ListKind::Blacklist, MEMBER, GROUP)
                .await
                .unwrap()
        );
        assert!(!AccessListsRepository::is_blacklisted(&pool, MEMBER, GROUP)
            .await
            .unwrap());
    }

    #[sqlx::test(migrations = "../../migrations")]
    async fn test_add_is_idempotent(pool: PgPool) {
        AccessListsRepository::add(&pool, ListKind::Whitelist, MEMBER, GROUP, ADMIN, None)
            .await
            .unwrap();
        AccessListsRepository::add(&pool, ListKind::Whitelist, MEMBER, GROUP, ADMIN, None)
            .await
            .unwrap();

        let count: (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM access_lists \
             WHERE kind = 'whitelist' AND member_id = $1 AND group_id = $2",
        )
        .bind(MEMBER.0)
        .bind(GROUP.0)
        .fetch_one(&pool)
        .await
        .unwrap();
        assert_eq!(count.0, 1);
    }

    #[sqlx::test(migrations = "../../migrations")]
    async fn test_remove_missing_entry_returns_false(pool: PgPool) {
        assert!(
            !AccessListsRepository::remove(&pool, ListKind::Blacklist, MEMBER, GROUP)
                .await
                .unwrap()
        );
    }
}
