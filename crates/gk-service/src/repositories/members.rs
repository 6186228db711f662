//! Member repository.
//!
//! Member identity is owned by the messaging platform; this table is a
//! read-mostly mirror refreshed from membership events.

use crate::errors::GkError;
use crate::models::MemberProfile;
use common::types::MemberId;
use sqlx::{PgPool, Row};
use tracing::instrument;

/// Members repository.
pub struct MembersRepository;

impl MembersRepository {
    /// Insert or refresh a member's profile from an incoming event.
    ///
    /// # Errors
    ///
    /// Returns `GkError::Database` on query failure.
    #[instrument(skip_all, fields(member_id = %profile.member_id))]
    pub async fn upsert(pool: &PgPool, profile: &MemberProfile) -> Result<(), GkError> {
        sqlx::query(
            "INSERT INTO members (member_id, display_name, username, is_bot) \
             VALUES ($1, $2, $3, $4) \
             ON CONFLICT (member_id) DO UPDATE \
             SET display_name = EXCLUDED.display_name, \
                 username = EXCLUDED.username",
        )
        .bind(profile.member_id.0)
        .bind(&profile.display_name)
        .bind(profile.username.as_deref())
        .bind(profile.is_bot)
        .execute(pool)
        .await
        .map_err(|e| GkError::Database(e.to_string()))?;

        Ok(())
    }

    /// Fetch a member's profile, if known.
    ///
    /// # Errors
    ///
    /// Returns `GkError::Database` on query failure.
    #[instrument(skip_all, fields(member_id = %member_id))]
    pub async fn find(
        pool: &PgPool,
        member_id: MemberId,
    ) -> Result<Option<MemberProfile>, GkError> {
        let row = sqlx::query(
            "SELECT member_id, display_name, username, is_bot FROM members WHERE member_id = $1",
        )
        .bind(member_id.0)
        .fetch_optional(pool)
        .await
        .map_err(|e| GkError::Database(e.to_string()))?;

        let Some(row) = row else {
            return Ok(None);
        };

        Ok(Some(MemberProfile {
            member_id: MemberId(
                row.try_get("member_id")
                    .map_err(|e| GkError::Database(e.to_string()))?,
            ),
            display_name: row
                .try_get("display_name")
                .map_err(|e| GkError::Database(e.to_string()))?,
            username: row
                .try_get("username")
                .map_err(|e| GkError::Database(e.to_string()))?,
            is_bot: row
                .try_get("is_bot")
                .map_err(|e| GkError::Database(e.to_string()))?,
        }))
    }
}

/// Integration tests requiring a database.
#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod integration_tests {
    use super::*;

    #[sqlx::test(migrations = "../../migrations")]
    async fn test_upsert_then_find(pool: PgPool) {
        let profile = MemberProfile {
            member_id: MemberId(77),
            display_name: "Alice".to_string(),
            username: Some("alice".to_string()),
            is_bot: false,
        };

        MembersRepository::upsert(&pool, &profile).await.unwrap();

        let found = MembersRepository::find(&pool, MemberId(77))
            .await
            .unwrap()
            .expect("member should exist");
        assert_eq!(found.display_name, "Alice");
        assert_eq!(found.username.as_deref(), Some("alice"));
    }

    #[sqlx::test(migrations = "../../migrations")]
    async fn test_upsert_refreshes_profile(pool: PgPool) {
        let mut profile = MemberProfile {
            member_id: MemberId(77),
            display_name: "Alice".to_string(),
            username: None,
            is_bot: false,
        };
        MembersRepository::upsert(&pool, &profile).await.unwrap();

        profile.display_name = "Alice B.".to_string();
        profile.username = Some("aliceb".to_string());
        MembersRepository::upsert(&pool, &profile).await.unwrap();

        let found = MembersRepository::find(&pool, MemberId(77))
            .await
            .unwrap()
            .expect("member should exist");
        assert_eq!(found.display_name, "Alice B.");
        assert_eq!(found.username.as_deref(), Some("aliceb"));
    }

    #[sqlx::test(migrations = "../../migrations")]
    async fn test_find_unknown_member(pool: PgPool) {
        let found = MembersRepository::find(&pool, MemberId(404)).await.unwrap();
        assert!(found.is_none());
    }
}
