//! Group settings repository.
//!
//! Settings are read once per membership event and never mutated by the
//! verification core; the administrative surface owns writes.

use crate::errors::GkError;
use crate::models::{GroupSettings, PostTimeoutAction};
use common::types::GroupId;
use sqlx::{PgPool, Row};
use std::str::FromStr;
use tracing::instrument;

/// Group settings repository.
pub struct GroupSettingsRepository;

impl GroupSettingsRepository {
    /// Fetch settings for a group, falling back to defaults when the group
    /// has no stored row yet.
    ///
    /// # Errors
    ///
    /// Returns `GkError::Database` on query failure.
    #[instrument(skip_all, fields(group_id = %group_id))]
    pub async fn get(pool: &PgPool, group_id: GroupId) -> Result<GroupSettings, GkError> {
        let row = sqlx::query(
            "SELECT group_id, verification_enabled, ttl_minutes, post_timeout_action, \
                    welcome_template, admin_bypass, rate_limit_per_minute, delete_welcome_message \
             FROM group_settings WHERE group_id = $1",
        )
        .bind(group_id.0)
        .fetch_optional(pool)
        .await
        .map_err(|e| GkError::Database(e.to_string()))?;

        let Some(row) = row else {
            return Ok(GroupSettings::defaults_for(group_id));
        };

        let action_str: String = row
            .try_get("post_timeout_action")
            .map_err(|e| GkError::Database(e.to_string()))?;
        let post_timeout_action =
            PostTimeoutAction::from_str(&action_str).map_err(GkError::Database)?;

        Ok(GroupSettings {
            group_id,
            verification_enabled: row
                .try_get("verification_enabled")
                .map_err(|e| GkError::Database(e.to_string()))?,
            ttl_minutes: row
                .try_get("ttl_minutes")
                .map_err(|e| GkError::Database(e.to_string()))?,
            post_timeout_action,
            welcome_template: row
                .try_get("welcome_template")
                .map_err(|e| GkError::Database(e.to_string()))?,
            admin_bypass: row
                .try_get("admin_bypass")
                .map_err(|e| GkError::Database(e.to_string()))?,
            rate_limit_per_minute: row
                .try_get("rate_limit_per_minute")
                .map_err(|e| GkError::Database(e.to_string()))?,
            delete_welcome_message: row
                .try_get("delete_welcome_message")
                .map_err(|e| GkError::Database(e.to_string()))?,
        })
    }

    /// Ensure a group row and its settings exist (first contact with a
    /// group). Existing settings are left untouched.
    ///
    /// # Errors
    ///
    /// Returns `GkError::Database` on query failure.
    #[instrument(skip_all, fields(group_id = %group_id))]
    pub async fn ensure_exists(
        pool: &PgPool,
        group_id: GroupId,
        title: Option<&str>,
    ) -> Result<(), GkError> {
        sqlx::query(
            "INSERT INTO groups (group_id, title) VALUES ($1, $2) \
             ON CONFLICT (group_id) DO UPDATE SET title = COALESCE(EXCLUDED.title, groups.title)",
        )
        .bind(group_id.0)
        .bind(title)
        .execute(pool)
        .await
        .map_err(|e| GkError::Database(e.to_string()))?;

        sqlx::query(
            "INSERT INTO group_settings (group_id) VALUES ($1) \
             ON CONFLICT (group_id) DO NOTHING",
        )
        .bind(group_id.0)
        .execute(pool)
        .await
        .map_err(|e| GkError::Database(e.to_string()))?;

        Ok(())
    }

    /// Fetch a group's display title, if known.
    ///
    /// # Errors
    ///
    /// Returns `GkError::Database` on query failure.
    #[instrument(skip_all, fields(group_id = %group_id))]
    pub async fn get_title(pool: &PgPool, group_id: GroupId) -> Result<Option<String>, GkError> {
        let row = sqlx::query("SELECT title FROM groups WHERE group_id = $1")
            .bind(group_id.0)
            .fetch_optional(pool)
            .await
            .map_err(|e| GkError::Database(e.to_string()))?;

        row.map(|r| r.try_get("title"))
            .transpose()
            .map_err(|e| GkError::Database(e.to_string()))
    }
}

/// Integration tests requiring a database.
#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod integration_tests {
    use super::*;

    const GROUP: GroupId = GroupId(-2001);

    #[sqlx::test(migrations = "../../migrations")]
    async fn test_get_returns_defaults_for_unknown_group(pool: PgPool) {
        let settings = GroupSettingsRepository::get(&pool, GROUP)
            .await
            .expect("get should succeed");

        assert!(settings.verification_enabled);
        assert_eq!(settings.ttl_minutes, 10);
        assert_eq!(settings.post_timeout_action, PostTimeoutAction::Mute);
    }

    #[sqlx::test(migrations = "../../migrations")]
    async fn test_ensure_exists_is_idempotent(pool: PgPool) {
        GroupSettingsRepository::ensure_exists(&pool, GROUP, Some("Rustaceans"))
            .await
            .expect("first ensure should succeed");
        GroupSettingsRepository::ensure_exists(&pool, GROUP, None)
            .await
            .expect("second ensure should succeed");

        // Title survives the second call's None
        let title = GroupSettingsRepository::get_title(&pool, GROUP)
            .await
            .unwrap();
        assert_eq!(title.as_deref(), Some("Rustaceans"));
    }

    #[sqlx::test(migrations = "../../migrations")]
    async fn test_get_reads_stored_settings(pool: PgPool) {
        GroupSettingsRepository::ensure_exists(&pool, GROUP, Some("Rustaceans"))
            .await
            .unwrap();
        sqlx::query(
            "UPDATE group_settings \
             SET verification_enabled = false, ttl_minutes = 3, post_timeout_action = 'kick' \
             WHERE group_id = $1",
        )
        .bind(GROUP.0)
        .execute(&pool)
        .await
        .unwrap();

        let settings = GroupSettingsRepository::get(&pool, GROUP).await.unwrap();
        assert!(!settings.verification_enabled);
        assert_eq!(settings.ttl_minutes, 3);
        assert_eq!(settings.post_timeout_action, PostTimeoutAction::Kick);
    }
}
