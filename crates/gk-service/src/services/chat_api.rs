//! Messaging-API collaborator.
//!
//! The Gatekeeper calls the messaging platform to restrict, unrestrict,
//! remove and message members, but does not implement those operations.
//! `ChatApi` is the trait seam; `HttpChatApi` speaks a bot-API style HTTP
//! surface. Tests substitute trait-object mocks.
//!
//! # Security
//!
//! - The bot token is held in a `SecretString` and never logged
//! - Timeouts prevent hanging calls
//! - Error messages surfaced to clients are generic

use crate::errors::GkError;
use async_trait::async_trait;
use common::secret::{ExposeSecret, SecretString};
use common::types::{GroupId, MemberId, MessageId};
use serde::Deserialize;
use std::time::Duration;
use tracing::{instrument, warn};

/// Default timeout for messaging-API calls in seconds.
const CHAT_API_TIMEOUT_SECS: u64 = 10;

/// Messaging-API operations the Gatekeeper depends on.
///
/// Retry policy for failed calls belongs to the implementation; the
/// orchestrator logs failures and continues. A transient external-call
/// failure never rolls back a committed state transition.
#[async_trait]
pub trait ChatApi: Send + Sync {
    /// Deny the member every posting capability in the group.
    async fn restrict(&self, group_id: GroupId, member_id: MemberId) -> Result<(), GkError>;

    /// Restore the member's normal posting capabilities.
    async fn lift_restrictions(
        &self,
        group_id: GroupId,
        member_id: MemberId,
    ) -> Result<(), GkError>;

    /// Remove the member but allow them to rejoin later.
    async fn remove_and_allow_rejoin(
        &self,
        group_id: GroupId,
        member_id: MemberId,
    ) -> Result<(), GkError>;

    /// Permanently ban the member from the group.
    async fn ban(&self, group_id: GroupId, member_id: MemberId) -> Result<(), GkError>;

    /// Post a message to the group; returns its id for later deletion.
    async fn send_group_message(
        &self,
        group_id: GroupId,
        text: &str,
    ) -> Result<MessageId, GkError>;

    /// Delete a previously posted group message.
    async fn delete_message(
        &self,
        group_id: GroupId,
        message_id: MessageId,
    ) -> Result<(), GkError>;

    /// Send a direct message to a member.
    async fn send_direct_message(&self, member_id: MemberId, text: &str) -> Result<(), GkError>;
}

/// Response envelope of the bot-API style surface.
#[derive(Debug, Deserialize)]
struct ApiEnvelope<T> {
    ok: bool,
    #[serde(default)]
    description: Option<String>,
    result: Option<T>,
}

#[derive(Debug, Deserialize)]
struct SentMessage {
    message_id: i64,
}

/// HTTP implementation of [`ChatApi`].
pub struct HttpChatApi {
    http: reqwest::Client,
    base_url: String,
    bot_token: SecretString,
}

impl HttpChatApi {
    /// Create a new client.
    ///
    /// # Arguments
    ///
    /// * `base_url` - Messaging-API base URL, without a trailing slash
    /// * `bot_token` - Bot credential appended to the request path
    #[must_use]
    pub fn new(base_url: String, bot_token: SecretString) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(CHAT_API_TIMEOUT_SECS))
            .build()
            .unwrap_or_default();

        Self {
            http,
            base_url,
            bot_token,
        }
    }

    fn method_url(&self, method: &str) -> String {
        format!(
            "{}/bot{}/{}",
            self.base_url,
            self.bot_token.expose_secret(),
            method
        )
    }

    /// POST a method call and decode the envelope.
    async fn call<T: serde::de::DeserializeOwned>(
        &self,
        method: &str,
        body: serde_json::Value,
    ) -> Result<T, GkError> {
        let response = self
            .http
            .post(self.method_url(method))
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                // Note: the URL embeds the bot token; log only the method
                warn!(target: "gk.chat_api", method, error = %e, "Messaging API request failed");
                GkError::ChatApi(format!("{method} request failed"))
            })?;

        let envelope: ApiEnvelope<T> = response.json().await.map_err(|e| {
            warn!(target: "gk.chat_api", method, error = %e, "Messaging API returned invalid body");
            GkError::ChatApi(format!("{method} returned invalid body"))
        })?;

        if !envelope.ok {
            let description = envelope
                .description
                .unwrap_or_else(|| "no description".to_string());
            warn!(target: "gk.chat_api", method, description = %description, "Messaging API rejected call");
            return Err(GkError::ChatApi(format!("{method} rejected: {description}")));
        }

        envelope
            .result
            .ok_or_else(|| GkError::ChatApi(format!("{method} returned empty result")))
    }

    /// POST a method call where only the `ok` flag matters.
    async fn call_unit(&self, method: &str, body: serde_json::Value) -> Result<(), GkError> {
        let _: serde_json::Value = self.call(method, body).await?;
        Ok(())
    }
}

#[async_trait]
impl ChatApi for HttpChatApi {
    #[instrument(skip_all, fields(group_id = %group_id, member_id = %member_id))]
    async fn restrict(&self, group_id: GroupId, member_id: MemberId) -> Result<(), GkError> {
        self.call_unit(
            "restrictChatMember",
            serde_json::json!({
                "chat_id": group_id.0,
                "user_id": member_id.0,
                "permissions": {
                    "can_send_messages": false,
                    "can_send_audios": false,
                    "can_send_polls": false,
                    "can_send_other_messages": false,
                    "can_add_web_page_previews": false,
                    "can_invite_users": false,
                },
            }),
        )
        .await
    }

    #[instrument(skip_all, fields(group_id = %group_id, member_id = %member_id))]
    async fn lift_restrictions(
        &self,
        group_id: GroupId,
        member_id: MemberId,
    ) -> Result<(), GkError> {
        self.call_unit(
            "restrictChatMember",
            serde_json::json!({
                "chat_id": group_id.0,
                "user_id": member_id.0,
                "permissions": {
                    "can_send_messages": true,
                    "can_send_audios": true,
                    "can_send_polls": true,
                    "can_send_other_messages": true,
                    "can_add_web_page_previews": true,
                    "can_invite_users": true,
                },
            }),
        )
        .await
    }

    #[instrument(skip_all, fields(group_id = %group_id, member_id = %member_id))]
    async fn remove_and_allow_rejoin(
        &self,
        group_id: GroupId,
        member_id: MemberId,
    ) -> Result<(), GkError> {
        // Ban then immediately unban: removal that still permits rejoin
        self.call_unit(
            "banChatMember",
            serde_json::json!({ "chat_id": group_id.0, "user_id": member_id.0 }),
        )
        .await?;
        self.call_unit(
            "unbanChatMember",
            serde_json::json!({ "chat_id": group_id.0, "user_id": member_id.0 }),
        )
        .await
    }

    #[instrument(skip_all, fields(group_id = %group_id, member_id = %member_id))]
    async fn ban(&self, group_id: GroupId, member_id: MemberId) -> Result<(), GkError> {
        self.call_unit(
            "banChatMember",
            serde_json::json!({ "chat_id": group_id.0, "user_id": member_id.0 }),
        )
        .await
    }

    #[instrument(skip_all, fields(group_id = %group_id))]
    async fn send_group_message(
        &self,
        group_id: GroupId,
        text: &str,
    ) -> Result<MessageId, GkError> {
        let sent: SentMessage = self
            .call(
                "sendMessage",
                serde_json::json!({ "chat_id": group_id.0, "text": text }),
            )
            .await?;
        Ok(MessageId(sent.message_id))
    }

    #[instrument(skip_all, fields(group_id = %group_id, message_id = %message_id))]
    async fn delete_message(
        &self,
        group_id: GroupId,
        message_id: MessageId,
    ) -> Result<(), GkError> {
        self.call_unit(
            "deleteMessage",
            serde_json::json!({ "chat_id": group_id.0, "message_id": message_id.0 }),
        )
        .await
    }

    #[instrument(skip_all, fields(member_id = %member_id))]
    async fn send_direct_message(&self, member_id: MemberId, text: &str) -> Result<(), GkError> {
        let _: SentMessage = self
            .call(
                "sendMessage",
                serde_json::json!({ "chat_id": member_id.0, "text": text }),
            )
            .await?;
        Ok(())
    }
}
