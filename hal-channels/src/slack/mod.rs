//! Slack channel.
//!
//! Replies go out through the Web API (`chat.postMessage`). Inbound events
//! arrive either over Socket Mode ([`socket`]) or through the Events API
//! webhook served by [`crate::routes`].

pub mod events;
pub mod format;
pub mod socket;

use crate::message::{OutgoingContent, OutgoingMessage};
use crate::traits::{Channel, ChannelError, ChannelResult};
use async_trait::async_trait;
use format::{convert_to_slack_mrkdwn, split_message};
use hal_common::config::Config;
use reqwest::{Client, StatusCode};
use serde_json::{json, Value};
use std::time::Duration;

pub use socket::SocketModeClient;

/// Identity reported by `auth.test`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BotIdentity {
    pub user_id: String,
    pub bot_id: Option<String>,
    pub team: Option<String>,
}

/// Slack channel using the Web API.
pub struct SlackChannel {
    bot_token: String,
    api_base_url: String,
    client: Client,
}

impl SlackChannel {
    pub fn new(bot_token: impl Into<String>, api_base_url: impl Into<String>) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_else(|_| Client::new());

        Self {
            bot_token: bot_token.into(),
            api_base_url: api_base_url.into().trim_end_matches('/').to_string(),
            client,
        }
    }

    /// Build from config. Returns `None` when no bot token is configured.
    pub fn from_config(config: &Config) -> Option<Self> {
        config
            .slack_bot_token()
            .map(|token| Self::new(token, config.slack.api_base_url.clone()))
    }

    pub(crate) fn api_url(&self, method: &str) -> String {
        format!("{}/{}", self.api_base_url, method)
    }

    /// Call a Web API method and return the body once `ok` is true.
    pub(crate) async fn call(
        &self,
        method: &str,
        token: &str,
        body: Option<&Value>,
    ) -> ChannelResult<Value> {
        let mut request = self.client.post(self.api_url(method)).bearer_auth(token);
        if let Some(body) = body {
            request = request.json(body);
        }

        let resp = request
            .send()
            .await
            .map_err(|e| ChannelError::Connection(format!("Slack {method} request failed: {e}")))?;

        if resp.status() == StatusCode::TOO_MANY_REQUESTS {
            let retry_after_secs = resp
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse().ok())
                .unwrap_or(1);
            return Err(ChannelError::RateLimited { retry_after_secs });
        }

        let data: Value = resp
            .json()
            .await
            .map_err(|e| ChannelError::Internal(format!("Failed to parse response: {e}")))?;

        if !data.get("ok").and_then(|o| o.as_bool()).unwrap_or(false) {
            let error = data
                .get("error")
                .and_then(|e| e.as_str())
                .unwrap_or("unknown");
            return Err(match error {
                "invalid_auth" | "not_authed" | "account_inactive" | "token_revoked" => {
                    ChannelError::Auth(format!("Slack {method} failed: {error}"))
                }
                _ => ChannelError::SendFailed(format!("Slack {method} failed: {error}")),
            });
        }

        Ok(data)
    }

    /// Verify the bot token and look up the bot's own user id.
    pub async fn auth_test(&self) -> ChannelResult<BotIdentity> {
        let data = self.call("auth.test", &self.bot_token, None).await?;
        let field = |name: &str| data.get(name).and_then(|v| v.as_str()).map(String::from);

        let user_id = field("user_id")
            .ok_or_else(|| ChannelError::Auth("auth.test returned no user_id".into()))?;
        Ok(BotIdentity {
            user_id,
            bot_id: field("bot_id"),
            team: field("team"),
        })
    }

    async fn post_message(
        &self,
        channel_id: &str,
        thread_ts: Option<&str>,
        text: &str,
    ) -> ChannelResult<String> {
        let mut body = json!({
            "channel": channel_id,
            "text": text,
        });
        if let Some(thread_ts) = thread_ts {
            body["thread_ts"] = json!(thread_ts);
        }

        let data = self.call("chat.postMessage", &self.bot_token, Some(&body)).await?;
        Ok(data
            .get("ts")
            .and_then(|t| t.as_str())
            .unwrap_or("unknown")
            .to_string())
    }
}

#[async_trait]
impl Channel for SlackChannel {
    fn name(&self) -> &'static str {
        "slack"
    }

    async fn send(&self, message: OutgoingMessage) -> ChannelResult<String> {
        let text = match &message.content {
            OutgoingContent::Text { text } => text.clone(),
            OutgoingContent::Markdown { text } => convert_to_slack_mrkdwn(text),
        };
        if text.trim().is_empty() {
            return Err(ChannelError::InvalidMessage("empty reply".into()));
        }

        let mut last_ts = String::new();
        for chunk in split_message(&text) {
            last_ts = self
                .post_message(&message.channel_id, message.thread_ts.as_deref(), &chunk)
                .await?;
        }
        Ok(last_ts)
    }
}
