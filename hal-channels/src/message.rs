//! Message types for Slack conversations.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identity of one conversation: a Slack channel plus the thread root `ts`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConversationKey {
    pub channel_id: String,
    pub thread_ts: String,
}

impl ConversationKey {
    pub fn new(channel_id: impl Into<String>, thread_ts: impl Into<String>) -> Self {
        Self {
            channel_id: channel_id.into(),
            thread_ts: thread_ts.into(),
        }
    }
}

impl fmt::Display for ConversationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.channel_id, self.thread_ts)
    }
}

/// Kind of inbound Slack event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// `app_mention`: the bot was addressed directly.
    Mention,
    /// `message`: any text posted where the bot can see it.
    Message,
}

impl EventKind {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Mention => "app_mention",
            Self::Message => "message",
        }
    }
}

/// Inbound chat event, normalized from Socket Mode or Events API payloads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboundEvent {
    pub kind: EventKind,
    pub channel_id: String,
    /// Author; absent for some bot and system messages.
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub text: String,
    /// Message timestamp (Slack's message id).
    pub ts: String,
    /// Thread root timestamp; absent for top-level messages.
    #[serde(default)]
    pub thread_ts: Option<String>,
    /// Set when a bot (including this one) authored the message.
    #[serde(default)]
    pub bot_id: Option<String>,
    /// Message subtype (`message_changed`, `channel_join`, ...).
    #[serde(default)]
    pub subtype: Option<String>,
}

impl InboundEvent {
    /// The conversation this event belongs to. A top-level message starts a
    /// thread rooted at its own `ts`.
    pub fn conversation_key(&self) -> ConversationKey {
        let thread_ts = self.thread_ts.as_deref().unwrap_or(&self.ts);
        ConversationKey::new(self.channel_id.clone(), thread_ts)
    }

    /// Author id, or `"unknown"` when Slack omitted it.
    pub fn user(&self) -> &str {
        self.user_id.as_deref().unwrap_or("unknown")
    }

    /// Whether a bot authored this event.
    pub fn is_from_bot(&self, bot_user_id: Option<&str>) -> bool {
        self.bot_id.is_some()
            || self.subtype.as_deref() == Some("bot_message")
            || matches!((bot_user_id, self.user_id.as_deref()), (Some(bot), Some(user)) if bot == user)
    }
}

/// Outgoing reply posted into a thread.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutgoingMessage {
    pub channel_id: String,
    pub thread_ts: Option<String>,
    pub content: OutgoingContent,
}

impl OutgoingMessage {
    /// Reply into the thread identified by `key`.
    pub fn reply(key: &ConversationKey, content: OutgoingContent) -> Self {
        Self {
            channel_id: key.channel_id.clone(),
            thread_ts: Some(key.thread_ts.clone()),
            content,
        }
    }

    pub fn text(&self) -> &str {
        match &self.content {
            OutgoingContent::Text { text } | OutgoingContent::Markdown { text } => text,
        }
    }
}

/// Outgoing message content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum OutgoingContent {
    /// Sent verbatim.
    Text { text: String },
    /// Converted to Slack mrkdwn before sending.
    Markdown { text: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(ts: &str, thread_ts: Option<&str>) -> InboundEvent {
        InboundEvent {
            kind: EventKind::Mention,
            channel_id: "C1".into(),
            user_id: Some("U1".into()),
            text: "hello".into(),
            ts: ts.into(),
            thread_ts: thread_ts.map(String::from),
            bot_id: None,
            subtype: None,
        }
    }

    #[test]
    fn key_defaults_to_own_ts() {
        assert_eq!(event("100", None).conversation_key(), ConversationKey::new("C1", "100"));
    }

    #[test]
    fn key_uses_thread_root() {
        assert_eq!(
            event("105", Some("100")).conversation_key(),
            ConversationKey::new("C1", "100")
        );
    }

    #[test]
    fn key_display() {
        assert_eq!(ConversationKey::new("C1", "100.5").to_string(), "C1:100.5");
    }

    #[test]
    fn bot_detection() {
        let mut e = event("1", None);
        assert!(!e.is_from_bot(Some("UBOT")));
        e.user_id = Some("UBOT".into());
        assert!(e.is_from_bot(Some("UBOT")));
        e.user_id = Some("U1".into());
        e.bot_id = Some("B1".into());
        assert!(e.is_from_bot(None));
    }

    #[test]
    fn inbound_event_deserializes_with_defaults() {
        let json = r#"{"kind":"message","channel_id":"C9","ts":"1.2"}"#;
        let e: InboundEvent = serde_json::from_str(json).unwrap();
        assert_eq!(e.kind, EventKind::Message);
        assert_eq!(e.user(), "unknown");
        assert!(e.text.is_empty());
    }
}
