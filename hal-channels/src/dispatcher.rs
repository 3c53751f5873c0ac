//! Command dispatcher.
//!
//! Turns inbound Slack events into session lifecycle actions or agent calls
//! and posts the result back into the originating thread.
//!
//! Follow-up messages are matched case-insensitively against the keywords
//! below, first match wins:
//!
//! | keyword  | action                                   |
//! |----------|------------------------------------------|
//! | `-learn` | commit the conversation to memory        |
//! | `-reset` | clear the agent's chat history           |
//! | `-exit`  | close the session                        |
//! | (none)   | forward the text and relay the reply     |

use crate::agent::AgentResult;
use crate::message::{ConversationKey, EventKind, InboundEvent, OutgoingContent, OutgoingMessage};
use crate::registry::{EndReason, Session, SessionRegistry};
use crate::slack::format::{mentions_user, strip_mention};
use crate::traits::Channel;
use hal_common::config::Config;
use std::sync::Arc;

pub const LEARN_REPLY: &str = "Adding that to the memory bank...";
pub const RESET_REPLY: &str = "I wiped out our chat history. Let's start fresh — Hi, I'm Hal.";
pub const EXIT_REPLY: &str = "I'll close out this session. Let's talk later!";
pub const FAILURE_REPLY: &str = "Sorry, I ran into a problem talking to my brain. Please try again.";

/// Keyword command carried by a follow-up message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Learn,
    Reset,
    Exit,
    Chat,
}

impl Command {
    pub fn parse(text: &str) -> Self {
        let lower = text.to_lowercase();
        if lower.contains("-learn") {
            Self::Learn
        } else if lower.contains("-reset") {
            Self::Reset
        } else if lower.contains("-exit") {
            Self::Exit
        } else {
            Self::Chat
        }
    }
}

/// Why an event was dropped without a reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IgnoreReason {
    FromBot,
    Subtype,
    MentionsBot,
    UserNotAllowed,
    NoSession,
    EmptyText,
}

impl IgnoreReason {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::FromBot => "from_bot",
            Self::Subtype => "subtype",
            Self::MentionsBot => "mentions_bot",
            Self::UserNotAllowed => "user_not_allowed",
            Self::NoSession => "no_session",
            Self::EmptyText => "empty_text",
        }
    }
}

/// What the dispatcher did with an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    Ignored(IgnoreReason),
    Chatted,
    Learned,
    Reset,
    Exited,
    /// An agent call failed or timed out; the user got the failure reply.
    Failed,
}

pub struct Dispatcher {
    registry: Arc<SessionRegistry>,
    channel: Arc<dyn Channel>,
    bot_user_id: Option<String>,
    allowed_users: Vec<String>,
    mention_clears_history: bool,
}

impl Dispatcher {
    pub fn new(
        registry: Arc<SessionRegistry>,
        channel: Arc<dyn Channel>,
        config: &Config,
    ) -> Self {
        Self {
            registry,
            channel,
            bot_user_id: config.slack.bot_user_id.clone(),
            allowed_users: config.slack.allowed_users.clone(),
            mention_clears_history: config.session.mention_clears_history,
        }
    }

    /// Set the bot's own user id, used to drop its echoes and strip mentions.
    pub fn with_bot_user_id(mut self, bot_user_id: impl Into<String>) -> Self {
        self.bot_user_id = Some(bot_user_id.into());
        self
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub async fn dispatch(&self, event: &InboundEvent) -> Dispatch {
        let outcome = match event.kind {
            EventKind::Mention => self.handle_mention(event).await,
            EventKind::Message => self.handle_message(event).await,
        };

        match outcome {
            Dispatch::Ignored(reason) => tracing::debug!(
                kind = event.kind.as_str(),
                reason = reason.as_str(),
                "Event ignored"
            ),
            other => tracing::debug!(kind = event.kind.as_str(), outcome = ?other, "Event handled"),
        }
        outcome
    }

    /// A mention opens (or reuses) the thread's session and starts a chat.
    pub async fn handle_mention(&self, event: &InboundEvent) -> Dispatch {
        if event.is_from_bot(self.bot_user_id.as_deref()) {
            return Dispatch::Ignored(IgnoreReason::FromBot);
        }
        if !self.is_user_allowed(event.user()) {
            return Dispatch::Ignored(IgnoreReason::UserNotAllowed);
        }

        let key = event.conversation_key();
        self.registry.touch(&key);
        let text = self.strip_bot_mention(&event.text);

        let mut session = match self.registry.get_or_create(&key, event.user()).await {
            Ok((session, _)) => session,
            Err(e) => {
                tracing::error!(conversation = %key, error = %e, "Failed to open session");
                self.reply(&key, OutgoingContent::Text { text: FAILURE_REPLY.into() })
                    .await;
                return Dispatch::Failed;
            }
        };
        session.touch();

        let outcome = self.converse(&session, &text, true).await;
        drop(session);
        self.relay(&key, outcome).await
    }

    /// A follow-up in a thread that already has a session.
    pub async fn handle_message(&self, event: &InboundEvent) -> Dispatch {
        if event.is_from_bot(self.bot_user_id.as_deref()) {
            return Dispatch::Ignored(IgnoreReason::FromBot);
        }
        if event.subtype.is_some() {
            return Dispatch::Ignored(IgnoreReason::Subtype);
        }
        if let Some(bot) = self.bot_user_id.as_deref() {
            if mentions_user(&event.text, bot) {
                return Dispatch::Ignored(IgnoreReason::MentionsBot);
            }
        }
        if event.text.trim().is_empty() {
            return Dispatch::Ignored(IgnoreReason::EmptyText);
        }
        if !self.is_user_allowed(event.user()) {
            return Dispatch::Ignored(IgnoreReason::UserNotAllowed);
        }

        let key = event.conversation_key();
        self.registry.touch(&key);
        let Some(mut session) = self.registry.get(&key).await else {
            return Dispatch::Ignored(IgnoreReason::NoSession);
        };

        let agent = Arc::clone(self.registry.agent());
        match Command::parse(&event.text) {
            Command::Learn => {
                session.touch();
                let result = self
                    .registry
                    .bounded(agent.learn_from_feedback(&session.agent))
                    .await;
                drop(session);
                self.acknowledge(&key, result, LEARN_REPLY, Dispatch::Learned)
                    .await
            }
            Command::Reset => {
                session.touch();
                let result = self
                    .registry
                    .bounded(agent.clear_history(&session.proxy, &session.agent))
                    .await;
                drop(session);
                self.acknowledge(&key, result, RESET_REPLY, Dispatch::Reset)
                    .await
            }
            Command::Exit => {
                self.registry.end(session, EndReason::Exit).await;
                self.reply(&key, OutgoingContent::Text { text: EXIT_REPLY.into() })
                    .await;
                Dispatch::Exited
            }
            Command::Chat => {
                session.touch();
                let outcome = self.converse(&session, &event.text, false).await;
                drop(session);
                self.relay(&key, outcome).await
            }
        }
    }

    async fn converse(&self, session: &Session, text: &str, initiate: bool) -> AgentResult<String> {
        let agent = self.registry.agent();
        if initiate {
            self.registry
                .bounded(agent.initiate(
                    &session.proxy,
                    &session.agent,
                    text,
                    self.mention_clears_history,
                ))
                .await?;
        } else {
            self.registry
                .bounded(agent.send(&session.proxy, &session.agent, text))
                .await?;
        }
        self.registry
            .bounded(agent.last_reply(&session.agent, &session.proxy))
            .await
    }

    async fn relay(&self, key: &ConversationKey, outcome: AgentResult<String>) -> Dispatch {
        match outcome {
            Ok(reply) => {
                self.reply(key, OutgoingContent::Markdown { text: reply }).await;
                Dispatch::Chatted
            }
            Err(e) => {
                tracing::error!(conversation = %key, error = %e, "Agent call failed");
                self.reply(key, OutgoingContent::Text { text: FAILURE_REPLY.into() })
                    .await;
                Dispatch::Failed
            }
        }
    }

    async fn acknowledge(
        &self,
        key: &ConversationKey,
        result: AgentResult<()>,
        text: &str,
        done: Dispatch,
    ) -> Dispatch {
        match result {
            Ok(()) => {
                self.reply(key, OutgoingContent::Text { text: text.into() }).await;
                done
            }
            Err(e) => self.relay(key, Err(e)).await,
        }
    }

    /// Post into the thread. Failures are logged and dropped.
    async fn reply(&self, key: &ConversationKey, content: OutgoingContent) {
        let message = OutgoingMessage::reply(key, content);
        if let Err(e) = self.channel.send(message).await {
            tracing::warn!(
                channel = self.channel.name(),
                conversation = %key,
                error = %e,
                "Failed to post reply"
            );
        }
    }

    fn strip_bot_mention(&self, text: &str) -> String {
        match self.bot_user_id.as_deref() {
            Some(bot) => strip_mention(text, bot),
            None => text.trim().to_string(),
        }
    }

    fn is_user_allowed(&self, user_id: &str) -> bool {
        self.allowed_users.iter().any(|u| u == "*" || u == user_id)
    }
}
