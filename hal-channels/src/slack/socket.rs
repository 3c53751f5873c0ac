//! Slack Socket Mode client.
//!
//! Opens a WebSocket URL with the app-level token (`apps.connections.open`),
//! acknowledges every envelope by id, forwards chat events, and reconnects
//! when Slack asks for it or the socket drops.

use super::events::{RecentEvents, SocketEnvelope};
use super::SlackChannel;
use crate::message::InboundEvent;
use crate::traits::{ChannelError, ChannelResult};
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

/// What to do with one decoded text frame.
#[derive(Debug, Default, PartialEq)]
pub struct Frame {
    /// Acknowledgement to send back before anything else.
    pub ack: Option<String>,
    pub event: Option<InboundEvent>,
    /// Slack's id for `event`, shared by every delivery of it.
    pub event_id: Option<String>,
    /// Set when Slack asked us to reconnect.
    pub disconnect: Option<String>,
}

/// Decode a Socket Mode text frame. Unparseable frames decode to nothing.
pub fn decode_frame(text: &str) -> Frame {
    let envelope: SocketEnvelope = match serde_json::from_str(text) {
        Ok(envelope) => envelope,
        Err(e) => {
            tracing::debug!(error = %e, "Ignoring unparseable Socket Mode frame");
            return Frame::default();
        }
    };

    match envelope.kind.as_str() {
        "hello" => tracing::info!("Slack Socket Mode connection ready"),
        "disconnect" => {
            return Frame {
                ack: envelope.ack(),
                disconnect: Some(envelope.reason.unwrap_or_else(|| "unspecified".into())),
                ..Frame::default()
            }
        }
        _ => {}
    }

    if let Some(attempt) = envelope.retry_attempt.filter(|n| *n > 0) {
        tracing::debug!(
            envelope_id = ?envelope.envelope_id,
            retry_attempt = attempt,
            "Slack redelivered an envelope"
        );
    }

    Frame {
        ack: envelope.ack(),
        event: envelope.event(),
        event_id: envelope.event_id(),
        disconnect: None,
    }
}

/// Why a single connection ended.
#[derive(Debug, PartialEq, Eq)]
enum ConnectionEnd {
    Reconnect(String),
    Shutdown,
}

pub struct SocketModeClient {
    web: Arc<SlackChannel>,
    app_token: String,
    reconnect_delay: Duration,
    recent: RecentEvents,
}

impl SocketModeClient {
    pub fn new(web: Arc<SlackChannel>, app_token: impl Into<String>, reconnect_delay: Duration) -> Self {
        Self {
            web,
            app_token: app_token.into(),
            reconnect_delay,
            recent: RecentEvents::default(),
        }
    }

    /// Ask Slack for a fresh WebSocket URL.
    pub async fn open_connection(&self) -> ChannelResult<String> {
        let data = self
            .web
            .call("apps.connections.open", &self.app_token, None)
            .await?;
        data.get("url")
            .and_then(|u| u.as_str())
            .map(String::from)
            .ok_or_else(|| ChannelError::Connection("apps.connections.open returned no url".into()))
    }

    /// Forward events to `tx` until `cancel` fires or the receiver goes away.
    ///
    /// Connection failures are retried after the reconnect delay; an
    /// authentication failure ends the loop with an error.
    pub async fn run(
        &self,
        tx: mpsc::Sender<InboundEvent>,
        cancel: CancellationToken,
    ) -> ChannelResult<()> {
        loop {
            match self.run_once(&tx, &cancel).await {
                Ok(ConnectionEnd::Shutdown) => return Ok(()),
                Ok(ConnectionEnd::Reconnect(reason)) => {
                    tracing::info!(reason = %reason, "Slack Socket Mode reconnecting");
                }
                Err(ChannelError::Auth(e)) => {
                    tracing::error!(error = %e, "Slack Socket Mode authentication failed");
                    return Err(ChannelError::Auth(e));
                }
                Err(e) => {
                    tracing::warn!(
                        error = %e,
                        retry_in_secs = self.reconnect_delay.as_secs(),
                        "Slack Socket Mode connection failed"
                    );
                }
            }

            if tx.is_closed() {
                return Ok(());
            }
            tokio::select! {
                () = cancel.cancelled() => return Ok(()),
                () = tokio::time::sleep(self.reconnect_delay) => {}
            }
        }
    }

    async fn run_once(
        &self,
        tx: &mpsc::Sender<InboundEvent>,
        cancel: &CancellationToken,
    ) -> ChannelResult<ConnectionEnd> {
        let url = self.open_connection().await?;
        tracing::info!("Slack Socket Mode: connecting...");

        let (ws_stream, _) = tokio_tungstenite::connect_async(url.as_str())
            .await
            .map_err(|e| ChannelError::Connection(format!("WebSocket connection failed: {e}")))?;
        let (mut write, mut read) = ws_stream.split();

        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    let _ = write.send(Message::Close(None)).await;
                    return Ok(ConnectionEnd::Shutdown);
                }
                msg = read.next() => {
                    let text = match msg {
                        Some(Ok(Message::Text(t))) => t,
                        Some(Ok(Message::Ping(payload))) => {
                            let _ = write.send(Message::Pong(payload)).await;
                            continue;
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            return Ok(ConnectionEnd::Reconnect("socket closed".into()));
                        }
                        Some(Ok(_)) => continue,
                        Some(Err(e)) => {
                            return Err(ChannelError::Connection(format!("WebSocket error: {e}")));
                        }
                    };

                    let frame = decode_frame(&text);
                    if let Some(ack) = frame.ack {
                        write
                            .send(Message::Text(ack))
                            .await
                            .map_err(|e| ChannelError::Connection(format!("Failed to ack envelope: {e}")))?;
                    }
                    if let Some(reason) = frame.disconnect {
                        return Ok(ConnectionEnd::Reconnect(reason));
                    }
                    if let Some(event) = frame.event {
                        if let Some(id) = frame.event_id.as_deref() {
                            if !self.recent.first_seen(id) {
                                tracing::debug!(event_id = id, "Skipping redelivered Slack event");
                                continue;
                            }
                        }
                        tracing::debug!(
                            kind = event.kind.as_str(),
                            channel_id = %event.channel_id,
                            "Slack event received"
                        );
                        if tx.send(event).await.is_err() {
                            return Ok(ConnectionEnd::Shutdown);
                        }
                    }
                }
            }
        }
    }
}
