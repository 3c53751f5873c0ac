//! Hal Channels - Slack adapter for the Hal copywriting agent.
//!
//! Each Slack thread the bot is mentioned in becomes a session with its own
//! teachable agent. Follow-ups in the thread are forwarded to that agent until
//! the user types `-exit` or the thread goes quiet.
//!
//! ## Architecture
//!
//! ```text
//! Slack ─ Socket Mode / Events API ─→ event queue ─→ Dispatcher ─→ AgentFramework
//!                                                       │   ↑
//!   ←──────────── chat.postMessage ─────────────────────┘   │
//!                                          SessionRegistry ─┘ (per-thread timers)
//! ```

#![warn(clippy::all)]
#![allow(clippy::pedantic)]

pub mod agent;
pub mod dispatcher;
pub mod message;
pub mod registry;
pub mod routes;
pub mod slack;
pub mod timer;
pub mod traits;

#[cfg(test)]
pub(crate) mod testing;

// Re-export commonly used types
pub use agent::{AgentError, AgentFramework, AgentHandle, HttpAgentFramework, ProxyHandle};
pub use dispatcher::{Command, Dispatch, Dispatcher, IgnoreReason};
pub use message::{ConversationKey, EventKind, InboundEvent, OutgoingContent, OutgoingMessage};
pub use registry::{EndReason, Session, SessionGuard, SessionInfo, SessionRegistry};
pub use routes::{build_router, create_state, HalState};
pub use slack::{SlackChannel, SocketModeClient};
pub use timer::InactivityTimer;
pub use traits::{Channel, ChannelError, ChannelResult};

use anyhow::Context;
use hal_common::config::{Config, SlackMode};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::limit::RequestBodyLimitLayer;
use tracing::Instrument;

/// Slack event bodies are small; anything larger is not from Slack.
const MAX_BODY_BYTES: usize = 1024 * 1024;

/// Consume inbound events, handling each one on its own task.
pub fn spawn_processor(
    dispatcher: Arc<Dispatcher>,
    mut rx: mpsc::Receiver<InboundEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            let dispatcher = Arc::clone(&dispatcher);
            tokio::spawn(async move {
                let trace_id = hal_common::logging::generate_trace_id();
                let span = hal_common::channel_span!(
                    "slack",
                    trace_id,
                    event.user(),
                    conversation = %event.conversation_key(),
                    kind = event.kind.as_str()
                );
                dispatcher.dispatch(&event).instrument(span).await;
            });
        }
        tracing::info!("Event processor stopped");
    })
}

/// Resolve the bot's own user id, from config or `auth.test`.
async fn resolve_bot_user_id(config: &Config, slack: &SlackChannel) -> anyhow::Result<String> {
    if let Some(id) = config.slack.bot_user_id.clone().filter(|id| !id.is_empty()) {
        return Ok(id);
    }

    let identity = slack
        .auth_test()
        .await
        .context("Slack auth.test failed; check the bot token")?;
    tracing::info!(
        bot_user_id = %identity.user_id,
        bot_id = ?identity.bot_id,
        team = ?identity.team,
        "Authenticated with Slack"
    );
    Ok(identity.user_id)
}

/// Start the Hal service and run until Ctrl+C or SIGTERM.
pub async fn start_server(config: &Config) -> anyhow::Result<()> {
    let addr: SocketAddr = config
        .listen_addr()
        .parse()
        .with_context(|| format!("Invalid listen address {}", config.listen_addr()))?;

    let slack = Arc::new(
        SlackChannel::from_config(config).context("Slack bot token is not configured")?,
    );
    let bot_user_id = resolve_bot_user_id(config, &slack).await?;

    let agent: Arc<dyn AgentFramework> = Arc::new(HttpAgentFramework::from_config(&config.agent));
    let registry = Arc::new(SessionRegistry::from_config(agent, config));
    let reaper_handle = registry.spawn_reaper();

    let dispatcher = Arc::new(
        Dispatcher::new(Arc::clone(&registry), slack.clone(), config).with_bot_user_id(bot_user_id),
    );

    let (state, rx) = create_state(
        Arc::clone(&registry),
        config.slack_signing_secret(),
        config.slack.mode,
    );
    let event_tx = state.event_tx.clone();
    let router = build_router(state).layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES));

    let processor_handle = spawn_processor(dispatcher, rx);

    let cancel = CancellationToken::new();
    let socket_handle = match config.slack.mode {
        SlackMode::Socket => {
            let app_token = config
                .slack_app_token()
                .context("Socket Mode needs secrets.slack_app_token")?;
            let client = SocketModeClient::new(
                slack.clone(),
                app_token,
                Duration::from_secs(config.slack.reconnect_delay_secs),
            );
            let cancel = cancel.clone();
            Some(tokio::spawn(async move {
                if let Err(e) = client.run(event_tx, cancel).await {
                    tracing::error!(error = %e, "Slack Socket Mode stopped");
                }
            }))
        }
        SlackMode::EventsApi => {
            drop(event_tx);
            None
        }
    };

    tracing::info!(
        addr = %addr,
        mode = config.slack.mode.as_str(),
        inactivity_timeout_secs = config.session.inactivity_timeout_secs,
        "Starting Hal"
    );

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal(cancel.clone()))
        .await?;

    // Clean up on shutdown
    cancel.cancel();
    if let Some(handle) = socket_handle {
        let _ = handle.await;
    }
    processor_handle.abort();
    registry.shutdown().await;
    if let Some(handle) = reaper_handle {
        handle.abort();
    }

    tracing::info!("Hal stopped");
    Ok(())
}

async fn shutdown_signal(cancel: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => tracing::info!("Received Ctrl+C, shutting down"),
        () = terminate => tracing::info!("Received SIGTERM, shutting down"),
        () = cancel.cancelled() => {}
    }
}
