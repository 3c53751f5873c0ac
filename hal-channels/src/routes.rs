//! HTTP routes for the Hal service.
//!
//! - `GET /health`, `GET /ready`: probes
//! - `POST /slack/events`: Slack Events API webhook (events_api mode only)
//! - `GET /api/v1/sessions`: active conversations

use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use hal_common::config::SlackMode;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::message::InboundEvent;
use crate::registry::{SessionInfo, SessionRegistry};
use crate::slack::events::{parse_event, verify_signature, EventsApiPayload, RecentEvents};

// ============================================================================
// State
// ============================================================================

/// Shared state for the HTTP server.
pub struct HalState {
    pub registry: Arc<SessionRegistry>,
    /// Channel for forwarding inbound Slack events to the processor
    pub event_tx: mpsc::Sender<InboundEvent>,
    /// Secret for `X-Slack-Signature` verification
    pub signing_secret: Option<Arc<str>>,
    pub slack_mode: SlackMode,
    /// Event ids already queued, so Slack's redeliveries are not handled twice
    pub recent_events: RecentEvents,
}

// ============================================================================
// Response Types
// ============================================================================

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    service: &'static str,
    version: &'static str,
    mode: &'static str,
}

#[derive(Debug, Serialize, Deserialize)]
struct WebhookResponse {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    challenge: Option<String>,
}

impl WebhookResponse {
    fn ok() -> Self {
        Self {
            success: true,
            message: None,
            challenge: None,
        }
    }

    fn error(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: Some(message.into()),
            challenge: None,
        }
    }
}

#[derive(Debug, Serialize)]
struct SessionsResponse {
    success: bool,
    data: SessionsData,
}

#[derive(Debug, Serialize)]
struct SessionsData {
    count: usize,
    sessions: Vec<SessionInfo>,
}

// ============================================================================
// Health Routes
// ============================================================================

fn health_body(state: &HalState, status: &'static str) -> HealthResponse {
    HealthResponse {
        status,
        service: "hal",
        version: env!("CARGO_PKG_VERSION"),
        mode: state.slack_mode.as_str(),
    }
}

async fn health(State(state): State<Arc<HalState>>) -> impl IntoResponse {
    Json(health_body(&state, "healthy"))
}

async fn ready(State(state): State<Arc<HalState>>) -> impl IntoResponse {
    if state.event_tx.is_closed() {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(health_body(&state, "not_ready")),
        );
    }

    (StatusCode::OK, Json(health_body(&state, "ready")))
}

// ============================================================================
// Slack Events API
// ============================================================================

async fn slack_events(
    State(state): State<Arc<HalState>>,
    headers: HeaderMap,
    body: Bytes,
) -> impl IntoResponse {
    if let Some(ref secret) = state.signing_secret {
        let header = |name: &str| headers.get(name).and_then(|h| h.to_str().ok());
        let (Some(timestamp), Some(signature)) = (
            header("x-slack-request-timestamp"),
            header("x-slack-signature"),
        ) else {
            return (
                StatusCode::UNAUTHORIZED,
                Json(WebhookResponse::error("missing signature headers")),
            );
        };

        let now = chrono::Utc::now().timestamp();
        if let Err(e) = verify_signature(secret, timestamp, &body, signature, now) {
            tracing::warn!(error = %e, "Rejected Slack request");
            return (
                StatusCode::UNAUTHORIZED,
                Json(WebhookResponse::error(e.to_string())),
            );
        }
    }

    let payload: EventsApiPayload = match serde_json::from_slice(&body) {
        Ok(p) => p,
        Err(e) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(WebhookResponse::error(format!("Invalid payload: {e}"))),
            );
        }
    };

    match payload {
        EventsApiPayload::UrlVerification { challenge } => (
            StatusCode::OK,
            Json(WebhookResponse {
                success: true,
                message: None,
                challenge: Some(challenge),
            }),
        ),
        EventsApiPayload::EventCallback { event, event_id } => {
            let Some(event) = parse_event(&event) else {
                return (StatusCode::OK, Json(WebhookResponse::ok()));
            };

            if let Some(id) = event_id.as_deref() {
                if !state.recent_events.first_seen(id) {
                    tracing::debug!(
                        event_id = id,
                        retry_num = ?headers.get("x-slack-retry-num").and_then(|h| h.to_str().ok()),
                        "Skipping redelivered Slack event"
                    );
                    return (StatusCode::OK, Json(WebhookResponse::ok()));
                }
            }

            tracing::debug!(
                event_id = ?event_id,
                kind = event.kind.as_str(),
                channel_id = %event.channel_id,
                "Slack event received"
            );

            // Slack expects an answer within 3 seconds, so never wait for room.
            let result = state.event_tx.try_send(event);
            if result.is_err() {
                if let Some(id) = event_id.as_deref() {
                    state.recent_events.forget(id);
                }
            }
            match result {
                Ok(()) => (StatusCode::OK, Json(WebhookResponse::ok())),
                Err(mpsc::error::TrySendError::Full(_)) => {
                    tracing::warn!(event_id = ?event_id, "Event queue full, dropping Slack event");
                    (
                        StatusCode::SERVICE_UNAVAILABLE,
                        Json(WebhookResponse::error("event queue full")),
                    )
                }
                Err(mpsc::error::TrySendError::Closed(_)) => (
                    StatusCode::SERVICE_UNAVAILABLE,
                    Json(WebhookResponse::error("event processor stopped")),
                ),
            }
        }
        EventsApiPayload::Unsupported => (StatusCode::OK, Json(WebhookResponse::ok())),
    }
}

// ============================================================================
// Sessions API
// ============================================================================

async fn list_sessions(State(state): State<Arc<HalState>>) -> impl IntoResponse {
    let sessions = state.registry.snapshot();
    Json(SessionsResponse {
        success: true,
        data: SessionsData {
            count: sessions.len(),
            sessions,
        },
    })
}

// ============================================================================
// Router
// ============================================================================

pub fn build_router(state: Arc<HalState>) -> Router {
    let mut router = Router::new()
        // Health endpoints
        .route("/health", get(health))
        .route("/ready", get(ready))
        // Sessions API
        .route("/api/v1/sessions", get(list_sessions));

    if state.slack_mode == SlackMode::EventsApi {
        router = router.route("/slack/events", post(slack_events));
    }

    router.with_state(state)
}

/// Create the HTTP state with its event receiver.
pub fn create_state(
    registry: Arc<SessionRegistry>,
    signing_secret: Option<String>,
    slack_mode: SlackMode,
) -> (Arc<HalState>, mpsc::Receiver<InboundEvent>) {
    let (tx, rx) = mpsc::channel(100);

    let state = Arc::new(HalState {
        registry,
        event_tx: tx,
        signing_secret: signing_secret.map(Arc::from),
        slack_mode,
        recent_events: RecentEvents::default(),
    });

    (state, rx)
}
