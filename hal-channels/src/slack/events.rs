//! Slack event payloads.
//!
//! The same `event_callback` body arrives over both transports: as the HTTP
//! body of an Events API request, or as the `payload` of a Socket Mode
//! envelope.

use crate::message::{EventKind, InboundEvent};
use hmac::{Hmac, Mac};
use serde::Deserialize;
use serde_json::Value;
use sha2::Sha256;
use std::collections::{HashSet, VecDeque};
use std::sync::Mutex;

type HmacSha256 = Hmac<Sha256>;

/// Requests older than this are rejected as possible replays.
pub const SIGNATURE_TOLERANCE_SECS: u64 = 60 * 5;

/// How many delivered `event_id`s are remembered for redelivery checks.
pub const RECENT_EVENT_CAPACITY: usize = 1024;

/// Bounded memory of recently accepted Slack `event_id`s.
///
/// Slack redelivers an event when it did not see a timely acknowledgement;
/// the redelivery carries the same `event_id`.
pub struct RecentEvents {
    capacity: usize,
    seen: Mutex<(VecDeque<String>, HashSet<String>)>,
}

impl RecentEvents {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            seen: Mutex::new((VecDeque::new(), HashSet::new())),
        }
    }

    /// Record `event_id`. Returns `false` if it was already recorded.
    pub fn first_seen(&self, event_id: &str) -> bool {
        let Ok(mut guard) = self.seen.lock() else {
            return true;
        };
        let (order, ids) = &mut *guard;
        if !ids.insert(event_id.to_string()) {
            return false;
        }
        order.push_back(event_id.to_string());
        while order.len() > self.capacity {
            if let Some(oldest) = order.pop_front() {
                ids.remove(&oldest);
            }
        }
        true
    }

    /// Drop `event_id` so a redelivery is accepted again.
    pub fn forget(&self, event_id: &str) {
        if let Ok(mut guard) = self.seen.lock() {
            let (order, ids) = &mut *guard;
            if ids.remove(event_id) {
                order.retain(|id| id != event_id);
            }
        }
    }
}

impl Default for RecentEvents {
    fn default() -> Self {
        Self::new(RECENT_EVENT_CAPACITY)
    }
}

/// Body of an Events API request.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventsApiPayload {
    UrlVerification {
        challenge: String,
    },
    EventCallback {
        event: Value,
        #[serde(default)]
        event_id: Option<String>,
    },
    #[serde(other)]
    Unsupported,
}

/// A Socket Mode frame.
#[derive(Debug, Deserialize)]
pub struct SocketEnvelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub envelope_id: Option<String>,
    #[serde(default)]
    pub payload: Option<Value>,
    /// Set on `disconnect` frames (`refresh_requested`, `warning`, ...).
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub retry_attempt: Option<u32>,
}

impl SocketEnvelope {
    /// The acknowledgement Slack expects for this envelope, if any.
    pub fn ack(&self) -> Option<String> {
        self.envelope_id
            .as_ref()
            .map(|id| serde_json::json!({ "envelope_id": id }).to_string())
    }

    /// The `event_id` of the wrapped `event_callback`, if any.
    pub fn event_id(&self) -> Option<String> {
        self.payload
            .as_ref()?
            .get("event_id")?
            .as_str()
            .map(String::from)
    }

    /// The inner chat event, for `events_api` envelopes.
    pub fn event(&self) -> Option<InboundEvent> {
        if self.kind != "events_api" {
            return None;
        }
        let payload = self.payload.clone()?;
        match serde_json::from_value(payload).ok()? {
            EventsApiPayload::EventCallback { event, .. } => parse_event(&event),
            _ => None,
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawEvent {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    channel: Option<String>,
    #[serde(default)]
    user: Option<String>,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    ts: Option<String>,
    #[serde(default)]
    thread_ts: Option<String>,
    #[serde(default)]
    bot_id: Option<String>,
    #[serde(default)]
    subtype: Option<String>,
}

/// Normalize an `app_mention` or `message` event. Other event types, and
/// events without a channel or timestamp, yield `None`.
pub fn parse_event(event: &Value) -> Option<InboundEvent> {
    let raw: RawEvent = serde_json::from_value(event.clone()).ok()?;
    let kind = match raw.kind.as_str() {
        "app_mention" => EventKind::Mention,
        "message" => EventKind::Message,
        _ => return None,
    };

    Some(InboundEvent {
        kind,
        channel_id: raw.channel?,
        user_id: raw.user,
        text: raw.text.unwrap_or_default(),
        ts: raw.ts?,
        thread_ts: raw.thread_ts,
        bot_id: raw.bot_id,
        subtype: raw.subtype,
    })
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SignatureError {
    #[error("missing signature headers")]
    Missing,
    #[error("invalid request timestamp")]
    InvalidTimestamp,
    #[error("request timestamp outside tolerance")]
    Stale,
    #[error("signature mismatch")]
    Mismatch,
}

/// Verify a Slack `X-Slack-Signature` (v0) header against the raw body.
pub fn verify_signature(
    signing_secret: &str,
    timestamp: &str,
    body: &[u8],
    signature: &str,
    now: i64,
) -> Result<(), SignatureError> {
    let ts: i64 = timestamp
        .trim()
        .parse()
        .map_err(|_| SignatureError::InvalidTimestamp)?;
    if now.abs_diff(ts) > SIGNATURE_TOLERANCE_SECS {
        return Err(SignatureError::Stale);
    }

    let provided = signature
        .strip_prefix("v0=")
        .and_then(|hex_sig| hex::decode(hex_sig).ok())
        .ok_or(SignatureError::Mismatch)?;

    let mut mac = HmacSha256::new_from_slice(signing_secret.as_bytes())
        .map_err(|_| SignatureError::Mismatch)?;
    mac.update(b"v0:");
    mac.update(timestamp.as_bytes());
    mac.update(b":");
    mac.update(body);
    mac.verify_slice(&provided)
        .map_err(|_| SignatureError::Mismatch)
}

/// Compute a v0 signature. Used by tests and local tooling.
pub fn sign(signing_secret: &str, timestamp: &str, body: &[u8]) -> String {
    let mut mac = match HmacSha256::new_from_slice(signing_secret.as_bytes()) {
        Ok(m) => m,
        Err(_) => return String::new(),
    };
    mac.update(format!("v0:{timestamp}:").as_bytes());
    mac.update(body);
    format!("v0={}", hex::encode(mac.finalize().into_bytes()))
}
