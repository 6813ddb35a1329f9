//! Webhook event verification and dispatch.
//!
//! Twitch signs every webhook delivery with
//! `HMAC-SHA256(secret, message_id || timestamp || body)`, hex-encoded
//! behind a `sha256=` prefix. Verification is constant-time. See
//! <https://dev.twitch.tv/docs/eventsub/handling-webhook-events>.
//!
//! Replay note: Twitch recommends dropping events older than ten minutes
//! or with previously-seen ids, which requires keeping event-id state.
//! Instead the planner allows each channel to be tracked only once at a
//! time, which bounds the damage of a replayed notification.

use axum::{
    Router,
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::post,
};
use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::client::Condition;
use crate::events::{EventStreamOffline, EventStreamOnline};

type HmacSha256 = Hmac<Sha256>;

// Webhook request headers.
// https://dev.twitch.tv/docs/eventsub/handling-webhook-events#list-of-request-headers
pub const HEADER_MESSAGE_ID: &str = "Twitch-Eventsub-Message-Id";
pub const HEADER_MESSAGE_TIMESTAMP: &str = "Twitch-Eventsub-Message-Timestamp";
pub const HEADER_MESSAGE_SIGNATURE: &str = "Twitch-Eventsub-Message-Signature";
pub const HEADER_MESSAGE_TYPE: &str = "Twitch-Eventsub-Message-Type";

// Webhook message types.
pub const MESSAGE_NOTIFICATION: &str = "notification";
pub const MESSAGE_VERIFICATION: &str = "webhook_callback_verification";
pub const MESSAGE_REVOCATION: &str = "revocation";

// Subscription types the tracker consumes.
pub const SUB_STREAM_ONLINE: &str = "stream.online";
pub const SUB_STREAM_OFFLINE: &str = "stream.offline";

const SIGNATURE_PREFIX: &str = "sha256=";

/// Compute the signature header value for a webhook delivery.
pub fn signature(secret: &[u8], id: &str, timestamp: &str, body: &[u8]) -> String {
    let mut mac = HmacSha256::new_from_slice(secret).expect("hmac accepts keys of any length");
    mac.update(id.as_bytes());
    mac.update(timestamp.as_bytes());
    mac.update(body);
    format!("{SIGNATURE_PREFIX}{}", hex::encode(mac.finalize().into_bytes()))
}

/// Read-only views over the signed parts of a webhook delivery.
#[derive(Debug, Clone, Copy)]
pub struct WebhookHeaders<'a> {
    pub id: &'a str,
    pub timestamp: &'a str,
    pub signature: &'a str,
    pub body: &'a [u8],
}

impl WebhookHeaders<'_> {
    /// Verify the delivery against `secret`. The digest comparison is
    /// constant-time against the header value.
    pub fn valid(&self, secret: &[u8]) -> bool {
        let Some(hex_digest) = self.signature.strip_prefix(SIGNATURE_PREFIX) else {
            return false;
        };
        let Ok(claimed) = hex::decode(hex_digest) else {
            return false;
        };
        let mut mac = HmacSha256::new_from_slice(secret).expect("hmac accepts keys of any length");
        mac.update(self.id.as_bytes());
        mac.update(self.timestamp.as_bytes());
        mac.update(self.body);
        mac.verify_slice(&claimed).is_ok()
    }
}

/// Subscription metadata carried in every webhook payload.
#[derive(Debug, Clone, Deserialize)]
pub struct SubscriptionMeta {
    pub id: String,
    #[serde(default)]
    pub status: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub version: String,
    #[serde(default)]
    pub cost: i64,
    pub condition: Condition,
}

/// Payload handed to the revocation handler.
#[derive(Debug, Clone, Deserialize)]
pub struct RevocationPayload {
    pub subscription: SubscriptionMeta,
}

#[derive(Debug, Deserialize)]
struct NotificationEnvelope {
    subscription: SubscriptionMeta,
    event: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct VerificationEnvelope {
    challenge: String,
}

type OnlineHandler = Box<dyn Fn(EventStreamOnline) + Send + Sync>;
type OfflineHandler = Box<dyn Fn(EventStreamOffline) + Send + Sync>;
type RevocationHandler = Box<dyn Fn(RevocationPayload) + Send + Sync>;

/// Verifies webhook deliveries and dispatches decoded events to the
/// registered handlers.
///
/// Handlers run on the request task and must not block; spawn from within
/// the handler for long-lived work.
pub struct WebhookDispatch {
    secret: Vec<u8>,
    on_online: Option<OnlineHandler>,
    on_offline: Option<OfflineHandler>,
    on_revocation: Option<RevocationHandler>,
}

impl WebhookDispatch {
    pub fn new(secret: impl Into<Vec<u8>>) -> Self {
        Self {
            secret: secret.into(),
            on_online: None,
            on_offline: None,
            on_revocation: None,
        }
    }

    /// Register the `stream.online` handler.
    pub fn on_stream_online(mut self, f: impl Fn(EventStreamOnline) + Send + Sync + 'static) -> Self {
        self.on_online = Some(Box::new(f));
        self
    }

    /// Register the `stream.offline` handler.
    pub fn on_stream_offline(
        mut self,
        f: impl Fn(EventStreamOffline) + Send + Sync + 'static,
    ) -> Self {
        self.on_offline = Some(Box::new(f));
        self
    }

    /// Register the revocation handler.
    pub fn on_revocation(mut self, f: impl Fn(RevocationPayload) + Send + Sync + 'static) -> Self {
        self.on_revocation = Some(Box::new(f));
        self
    }

    /// Build a router serving `POST endpoint` with this dispatcher.
    pub fn into_router(self, endpoint: &str) -> Router {
        Router::new()
            .route(endpoint, post(handle_webhook))
            .with_state(Arc::new(self))
    }
}

fn header<'a>(headers: &'a HeaderMap, name: &str) -> &'a str {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
}

async fn handle_webhook(
    State(dispatch): State<Arc<WebhookDispatch>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let delivery = WebhookHeaders {
        id: header(&headers, HEADER_MESSAGE_ID),
        timestamp: header(&headers, HEADER_MESSAGE_TIMESTAMP),
        signature: header(&headers, HEADER_MESSAGE_SIGNATURE),
        body: &body,
    };
    if !delivery.valid(&dispatch.secret) {
        warn!(message_id = delivery.id, "webhook signature mismatch");
        return (StatusCode::UNAUTHORIZED, "invalid signature").into_response();
    }

    match header(&headers, HEADER_MESSAGE_TYPE) {
        MESSAGE_NOTIFICATION => dispatch_notification(&dispatch, &body),
        MESSAGE_VERIFICATION => {
            let Ok(env) = serde_json::from_slice::<VerificationEnvelope>(&body) else {
                return (StatusCode::BAD_REQUEST, "invalid verification body").into_response();
            };
            if env.challenge.is_empty() {
                return (StatusCode::BAD_REQUEST, "empty challenge").into_response();
            }
            debug!(message_id = delivery.id, "answering verification challenge");
            env.challenge.into_response()
        }
        MESSAGE_REVOCATION => {
            let Ok(payload) = serde_json::from_slice::<RevocationPayload>(&body) else {
                return (StatusCode::BAD_REQUEST, "invalid revocation body").into_response();
            };
            warn!(
                subscription_id = %payload.subscription.id,
                kind = %payload.subscription.kind,
                status = %payload.subscription.status,
                "subscription revoked"
            );
            if let Some(cb) = &dispatch.on_revocation {
                cb(payload);
            }
            StatusCode::OK.into_response()
        }
        other => {
            debug!(message_type = other, "unknown webhook message type");
            (StatusCode::BAD_REQUEST, "unknown message type").into_response()
        }
    }
}

fn dispatch_notification(dispatch: &WebhookDispatch, body: &[u8]) -> Response {
    let Ok(env) = serde_json::from_slice::<NotificationEnvelope>(body) else {
        return (StatusCode::BAD_REQUEST, "invalid notification body").into_response();
    };
    match env.subscription.kind.as_str() {
        SUB_STREAM_ONLINE => {
            let Ok(evt) = serde_json::from_value::<EventStreamOnline>(env.event) else {
                return (StatusCode::BAD_REQUEST, "invalid stream.online event").into_response();
            };
            if let Some(cb) = &dispatch.on_online {
                cb(evt);
            }
            StatusCode::OK.into_response()
        }
        SUB_STREAM_OFFLINE => {
            let Ok(evt) = serde_json::from_value::<EventStreamOffline>(env.event) else {
                return (StatusCode::BAD_REQUEST, "invalid stream.offline event").into_response();
            };
            if let Some(cb) = &dispatch.on_offline {
                cb(evt);
            }
            StatusCode::OK.into_response()
        }
        other => {
            debug!(kind = other, "unknown notification subscription type");
            (StatusCode::BAD_REQUEST, "unknown subscription type").into_response()
        }
    }
}
