//! EventSub subscription client.
//!
//! Creates `stream.online` / `stream.offline` webhook subscriptions on
//! behalf of the tracker. App credentials go through the client-credentials
//! grant; the bearer token is cached and refreshed shortly before expiry.
//! No retry is performed here — callers decide what a failed create means.

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::debug;

pub const DEFAULT_API_URL: &str = "https://api.twitch.tv/helix";
pub const DEFAULT_AUTH_URL: &str = "https://id.twitch.tv";

const EVENTSUB_PATH: &str = "/eventsub";

// Refresh the app token this long before it actually expires.
const TOKEN_EXPIRY_MARGIN_SECS: i64 = 60;

#[derive(Debug, Error)]
pub enum EventSubError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("expected 200 response, got {0}")]
    Status(u16),
    #[error("token exchange failed with status {0}")]
    TokenStatus(u16),
}

/// App credentials for the client-credentials grant.
#[derive(Debug, Clone)]
pub struct ClientCreds {
    pub client_id: String,
    pub client_secret: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Condition {
    pub broadcaster_user_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transport {
    pub method: String,
    pub callback: String,
    pub secret: String,
}

/// A subscription create request, serialized verbatim as the POST body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscription {
    #[serde(rename = "type")]
    pub kind: String,
    pub version: String,
    pub condition: Condition,
    pub transport: Transport,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: i64,
}

#[derive(Debug, Clone)]
struct CachedToken {
    bearer: String,
    expires_at: DateTime<Utc>,
}

/// Client for the EventSub subscriptions endpoint.
pub struct EventSub {
    creds: ClientCreds,
    http: reqwest::Client,
    /// Overridable for tests pointing at a local capture server.
    pub api_url: String,
    pub auth_url: String,
    exchange_enabled: bool,
    token: Mutex<Option<CachedToken>>,
}

impl EventSub {
    /// Client with the credentials exchange enabled.
    pub fn new(creds: ClientCreds) -> Self {
        Self::build(creds, true)
    }

    /// Client that never exchanges credentials and sends unauthenticated
    /// requests. Lets tests construct the client without valid platform
    /// credentials.
    pub fn without_exchange(creds: ClientCreds) -> Self {
        Self::build(creds, false)
    }

    fn build(creds: ClientCreds, exchange_enabled: bool) -> Self {
        Self {
            creds,
            http: reqwest::Client::new(),
            api_url: DEFAULT_API_URL.to_owned(),
            auth_url: DEFAULT_AUTH_URL.to_owned(),
            exchange_enabled,
            token: Mutex::new(None),
        }
    }

    /// Create an EventSub webhook subscription. Any non-200 response is an
    /// error.
    pub async fn create_subscription(&self, sub: &Subscription) -> Result<(), EventSubError> {
        let url = format!("{}{EVENTSUB_PATH}/subscriptions", self.api_url);
        let mut req = self.http.post(&url).json(sub);
        if let Some(bearer) = self.bearer().await? {
            req = req
                .bearer_auth(bearer)
                .header("Client-Id", &self.creds.client_id);
        }
        let resp = req.send().await?;
        if resp.status().as_u16() != 200 {
            return Err(EventSubError::Status(resp.status().as_u16()));
        }
        Ok(())
    }

    /// Current bearer token, exchanging or refreshing if needed. `None`
    /// when the exchange is disabled.
    async fn bearer(&self) -> Result<Option<String>, EventSubError> {
        if !self.exchange_enabled {
            return Ok(None);
        }
        let mut slot = self.token.lock().await;
        if let Some(cached) = slot.as_ref() {
            if cached.expires_at > Utc::now() {
                return Ok(Some(cached.bearer.clone()));
            }
        }

        debug!("exchanging client credentials for app token");
        let resp = self
            .http
            .post(format!("{}/oauth2/token", self.auth_url))
            .form(&[
                ("client_id", self.creds.client_id.as_str()),
                ("client_secret", self.creds.client_secret.as_str()),
                ("grant_type", "client_credentials"),
            ])
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(EventSubError::TokenStatus(resp.status().as_u16()));
        }
        let token: TokenResponse = resp.json().await?;
        let expires_at = Utc::now()
            + TimeDelta::seconds((token.expires_in - TOKEN_EXPIRY_MARGIN_SECS).max(0));
        let bearer = token.access_token.clone();
        *slot = Some(CachedToken {
            bearer: token.access_token,
            expires_at,
        });
        Ok(Some(bearer))
    }
}
