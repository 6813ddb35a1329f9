//! Tracker configuration loading.
//!
//! TOML is the sole config source; no environment variable overrides.
//! Default config path: `/etc/viewflow/tracker.toml`.
//!
//! # Required fields
//! - `schema_version = 1`
//! - `webhook.public_url`, `webhook.secret`
//! - `twitch.client_id`, `twitch.client_secret`
//!
//! Everything else has documented defaults.

use serde::Deserialize;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("io: {0}")]
    Io(String),
    #[error("parse: {0}")]
    Parse(String),
    #[error("invalid config: {0}")]
    Invalid(String),
}

// ---------------------------------------------------------------------------
// Config types (validated)
// ---------------------------------------------------------------------------

/// Top-level tracker configuration.
#[derive(Debug, Clone)]
pub struct TrackerConfig {
    pub schema_version: u32,
    pub webhook: WebhookConfig,
    pub twitch: TwitchConfig,
    pub tracker: TrackingConfig,
    pub reconcile: ReconcileConfig,
    pub storage: StorageConfig,
}

#[derive(Debug, Clone)]
pub struct WebhookConfig {
    /// Externally reachable base URL, e.g. `https://vf.example.com`.
    pub public_url: String,
    pub endpoint: String,
    /// Shared HMAC secret; Twitch requires 10-100 characters.
    pub secret: String,
    pub port: u16,
}

#[derive(Debug, Clone)]
pub struct TwitchConfig {
    pub client_id: String,
    pub client_secret: String,
    pub api_url: String,
    pub auth_url: String,
    pub chatters_url: String,
}

#[derive(Debug, Clone)]
pub struct TrackingConfig {
    pub interval_minutes: u64,
    pub online_timeout_hours: u64,
    pub worker_timeout_secs: u64,
    pub max_batch: u64,
    /// Test hook: skip the minute-of-hour alignment sleep.
    pub skip_align: bool,
}

#[derive(Debug, Clone)]
pub struct ReconcileConfig {
    pub window_hours: u64,
    pub margin_minutes: u64,
    pub interval_minutes: u64,
}

#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub sqlite_path: String,
}

// ---------------------------------------------------------------------------
// Raw TOML deserialization types (with Option for optional fields)
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct RawConfig {
    schema_version: Option<u32>,
    webhook: Option<RawWebhookConfig>,
    twitch: Option<RawTwitchConfig>,
    tracker: Option<RawTrackingConfig>,
    reconcile: Option<RawReconcileConfig>,
    storage: Option<RawStorageConfig>,
}

#[derive(Debug, Default, Deserialize)]
struct RawWebhookConfig {
    public_url: Option<String>,
    endpoint: Option<String>,
    secret: Option<String>,
    port: Option<u16>,
}

#[derive(Debug, Default, Deserialize)]
struct RawTwitchConfig {
    client_id: Option<String>,
    client_secret: Option<String>,
    api_url: Option<String>,
    auth_url: Option<String>,
    chatters_url: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct RawTrackingConfig {
    interval_minutes: Option<u64>,
    online_timeout_hours: Option<u64>,
    worker_timeout_secs: Option<u64>,
    max_batch: Option<u64>,
    skip_align: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
struct RawReconcileConfig {
    window_hours: Option<u64>,
    margin_minutes: Option<u64>,
    interval_minutes: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct RawStorageConfig {
    sqlite_path: Option<String>,
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// Load tracker config from the default path `/etc/viewflow/tracker.toml`.
pub fn load_config() -> Result<TrackerConfig, ConfigError> {
    load_config_from_path(Path::new("/etc/viewflow/tracker.toml"))
}

/// Load tracker config from a custom path.
pub fn load_config_from_path(path: &Path) -> Result<TrackerConfig, ConfigError> {
    let toml_str = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::Io(format!("reading config file '{}': {e}", path.display())))?;
    load_config_from_str(&toml_str)
}

/// Load tracker config from a TOML string.
pub fn load_config_from_str(toml_str: &str) -> Result<TrackerConfig, ConfigError> {
    let raw: RawConfig = toml::from_str(toml_str).map_err(|e| ConfigError::Parse(e.to_string()))?;

    let schema_version = raw
        .schema_version
        .ok_or_else(|| ConfigError::Invalid("schema_version is required".into()))?;
    if schema_version != 1 {
        return Err(ConfigError::Invalid(format!(
            "unsupported schema_version {schema_version}, expected 1"
        )));
    }

    let webhook = raw.webhook.unwrap_or_default();
    let public_url = require(webhook.public_url, "webhook.public_url")?;
    let secret = require(webhook.secret, "webhook.secret")?;
    if secret.len() < 10 || secret.len() > 100 {
        return Err(ConfigError::Invalid(
            "webhook.secret must be 10-100 characters".into(),
        ));
    }
    let endpoint = webhook.endpoint.unwrap_or_else(|| "/webhook".to_owned());
    if !endpoint.starts_with('/') {
        return Err(ConfigError::Invalid(
            "webhook.endpoint must start with '/'".into(),
        ));
    }

    let twitch = raw.twitch.unwrap_or_default();
    let twitch = TwitchConfig {
        client_id: require(twitch.client_id, "twitch.client_id")?,
        client_secret: require(twitch.client_secret, "twitch.client_secret")?,
        api_url: twitch
            .api_url
            .unwrap_or_else(|| vf_eventsub::client::DEFAULT_API_URL.to_owned()),
        auth_url: twitch
            .auth_url
            .unwrap_or_else(|| vf_eventsub::client::DEFAULT_AUTH_URL.to_owned()),
        chatters_url: twitch
            .chatters_url
            .unwrap_or_else(|| crate::worker::DEFAULT_CHATTERS_URL.to_owned()),
    };

    let tracking = raw.tracker.unwrap_or_default();
    let tracking = TrackingConfig {
        interval_minutes: tracking.interval_minutes.unwrap_or(5),
        online_timeout_hours: tracking.online_timeout_hours.unwrap_or(48),
        worker_timeout_secs: tracking.worker_timeout_secs.unwrap_or(60),
        max_batch: tracking
            .max_batch
            .unwrap_or(crate::batcher::DEFAULT_MAX_BATCH),
        skip_align: tracking.skip_align.unwrap_or(false),
    };
    if tracking.interval_minutes == 0 {
        return Err(ConfigError::Invalid(
            "tracker.interval_minutes must be at least 1".into(),
        ));
    }
    if tracking.max_batch == 0 {
        return Err(ConfigError::Invalid(
            "tracker.max_batch must be at least 1".into(),
        ));
    }

    let reconcile = raw.reconcile.unwrap_or_default();
    let reconcile = ReconcileConfig {
        window_hours: reconcile.window_hours.unwrap_or(2),
        margin_minutes: reconcile.margin_minutes.unwrap_or(15),
        interval_minutes: reconcile.interval_minutes.unwrap_or(30),
    };
    if reconcile.interval_minutes == 0 {
        return Err(ConfigError::Invalid(
            "reconcile.interval_minutes must be at least 1".into(),
        ));
    }

    let storage = StorageConfig {
        sqlite_path: raw
            .storage
            .unwrap_or_default()
            .sqlite_path
            .unwrap_or_else(|| "/var/lib/viewflow/tracker.db".to_owned()),
    };

    Ok(TrackerConfig {
        schema_version,
        webhook: WebhookConfig {
            public_url,
            endpoint,
            secret,
            port: webhook.port.unwrap_or(7134),
        },
        twitch,
        tracker: tracking,
        reconcile,
        storage,
    })
}

fn require(value: Option<String>, name: &str) -> Result<String, ConfigError> {
    match value {
        Some(v) if !v.is_empty() => Ok(v),
        _ => Err(ConfigError::Invalid(format!("{name} is required"))),
    }
}
