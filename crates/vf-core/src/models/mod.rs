//! Domain records shared by the tracking, ingest, and reconciliation layers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Event type recorded for every raw viewer sample.
pub const EVENT_VIEW: &str = "view";

/// A broadcaster as carried in EventSub event payloads.
///
/// `id` is the only identity used for keying and deduplication; `login`
/// and `username` ride along for logging and the chatters endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Broadcaster {
    #[serde(rename = "broadcaster_user_id")]
    pub id: String,
    #[serde(rename = "broadcaster_user_login")]
    pub login: String,
    #[serde(rename = "broadcaster_user_name")]
    pub username: String,
}

/// Twitch broadcaster classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BroadcasterKind {
    Partner,
    Affiliate,
    Normal,
}

impl BroadcasterKind {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "partner" => Some(Self::Partner),
            "affiliate" => Some(Self::Affiliate),
            "normal" => Some(Self::Normal),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Partner => "partner",
            Self::Affiliate => "affiliate",
            Self::Normal => "normal",
        }
    }
}

impl std::fmt::Display for BroadcasterKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A channel the operator wants observed. Inserted out of band; read once
/// at planner startup to seed subscription creation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackedChannel {
    pub broadcaster_id: String,
    pub display_name: String,
    pub login: String,
    pub kind: BroadcasterKind,
    pub profile_image_url: Option<String>,
    pub offline_image_url: Option<String>,
}

/// One observation: `username` appeared in `channel`'s chat at `ts`.
///
/// `ts` is floored to the start of the hour before persistence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ViewerSample {
    pub ts: DateTime<Utc>,
    pub username: String,
    pub channel: String,
    pub event_type: String,
}

/// A derived referral: `username` watched `referrer`, then `channel`
/// within the reconciliation window. Invariant: `referrer != channel`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReferrerEdge {
    pub ts: DateTime<Utc>,
    pub username: String,
    pub channel: String,
    pub referrer: String,
}

/// One row of an hourly flow projection. For destination queries
/// `channel` holds the referrer; for source queries it holds the
/// destination channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FlowRow {
    pub ts: DateTime<Utc>,
    pub channel: String,
    pub total_users: u64,
}
