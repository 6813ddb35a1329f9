//! Decoded EventSub event payloads.
//!
//! See "Stream Online Event" in the EventSub reference:
//! <https://dev.twitch.tv/docs/eventsub/eventsub-reference#events>

use chrono::{DateTime, Utc};
use serde::Deserialize;
use vf_core::Broadcaster;

// Stream types carried in `stream.online` events.
pub const STREAM_LIVE: &str = "live";
pub const STREAM_PLAYLIST: &str = "playlist";
pub const STREAM_WATCH_PARTY: &str = "watch_party";
pub const STREAM_PREMIERE: &str = "premiere";
pub const STREAM_RERUN: &str = "rerun";

/// A `stream.online` notification. The same event may be delivered more
/// than once.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct EventStreamOnline {
    pub id: String,
    #[serde(rename = "type")]
    pub stream_type: String,
    pub started_at: DateTime<Utc>,
    #[serde(flatten)]
    pub broadcaster: Broadcaster,
}

/// A `stream.offline` notification. The same event may be delivered more
/// than once.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct EventStreamOffline {
    #[serde(flatten)]
    pub broadcaster: Broadcaster,
}
