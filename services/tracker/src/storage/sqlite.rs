//! SQLite implementation of the storage capabilities.
//!
//! Dedup everywhere is structural: every table carries its full tuple as
//! primary key and writes go through `INSERT OR REPLACE`, so duplicate
//! samples, re-derived edges, and recomputed aggregates all collapse.
//!
//! Distinct-user totals are exact counts recomputed from the deduplicated
//! edge relation; since that relation only grows, the aggregates are
//! monotone under re-reconciliation of overlapping windows.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{Connection, ErrorCode, params};
use std::path::Path;
use tokio::sync::Mutex;
use vf_core::util::floor_to_hour;
use vf_core::{
    BroadcasterKind, EVENT_VIEW, FlowRow, ReferrerEdge, TrackedChannel, ViewerSample,
};

use super::{
    ChannelRepo, EdgeStore, FlowQuery, MAX_FLOW_ROWS, RawEventAppender, SampleSource, StorageError,
};

const SCHEMA_SQL: &str = include_str!("schema.sql");

/// Embedded store backing all tracker persistence.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open (or create) the store at `path`, applying pragmas and schema.
    pub fn open(path: &Path) -> Result<Self, StorageError> {
        Self::from_conn(Connection::open(path).map_err(classify)?)
    }

    /// Fresh in-memory store, for tests.
    pub fn open_in_memory() -> Result<Self, StorageError> {
        Self::from_conn(Connection::open_in_memory().map_err(classify)?)
    }

    fn from_conn(conn: Connection) -> Result<Self, StorageError> {
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;
             PRAGMA synchronous=NORMAL;
             PRAGMA foreign_keys=ON;",
        )
        .map_err(classify)?;
        conn.execute_batch(SCHEMA_SQL).map_err(classify)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Insert a tracked channel. The tracker itself never calls this;
    /// operators (and tests) seed the table with it.
    pub async fn insert_tracked_channel(&self, ch: &TrackedChannel) -> Result<(), StorageError> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT OR REPLACE INTO tracked_channels
                 (broadcaster_id, broadcaster_display_name, broadcaster_username,
                  broadcaster_type, profile_image_url, offline_image_url)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                ch.broadcaster_id,
                ch.display_name,
                ch.login,
                ch.kind.as_str(),
                ch.profile_image_url,
                ch.offline_image_url,
            ],
        )
        .map_err(classify)?;
        Ok(())
    }
}

#[async_trait]
impl RawEventAppender for SqliteStore {
    async fn append_viewers(
        &self,
        channel: &str,
        ts: DateTime<Utc>,
        viewers: &[String],
    ) -> Result<(), StorageError> {
        if viewers.is_empty() {
            return Ok(());
        }
        // Hour is the smallest unit stored; round down before writing.
        let ts = floor_to_hour(ts);
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction().map_err(classify)?;
        {
            let mut stmt = tx
                .prepare_cached(
                    "INSERT OR REPLACE INTO raw_events (ts, username, channel, event_type)
                     VALUES (?1, ?2, ?3, ?4)",
                )
                .map_err(classify)?;
            for user in viewers {
                stmt.execute(params![ts, user, channel, EVENT_VIEW])
                    .map_err(classify)?;
            }
        }
        tx.commit().map_err(classify)?;
        Ok(())
    }
}

#[async_trait]
impl FlowQuery for SqliteStore {
    async fn flows_by_destination(
        &self,
        channel: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<FlowRow>, StorageError> {
        let conn = self.conn.lock().await;
        query_flows(
            &conn,
            "SELECT ts, referrer, total_users FROM aggregated_flows_by_dst
             WHERE channel = ?1 AND ts >= ?2 AND ts <= ?3
             ORDER BY ts ASC, total_users DESC
             LIMIT ?4",
            channel,
            from,
            to,
        )
    }

    async fn flows_by_source(
        &self,
        referrer: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<FlowRow>, StorageError> {
        let conn = self.conn.lock().await;
        query_flows(
            &conn,
            "SELECT ts, channel, total_users FROM aggregated_flows_by_src
             WHERE referrer = ?1 AND ts >= ?2 AND ts <= ?3
             ORDER BY ts ASC, total_users DESC
             LIMIT ?4",
            referrer,
            from,
            to,
        )
    }
}

#[async_trait]
impl SampleSource for SqliteStore {
    async fn samples_since(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<ViewerSample>, StorageError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn
            .prepare_cached(
                "SELECT ts, username, channel, event_type FROM raw_events
                 WHERE ts >= ?1
                 ORDER BY username ASC, ts ASC",
            )
            .map_err(classify)?;
        let rows = stmt
            .query_map(params![cutoff], |row| {
                Ok(ViewerSample {
                    ts: row.get(0)?,
                    username: row.get(1)?,
                    channel: row.get(2)?,
                    event_type: row.get(3)?,
                })
            })
            .map_err(classify)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(classify)
    }
}

#[async_trait]
impl EdgeStore for SqliteStore {
    async fn insert_edges(&self, edges: &[ReferrerEdge]) -> Result<(), StorageError> {
        if edges.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction().map_err(classify)?;
        {
            let mut stmt = tx
                .prepare_cached(
                    "INSERT OR REPLACE INTO events (ts, username, channel, referrer)
                     VALUES (?1, ?2, ?3, ?4)",
                )
                .map_err(classify)?;
            for e in edges {
                stmt.execute(params![e.ts, e.username, e.channel, e.referrer])
                    .map_err(classify)?;
            }
        }
        tx.commit().map_err(classify)?;
        Ok(())
    }

    async fn refresh_flow_aggregates(&self, hours: &[DateTime<Utc>]) -> Result<(), StorageError> {
        if hours.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction().map_err(classify)?;
        for hour in hours {
            tx.execute(
                "INSERT OR REPLACE INTO aggregated_flows_by_dst (channel, ts, referrer, total_users)
                 SELECT channel, ts, referrer, COUNT(DISTINCT username)
                 FROM events WHERE ts = ?1
                 GROUP BY channel, referrer",
                params![hour],
            )
            .map_err(classify)?;
            tx.execute(
                "INSERT OR REPLACE INTO aggregated_flows_by_src (referrer, ts, channel, total_users)
                 SELECT referrer, ts, channel, COUNT(DISTINCT username)
                 FROM events WHERE ts = ?1
                 GROUP BY referrer, channel",
                params![hour],
            )
            .map_err(classify)?;
        }
        tx.commit().map_err(classify)?;
        Ok(())
    }
}

#[async_trait]
impl ChannelRepo for SqliteStore {
    async fn tracked(&self) -> Result<Vec<TrackedChannel>, StorageError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn
            .prepare_cached(
                "SELECT broadcaster_id, broadcaster_display_name, broadcaster_username,
                        broadcaster_type, profile_image_url, offline_image_url
                 FROM tracked_channels ORDER BY broadcaster_id ASC",
            )
            .map_err(classify)?;
        let rows = stmt
            .query_map([], |row| {
                let kind_text: String = row.get(3)?;
                Ok((
                    TrackedChannel {
                        broadcaster_id: row.get(0)?,
                        display_name: row.get(1)?,
                        login: row.get(2)?,
                        kind: BroadcasterKind::Normal,
                        profile_image_url: row.get(4)?,
                        offline_image_url: row.get(5)?,
                    },
                    kind_text,
                ))
            })
            .map_err(classify)?;

        let mut channels = Vec::new();
        for row in rows {
            let (mut ch, kind_text) = row.map_err(classify)?;
            ch.kind = BroadcasterKind::parse(&kind_text).ok_or_else(|| {
                StorageError::Fatal(format!(
                    "unknown broadcaster type '{kind_text}' for {}",
                    ch.broadcaster_id
                ))
            })?;
            channels.push(ch);
        }
        Ok(channels)
    }
}

fn query_flows(
    conn: &Connection,
    sql: &str,
    key: &str,
    from: DateTime<Utc>,
    to: DateTime<Utc>,
) -> Result<Vec<FlowRow>, StorageError> {
    let mut stmt = conn.prepare_cached(sql).map_err(classify)?;
    let rows = stmt
        .query_map(params![key, from, to, MAX_FLOW_ROWS], |row| {
            Ok(FlowRow {
                ts: row.get(0)?,
                channel: row.get(1)?,
                total_users: row.get::<_, i64>(2)?.unsigned_abs(),
            })
        })
        .map_err(classify)?;
    rows.collect::<Result<Vec<_>, _>>().map_err(classify)
}

/// Sort SQLite failures into the retryable / rejected / fatal buckets the
/// core distinguishes.
fn classify(e: rusqlite::Error) -> StorageError {
    match &e {
        rusqlite::Error::SqliteFailure(f, _) => match f.code {
            ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked => {
                StorageError::Transient(e.to_string())
            }
            ErrorCode::ConstraintViolation | ErrorCode::TypeMismatch => {
                StorageError::BadRequest(e.to_string())
            }
            _ => StorageError::Fatal(e.to_string()),
        },
        _ => StorageError::Fatal(e.to_string()),
    }
}
