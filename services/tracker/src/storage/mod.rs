//! Storage capabilities the tracking core consumes.
//!
//! The core prescribes the algebra, not the SQL: raw samples are appended
//! in atomic batches, edges and aggregates are written by the reconciler,
//! and the two flow projections answer "who sends/receives viewers"
//! queries. All tables deduplicate on their full key, so re-appends and
//! re-reconciliations are harmless.

pub mod sqlite;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use vf_core::{FlowRow, ReferrerEdge, TrackedChannel, ViewerSample};

pub use sqlite::SqliteStore;

/// Flow queries return at most this many rows.
pub const MAX_FLOW_ROWS: u32 = 20;

#[derive(Debug, Error)]
pub enum StorageError {
    /// Worth retrying; the next tick is the implicit retry.
    #[error("transient storage error: {0}")]
    Transient(String),
    /// The batch itself is unacceptable; retrying it cannot help.
    #[error("storage rejected request: {0}")]
    BadRequest(String),
    /// The store is unusable; the cycle terminates.
    #[error("fatal storage error: {0}")]
    Fatal(String),
}

/// Append-side capability: atomic insertion of one sampled viewer batch.
#[async_trait]
pub trait RawEventAppender: Send + Sync {
    /// Append one batch of viewers observed on `channel` at `ts`. The
    /// whole batch lands in a single transaction; `ts` is floored to the
    /// start of its hour.
    async fn append_viewers(
        &self,
        channel: &str,
        ts: DateTime<Utc>,
        viewers: &[String],
    ) -> Result<(), StorageError>;
}

/// Query-side capability over the hourly flow projections.
#[async_trait]
pub trait FlowQuery: Send + Sync {
    /// Channels that sent viewers to `channel`, bucketed by hour.
    async fn flows_by_destination(
        &self,
        channel: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<FlowRow>, StorageError>;

    /// Channels that received viewers from `referrer`, bucketed by hour.
    async fn flows_by_source(
        &self,
        referrer: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<FlowRow>, StorageError>;
}

/// Raw-sample reads for the reconciliation engine.
#[async_trait]
pub trait SampleSource: Send + Sync {
    /// All samples with `ts >= cutoff`, ordered by `(username, ts)` so the
    /// sliding window can run without a global sort.
    async fn samples_since(&self, cutoff: DateTime<Utc>)
    -> Result<Vec<ViewerSample>, StorageError>;
}

/// Edge and aggregate writes for the reconciliation engine.
#[async_trait]
pub trait EdgeStore: Send + Sync {
    /// Insert derived edges; duplicates collapse on the full tuple.
    async fn insert_edges(&self, edges: &[ReferrerEdge]) -> Result<(), StorageError>;

    /// Recompute both flow projections for the given hours from the edge
    /// relation. Idempotent.
    async fn refresh_flow_aggregates(&self, hours: &[DateTime<Utc>]) -> Result<(), StorageError>;
}

/// Read access to the operator-maintained tracked channel list.
#[async_trait]
pub trait ChannelRepo: Send + Sync {
    async fn tracked(&self) -> Result<Vec<TrackedChannel>, StorageError>;
}
