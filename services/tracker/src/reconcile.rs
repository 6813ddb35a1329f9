//! Event reconciliation: raw viewer samples to referrer edges.
//!
//! For each user, walking their samples in time order, every channel the
//! user was seen on within the window `W` before a sample becomes a
//! referrer of that sample's channel. Samples arrive from storage ordered
//! by `(username, ts)`, so no global sort is needed.
//!
//! Reconciliation windows overlap on purpose: each pass re-reads
//! everything back to `floor_to_hour(last_at - W)` minus a margin that
//! absorbs clock skew, and re-derived edges collapse in storage on their
//! full tuple. Running any two overlapping passes yields the same tables.

use chrono::{DateTime, TimeDelta, Utc};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info};
use vf_core::util::floor_to_hour;
use vf_core::{ReferrerEdge, ViewerSample};

use crate::storage::{EdgeStore, SampleSource, StorageError};

/// Default sliding window within which two samples form a referral.
pub const DEFAULT_WINDOW_HOURS: i64 = 2;
/// Default cutoff margin absorbing clock skew between samplers.
pub const DEFAULT_MARGIN_MINUTES: i64 = 15;

#[derive(Debug, Clone, Copy)]
pub struct ReconcileOpts {
    pub window: TimeDelta,
    pub margin: TimeDelta,
    /// Scheduler period for `run`.
    pub interval: Duration,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ReconcileStats {
    pub samples: usize,
    pub edges: usize,
    pub hours: usize,
}

/// Derive referrer edges from `samples`, which must be ordered by
/// `(username, ts)` ascending.
///
/// For a sample `(t, u, c)`, every channel `c' != c` the user appeared on
/// in `[t - window, t]` yields an edge `(t, u, c, c')`. Samples sharing
/// the exact timestamp refer to each other in both directions. The result
/// is ordered `(channel, ts, referrer, username)`.
pub fn derive_edges(samples: &[ViewerSample], window: TimeDelta) -> Vec<ReferrerEdge> {
    let mut edges = Vec::new();

    let mut user_start = 0;
    while user_start < samples.len() {
        let username = &samples[user_start].username;
        let user_end = samples[user_start..]
            .iter()
            .position(|s| s.username != *username)
            .map_or(samples.len(), |p| user_start + p);
        let span = &samples[user_start..user_end];

        // Channels seen within the window, oldest first.
        let mut recent: Vec<&ViewerSample> = Vec::new();
        let mut group_start = 0;
        while group_start < span.len() {
            let ts = span[group_start].ts;
            let group_end = span[group_start..]
                .iter()
                .position(|s| s.ts != ts)
                .map_or(span.len(), |p| group_start + p);
            let group = &span[group_start..group_end];

            recent.retain(|s| ts - s.ts <= window);

            for sample in group {
                let mut referrers = BTreeSet::new();
                for prior in recent.iter().copied().chain(group.iter()) {
                    if prior.channel != sample.channel {
                        referrers.insert(prior.channel.as_str());
                    }
                }
                for referrer in referrers {
                    edges.push(ReferrerEdge {
                        ts: sample.ts,
                        username: sample.username.clone(),
                        channel: sample.channel.clone(),
                        referrer: referrer.to_owned(),
                    });
                }
            }
            recent.extend(group);
            group_start = group_end;
        }

        user_start = user_end;
    }

    edges.sort_by(|a, b| {
        (&a.channel, a.ts, &a.referrer, &a.username).cmp(&(&b.channel, b.ts, &b.referrer, &b.username))
    });
    edges
}

/// Periodically folds new raw samples into the edge relation and the
/// hourly flow projections.
pub struct Reconciler<S> {
    store: Arc<S>,
    opts: ReconcileOpts,
}

impl<S> Reconciler<S>
where
    S: SampleSource + EdgeStore + Send + Sync + 'static,
{
    pub fn new(store: Arc<S>, opts: ReconcileOpts) -> Self {
        Self { store, opts }
    }

    /// One reconciliation pass over everything since
    /// `floor_to_hour(last_at - window) - margin`. Idempotent: re-derived
    /// edges and recomputed aggregates collapse in storage.
    pub async fn reconcile(&self, last_at: DateTime<Utc>) -> Result<ReconcileStats, StorageError> {
        let cutoff = floor_to_hour(last_at - self.opts.window) - self.opts.margin;
        let samples = self.store.samples_since(cutoff).await?;
        let edges = derive_edges(&samples, self.opts.window);
        self.store.insert_edges(&edges).await?;

        let hours: Vec<DateTime<Utc>> = edges
            .iter()
            .map(|e| e.ts)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        self.store.refresh_flow_aggregates(&hours).await?;

        Ok(ReconcileStats {
            samples: samples.len(),
            edges: edges.len(),
            hours: hours.len(),
        })
    }

    /// Scheduler loop: a pass immediately, then one per interval, until
    /// `shutdown` fires.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.opts.interval);
        loop {
            tokio::select! {
                biased;
                _ = async { let _ = shutdown.wait_for(|stop| *stop).await; } => break,
                _ = ticker.tick() => {
                    match self.reconcile(Utc::now()).await {
                        Ok(stats) => info!(
                            samples = stats.samples,
                            edges = stats.edges,
                            hours = stats.hours,
                            "reconciliation pass complete"
                        ),
                        Err(e) => error!(error = %e, "reconciliation pass failed"),
                    }
                }
            }
        }
    }
}
