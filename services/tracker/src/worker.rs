//! Chatter sampling worker.
//!
//! The only component that touches the network for sampling: it fetches
//! the chatters document for a channel login and streams the response
//! body straight into a `StreamBatcher`, appending each flushed batch
//! through the `RawEventAppender`. The HTTP body never lands in memory
//! whole.

use async_trait::async_trait;
use chrono::Utc;
use futures_util::TryStreamExt;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::io::{StreamReader, SyncIoBridge};
use tracing::{debug, error, warn};
use vf_core::Broadcaster;

use crate::batcher::{IngestError, StreamBatcher};
use crate::storage::{RawEventAppender, StorageError};

pub const DEFAULT_CHATTERS_URL: &str = "https://tmi.twitch.tv";

// Flushed batches in flight between the parser and the appender.
const FLUSH_CHANNEL_DEPTH: usize = 4;

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("upstream returned status {0}")]
    UpstreamStatus(u16),
    #[error("upstream request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error(transparent)]
    Ingest(#[from] IngestError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("parser task failed: {0}")]
    ParserTask(tokio::task::JoinError),
}

/// One sampling pass for a broadcaster.
#[async_trait]
pub trait TrackWorker: Send + Sync + 'static {
    async fn sample(&self, broadcaster: &Broadcaster) -> Result<(), WorkerError>;
}

/// Production worker against the unofficial chatters endpoint.
pub struct ChattersWorker {
    http: reqwest::Client,
    chatters_url: String,
    max_batch: u64,
    appender: Arc<dyn RawEventAppender>,
}

impl ChattersWorker {
    pub fn new(
        chatters_url: impl Into<String>,
        max_batch: u64,
        appender: Arc<dyn RawEventAppender>,
    ) -> Self {
        Self {
            http: reqwest::Client::new(),
            chatters_url: chatters_url.into(),
            max_batch,
            appender,
        }
    }
}

#[async_trait]
impl TrackWorker for ChattersWorker {
    async fn sample(&self, broadcaster: &Broadcaster) -> Result<(), WorkerError> {
        let url = format!(
            "{}/group/user/{}/chatters",
            self.chatters_url, broadcaster.login
        );
        debug!(channel = %broadcaster.login, "fetching chatters document");
        let resp = self.http.get(&url).send().await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(WorkerError::UpstreamStatus(status.as_u16()));
        }

        let ts = Utc::now();
        let body = Box::pin(resp.bytes_stream().map_err(std::io::Error::other));
        let reader = SyncIoBridge::new(StreamReader::new(body));

        // The parser is synchronous; run it on the blocking pool and move
        // flushed batches back through a bounded channel. A full channel
        // applies backpressure to the HTTP read.
        let (tx, mut rx) = mpsc::channel::<Vec<String>>(FLUSH_CHANNEL_DEPTH);
        let max_batch = self.max_batch;
        let parser = tokio::task::spawn_blocking(move || {
            let mut batcher = StreamBatcher::new(max_batch, move |queue| {
                // A closed receiver means the append side gave up; the
                // remaining batches are dropped with it.
                let _ = tx.blocking_send(queue);
            });
            batcher.ingest(reader)
        });

        let channel = broadcaster.login.clone();
        let mut appended = 0usize;
        while let Some(batch) = rx.recv().await {
            appended += batch.len();
            match self.appender.append_viewers(&channel, ts, &batch).await {
                Ok(()) => {}
                Err(e @ StorageError::Transient(_)) => {
                    warn!(channel = %channel, error = %e, "append failed, next tick retries");
                }
                Err(e @ StorageError::BadRequest(_)) => {
                    error!(channel = %channel, error = %e, "storage rejected batch, dropping it");
                }
                Err(e @ StorageError::Fatal(_)) => return Err(WorkerError::Storage(e)),
            }
        }
        parser.await.map_err(WorkerError::ParserTask)??;

        debug!(channel = %channel, users = appended, "chatter sample appended");
        Ok(())
    }
}
