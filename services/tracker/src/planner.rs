//! Per-broadcaster tracking scheduler.
//!
//! `on_stream_online` is the heart of the planner, invoked for verified
//! `stream.online` webhook events. It guarantees a single live cycle per
//! broadcaster by registering an end signal in the sharded active map
//! with an atomic insert-if-absent; a duplicate event loses the race and
//! returns.
//!
//! A cycle aligns itself to a minute of the hour derived from the
//! broadcaster id, so that across many broadcasters the workers spread
//! uniformly over the 60 possible minutes and a given broadcaster always
//! samples near the same minute.
//!
//! Once ticking, three signals can stop the cycle and all of them win by
//! converging on the same cleanup: the planner-wide shutdown, the
//! broadcaster's end signal (fired by `on_stream_offline`), and the
//! per-cycle deadline that reaps streams which never see an offline
//! event.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use chrono::Utc;
use vf_core::util::{balanced_bucket, until_minute};
use vf_core::{Broadcaster, TrackedChannel};
use vf_eventsub::webhooks::{SUB_STREAM_OFFLINE, SUB_STREAM_ONLINE};
use vf_eventsub::{
    Condition, EventStreamOffline, EventStreamOnline, EventSub, EventSubError, RevocationPayload,
    Subscription, Transport, WebhookDispatch,
};

use crate::active::{ActiveCycles, EndSignal};
use crate::storage::StorageError;
use crate::worker::{TrackWorker, WorkerError};

#[derive(Debug, Error)]
pub enum PlannerError {
    #[error("failed to bind webhook listener: {0}")]
    Bind(#[from] std::io::Error),
}

#[derive(Debug, Clone)]
pub struct PlannerOpts {
    /// Externally reachable base URL of the webhook server.
    pub webhook_public_url: String,
    pub webhook_endpoint: String,
    pub webhook_secret: String,
    pub webhook_port: u16,

    /// Time between worker runs within a cycle.
    pub track_interval: Duration,
    /// Hard ceiling on a cycle's lifetime, for streams whose offline
    /// event never arrives.
    pub track_online_timeout: Duration,
    /// Deadline for a single worker run.
    pub worker_timeout: Duration,

    /// Test hook: skip the minute-of-hour alignment sleep.
    pub skip_align: bool,
}

pub struct Planner {
    opts: PlannerOpts,
    eventsub: Arc<EventSub>,
    worker: Arc<dyn TrackWorker>,
    active: ActiveCycles,
    /// Channels awaiting subscription creation, drained once at startup.
    queue: Mutex<Vec<TrackedChannel>>,
    /// Broadcaster ids under observation, for the revocation policy.
    tracked: HashSet<String>,
    shutdown: watch::Sender<bool>,
}

impl Planner {
    pub fn new(opts: PlannerOpts, eventsub: Arc<EventSub>, worker: Arc<dyn TrackWorker>) -> Arc<Self> {
        Self::from_channels(opts, eventsub, worker, Vec::new())
    }

    /// Planner with a startup queue of channels to subscribe.
    pub fn from_channels(
        opts: PlannerOpts,
        eventsub: Arc<EventSub>,
        worker: Arc<dyn TrackWorker>,
        channels: Vec<TrackedChannel>,
    ) -> Arc<Self> {
        let tracked = channels.iter().map(|c| c.broadcaster_id.clone()).collect();
        let (shutdown, _) = watch::channel(false);
        Arc::new(Self {
            opts,
            eventsub,
            worker,
            active: ActiveCycles::new(),
            queue: Mutex::new(channels),
            tracked,
            shutdown,
        })
    }

    /// Install the webhook handlers, start listening, then drain the
    /// startup subscription queue.
    pub async fn start(self: &Arc<Self>) -> Result<(), PlannerError> {
        info!("initializing planner");

        let on_online = {
            let planner = Arc::clone(self);
            move |evt: EventStreamOnline| {
                let planner = Arc::clone(&planner);
                tokio::spawn(async move { planner.on_stream_online(evt).await });
            }
        };
        let on_offline = {
            let planner = Arc::clone(self);
            move |evt: EventStreamOffline| {
                let planner = Arc::clone(&planner);
                tokio::spawn(async move { planner.on_stream_offline(evt).await });
            }
        };
        let on_revocation = {
            let planner = Arc::clone(self);
            move |payload: RevocationPayload| {
                let planner = Arc::clone(&planner);
                tokio::spawn(async move { planner.on_revocation(payload).await });
            }
        };
        let router = WebhookDispatch::new(self.opts.webhook_secret.as_bytes())
            .on_stream_online(on_online)
            .on_stream_offline(on_offline)
            .on_revocation(on_revocation)
            .into_router(&self.opts.webhook_endpoint);

        let listener = TcpListener::bind(("0.0.0.0", self.opts.webhook_port)).await?;
        info!(
            port = self.opts.webhook_port,
            endpoint = %self.opts.webhook_endpoint,
            "webhook server listening"
        );
        let mut shutdown = self.shutdown.subscribe();
        tokio::spawn(async move {
            let stop = async move {
                let _ = shutdown.wait_for(|stop| *stop).await;
            };
            if let Err(e) = axum::serve(listener, router)
                .with_graceful_shutdown(stop)
                .await
            {
                error!(error = %e, "webhook server error");
            }
        });

        self.flush_queue().await;
        Ok(())
    }

    /// Cancel the planner-wide context; every active cycle terminates.
    pub fn stop(&self) {
        info!("stopping planner");
        let _ = self.shutdown.send(true);
    }

    pub fn subscribe_shutdown(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    /// Number of currently registered tracking cycles.
    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    /// Entry point for a verified `stream.online` event. Runs the whole
    /// cycle; callers spawn it.
    pub async fn on_stream_online(self: &Arc<Self>, evt: EventStreamOnline) {
        let broadcaster = evt.broadcaster;
        let bid = broadcaster.id.clone();

        let end = EndSignal::new();
        let mut end_rx = end.subscribe();
        if !self.active.insert_if_absent(&bid, end.clone()) {
            debug!(broadcaster_id = %bid, "cycle already active, ignoring duplicate online event");
            return;
        }
        info!(broadcaster_id = %bid, login = %broadcaster.login, "tracking cycle starting");

        let mut shutdown = self.shutdown.subscribe();
        let deadline = Instant::now() + self.opts.track_online_timeout;

        if !self.opts.skip_align {
            let minute = balanced_bucket(&bid, 60);
            let wait = until_minute(Utc::now(), minute);
            debug!(
                broadcaster_id = %bid,
                minute,
                wait_secs = wait.as_secs(),
                "aligning cycle to its minute"
            );
            tokio::select! {
                biased;
                _ = shutdown.wait_for(|stop| *stop) => {
                    self.active.remove_entry(&bid, &end);
                    return;
                }
                _ = end_rx.wait_for(|fired| *fired) => {
                    self.active.remove_entry(&bid, &end);
                    return;
                }
                () = tokio::time::sleep_until(deadline) => {
                    self.active.remove_entry(&bid, &end);
                    return;
                }
                () = tokio::time::sleep(wait) => {}
            }
        }

        // An offline event may have arrived during the alignment sleep
        // (up to 59 minutes). Its handler already ran the worker one final
        // time, so starting the loop now would double-count; check the
        // signals once more without blocking.
        if *shutdown.borrow() || *end_rx.borrow() || Instant::now() >= deadline {
            self.active.remove_entry(&bid, &end);
            return;
        }

        let mut ticker = tokio::time::interval(self.opts.track_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let timeout = tokio::time::sleep_until(deadline);
        tokio::pin!(timeout);

        // The interval's first tick completes immediately: the first
        // sample runs on entering the cycle, later ones on each tick.
        loop {
            tokio::select! {
                biased;
                _ = shutdown.wait_for(|stop| *stop) => break,
                _ = end_rx.wait_for(|fired| *fired) => break,
                () = &mut timeout => {
                    warn!(broadcaster_id = %bid, "cycle deadline hit without an offline event");
                    break;
                }
                _ = ticker.tick() => self.spawn_worker(&broadcaster),
            }
        }

        debug!(broadcaster_id = %bid, "tracking cycle finished");
        self.active.remove_entry(&bid, &end);
    }

    /// Entry point for a verified `stream.offline` event.
    pub async fn on_stream_offline(self: &Arc<Self>, evt: EventStreamOffline) {
        // One last best-effort sample before the cycle closes.
        self.spawn_worker(&evt.broadcaster);
        if let Some(end) = self.active.pop(&evt.broadcaster.id) {
            info!(broadcaster_id = %evt.broadcaster.id, "stream offline, closing tracking cycle");
            end.fire();
        }
    }

    /// Revocation policy: if the revoked subscription belongs to a
    /// tracked channel, request it again once.
    pub async fn on_revocation(self: &Arc<Self>, payload: RevocationPayload) {
        let bid = payload.subscription.condition.broadcaster_user_id;
        let kind = payload.subscription.kind;
        if kind != SUB_STREAM_ONLINE && kind != SUB_STREAM_OFFLINE {
            return;
        }
        if !self.tracked.contains(&bid) {
            debug!(broadcaster_id = %bid, "revoked subscription is not for a tracked channel");
            return;
        }
        info!(broadcaster_id = %bid, kind = %kind, "re-subscribing revoked tracked channel");
        if let Err(e) = self.subscribe(&bid, &kind).await {
            error!(broadcaster_id = %bid, kind = %kind, error = %e, "re-subscription failed");
        }
    }

    /// Drain the startup queue: one `stream.online` and one
    /// `stream.offline` subscription create per tracked channel.
    /// Failures are logged and skipped.
    pub async fn flush_queue(&self) {
        let queue = std::mem::take(&mut *self.queue.lock().unwrap());
        if queue.is_empty() {
            return;
        }
        info!(channels = queue.len(), "flushing channel subscription queue");
        for ch in &queue {
            for kind in [SUB_STREAM_ONLINE, SUB_STREAM_OFFLINE] {
                debug!(broadcaster_id = %ch.broadcaster_id, kind, "requesting subscription");
                if let Err(e) = self.subscribe(&ch.broadcaster_id, kind).await {
                    error!(
                        broadcaster_id = %ch.broadcaster_id,
                        kind,
                        error = %e,
                        "subscription request failed"
                    );
                }
            }
        }
    }

    async fn subscribe(&self, bid: &str, kind: &str) -> Result<(), EventSubError> {
        self.eventsub
            .create_subscription(&Subscription {
                kind: kind.to_owned(),
                version: "1".to_owned(),
                condition: Condition {
                    broadcaster_user_id: bid.to_owned(),
                },
                transport: Transport {
                    method: "webhook".to_owned(),
                    callback: format!(
                        "{}{}",
                        self.opts.webhook_public_url, self.opts.webhook_endpoint
                    ),
                    secret: self.opts.webhook_secret.clone(),
                },
            })
            .await
    }

    /// Run one worker pass in its own task with its own deadline, so a
    /// slow worker never delays the next tick. Overlapping runs for the
    /// same broadcaster are possible and deduplicated by storage.
    fn spawn_worker(self: &Arc<Self>, broadcaster: &Broadcaster) {
        let planner = Arc::clone(self);
        let broadcaster = broadcaster.clone();
        tokio::spawn(async move {
            let run = tokio::time::timeout(
                planner.opts.worker_timeout,
                planner.worker.sample(&broadcaster),
            )
            .await;
            match run {
                Ok(Ok(())) => {}
                Ok(Err(WorkerError::Storage(e @ StorageError::Fatal(_)))) => {
                    error!(
                        broadcaster_id = %broadcaster.id,
                        error = %e,
                        "fatal storage error, ending tracking cycle"
                    );
                    if let Some(end) = planner.active.pop(&broadcaster.id) {
                        end.fire();
                    }
                }
                Ok(Err(e)) => {
                    warn!(broadcaster_id = %broadcaster.id, error = %e, "worker run failed");
                }
                Err(_) => {
                    warn!(broadcaster_id = %broadcaster.id, "worker run timed out");
                }
            }
        });
    }
}
