//! Planner tracking-cycle tests.
//!
//! All timer-driven tests run on a paused clock so alignment sleeps and
//! tick intervals elapse instantly while wall-clock-derived values
//! (minute buckets) stay real.

use async_trait::async_trait;
use chrono::{Timelike, Utc};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tracker::planner::{Planner, PlannerOpts};
use tracker::storage::StorageError;
use tracker::worker::{TrackWorker, WorkerError};
use vf_core::Broadcaster;
use vf_core::util::balanced_bucket;
use vf_eventsub::{ClientCreds, EventStreamOffline, EventStreamOnline, EventSub};

#[derive(Default)]
struct CountingWorker {
    runs: AtomicUsize,
}

#[async_trait]
impl TrackWorker for CountingWorker {
    async fn sample(&self, _broadcaster: &Broadcaster) -> Result<(), WorkerError> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Default)]
struct FatalStorageWorker {
    runs: AtomicUsize,
}

#[async_trait]
impl TrackWorker for FatalStorageWorker {
    async fn sample(&self, _broadcaster: &Broadcaster) -> Result<(), WorkerError> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        Err(WorkerError::Storage(StorageError::Fatal(
            "store is gone".to_owned(),
        )))
    }
}

fn opts(skip_align: bool, track_online_timeout: Duration) -> PlannerOpts {
    PlannerOpts {
        webhook_public_url: "http://localhost".to_owned(),
        webhook_endpoint: "/webhook".to_owned(),
        webhook_secret: "thisisanososecretsecret".to_owned(),
        webhook_port: 0,
        track_interval: Duration::from_secs(5 * 60),
        track_online_timeout,
        worker_timeout: Duration::from_secs(5),
        skip_align,
    }
}

fn eventsub() -> Arc<EventSub> {
    Arc::new(EventSub::without_exchange(ClientCreds {
        client_id: "fake-id".to_owned(),
        client_secret: "fake-secret".to_owned(),
    }))
}

fn broadcaster(bid: &str) -> Broadcaster {
    Broadcaster {
        id: bid.to_owned(),
        login: format!("channel_{bid}"),
        username: format!("Channel_{bid}"),
    }
}

fn online(bid: &str) -> EventStreamOnline {
    EventStreamOnline {
        id: "9001".to_owned(),
        stream_type: "live".to_owned(),
        started_at: Utc::now(),
        broadcaster: broadcaster(bid),
    }
}

fn offline(bid: &str) -> EventStreamOffline {
    EventStreamOffline {
        broadcaster: broadcaster(bid),
    }
}

/// A broadcaster id whose aligned minute is at least `margin` minutes
/// away from the current wall-clock minute, so the alignment sleep is
/// guaranteed to park.
fn bid_aligned_away(margin: u32) -> String {
    let now_minute = Utc::now().minute();
    (0u64..)
        .map(|i| i.to_string())
        .find(|bid| {
            let m = balanced_bucket(bid, 60);
            (m + 60 - now_minute) % 60 >= margin
        })
        .expect("some id hashes away from the current minute")
}

#[tokio::test(start_paused = true)]
async fn duplicate_online_events_run_a_single_cycle() {
    let worker = Arc::new(CountingWorker::default());
    let planner = Planner::new(
        opts(true, Duration::from_secs(3600)),
        eventsub(),
        Arc::clone(&worker) as Arc<dyn TrackWorker>,
    );

    for _ in 0..3 {
        let planner = Arc::clone(&planner);
        let evt = online("1337");
        tokio::spawn(async move { planner.on_stream_online(evt).await });
    }
    tokio::time::sleep(Duration::from_secs(1)).await;

    // Only one invocation made it past the insert-if-absent gate.
    assert_eq!(worker.runs.load(Ordering::SeqCst), 1);
    assert_eq!(planner.active_count(), 1);

    // Offline: one final sample, entry removed.
    planner.on_stream_offline(offline("1337")).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(worker.runs.load(Ordering::SeqCst), 2);
    assert_eq!(planner.active_count(), 0);

    // A later session for the same broadcaster starts a fresh cycle.
    let planner2 = Arc::clone(&planner);
    tokio::spawn(async move { planner2.on_stream_online(online("1337")).await });
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(worker.runs.load(Ordering::SeqCst), 3);
    assert_eq!(planner.active_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn ticker_runs_worker_every_interval() {
    let worker = Arc::new(CountingWorker::default());
    let planner = Planner::new(
        opts(true, Duration::from_secs(3600)),
        eventsub(),
        Arc::clone(&worker) as Arc<dyn TrackWorker>,
    );

    let spawned = Arc::clone(&planner);
    tokio::spawn(async move { spawned.on_stream_online(online("1337")).await });

    // Immediate first sample plus ticks at 5 and 10 minutes.
    tokio::time::sleep(Duration::from_secs(11 * 60)).await;
    assert_eq!(worker.runs.load(Ordering::SeqCst), 3);

    planner.on_stream_offline(offline("1337")).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(worker.runs.load(Ordering::SeqCst), 4);
    assert_eq!(planner.active_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn offline_during_alignment_suppresses_second_run() {
    let worker = Arc::new(CountingWorker::default());
    let planner = Planner::new(
        opts(false, Duration::from_secs(48 * 3600)),
        eventsub(),
        Arc::clone(&worker) as Arc<dyn TrackWorker>,
    );

    let bid = bid_aligned_away(2);
    let spawned = Arc::clone(&planner);
    let evt = online(&bid);
    tokio::spawn(async move { spawned.on_stream_online(evt).await });
    tokio::time::sleep(Duration::from_millis(10)).await;

    // The cycle is parked in its alignment sleep; the stream ends.
    assert_eq!(planner.active_count(), 1);
    planner.on_stream_offline(offline(&bid)).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(worker.runs.load(Ordering::SeqCst), 1);

    // Let the alignment sleep elapse: the cycle must notice the end
    // signal and exit without sampling again.
    tokio::time::sleep(Duration::from_secs(61 * 60)).await;
    assert_eq!(worker.runs.load(Ordering::SeqCst), 1);
    assert_eq!(planner.active_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn zero_deadline_exits_before_any_worker_run() {
    let worker = Arc::new(CountingWorker::default());
    let planner = Planner::new(
        opts(true, Duration::ZERO),
        eventsub(),
        Arc::clone(&worker) as Arc<dyn TrackWorker>,
    );

    planner.on_stream_online(online("1337")).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(worker.runs.load(Ordering::SeqCst), 0);
    assert_eq!(planner.active_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn planner_stop_terminates_active_cycles() {
    let worker = Arc::new(CountingWorker::default());
    let planner = Planner::new(
        opts(true, Duration::from_secs(48 * 3600)),
        eventsub(),
        Arc::clone(&worker) as Arc<dyn TrackWorker>,
    );

    for bid in ["1337", "9001"] {
        let spawned = Arc::clone(&planner);
        let evt = online(bid);
        tokio::spawn(async move { spawned.on_stream_online(evt).await });
    }
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(worker.runs.load(Ordering::SeqCst), 2);
    assert_eq!(planner.active_count(), 2);

    planner.stop();
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(planner.active_count(), 0);

    // No more ticks after the stop.
    tokio::time::sleep(Duration::from_secs(10 * 60)).await;
    assert_eq!(worker.runs.load(Ordering::SeqCst), 2);
}

#[tokio::test(start_paused = true)]
async fn cycle_deadline_reaps_streams_without_offline() {
    let worker = Arc::new(CountingWorker::default());
    let planner = Planner::new(
        opts(true, Duration::from_secs(12 * 60)),
        eventsub(),
        Arc::clone(&worker) as Arc<dyn TrackWorker>,
    );

    let spawned = Arc::clone(&planner);
    tokio::spawn(async move { spawned.on_stream_online(online("1337")).await });

    // Runs at 0, 5, 10 minutes; the deadline fires at 12.
    tokio::time::sleep(Duration::from_secs(13 * 60)).await;
    assert_eq!(worker.runs.load(Ordering::SeqCst), 3);
    assert_eq!(planner.active_count(), 0);

    tokio::time::sleep(Duration::from_secs(10 * 60)).await;
    assert_eq!(worker.runs.load(Ordering::SeqCst), 3);
}

#[tokio::test(start_paused = true)]
async fn fatal_storage_error_ends_the_cycle() {
    let worker = Arc::new(FatalStorageWorker::default());
    let planner = Planner::new(
        opts(true, Duration::from_secs(48 * 3600)),
        eventsub(),
        Arc::clone(&worker) as Arc<dyn TrackWorker>,
    );

    let spawned = Arc::clone(&planner);
    tokio::spawn(async move { spawned.on_stream_online(online("1337")).await });
    tokio::time::sleep(Duration::from_secs(1)).await;

    assert_eq!(worker.runs.load(Ordering::SeqCst), 1);
    assert_eq!(planner.active_count(), 0);

    // The dead cycle must not keep ticking.
    tokio::time::sleep(Duration::from_secs(10 * 60)).await;
    assert_eq!(worker.runs.load(Ordering::SeqCst), 1);
}
