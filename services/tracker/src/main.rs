// tracker: webhook-driven chatter sampling and viewer-flow reconciliation.

use std::env;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

use chrono::TimeDelta;
use tracker::config;
use tracker::planner::{Planner, PlannerOpts};
use tracker::reconcile::{ReconcileOpts, Reconciler};
use tracker::storage::{ChannelRepo, SqliteStore};
use tracker::worker::ChattersWorker;
use vf_eventsub::{ClientCreds, EventSub};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "tracker starting");

    let cfg = {
        let loaded = match env::var("TRACKER_CONFIG") {
            Ok(path) => config::load_config_from_path(Path::new(&path)),
            Err(_) => config::load_config(),
        };
        match loaded {
            Ok(cfg) => cfg,
            Err(e) => {
                eprintln!("FATAL: failed to load config: {e}");
                std::process::exit(1);
            }
        }
    };
    info!(
        webhook_port = cfg.webhook.port,
        sqlite_path = %cfg.storage.sqlite_path,
        "config loaded"
    );

    let store = match SqliteStore::open(Path::new(&cfg.storage.sqlite_path)) {
        Ok(store) => Arc::new(store),
        Err(e) => {
            eprintln!("FATAL: failed to open storage: {e}");
            std::process::exit(1);
        }
    };

    let tracked = match store.tracked().await {
        Ok(tracked) => tracked,
        Err(e) => {
            eprintln!("FATAL: failed to read tracked channels: {e}");
            std::process::exit(1);
        }
    };
    info!(channels = tracked.len(), "tracked channels loaded");

    let mut eventsub = EventSub::new(ClientCreds {
        client_id: cfg.twitch.client_id.clone(),
        client_secret: cfg.twitch.client_secret.clone(),
    });
    eventsub.api_url = cfg.twitch.api_url.clone();
    eventsub.auth_url = cfg.twitch.auth_url.clone();

    let worker = Arc::new(ChattersWorker::new(
        cfg.twitch.chatters_url.clone(),
        cfg.tracker.max_batch,
        Arc::clone(&store) as _,
    ));

    let planner = Planner::from_channels(
        PlannerOpts {
            webhook_public_url: cfg.webhook.public_url.clone(),
            webhook_endpoint: cfg.webhook.endpoint.clone(),
            webhook_secret: cfg.webhook.secret.clone(),
            webhook_port: cfg.webhook.port,
            track_interval: Duration::from_secs(cfg.tracker.interval_minutes * 60),
            track_online_timeout: Duration::from_secs(cfg.tracker.online_timeout_hours * 3600),
            worker_timeout: Duration::from_secs(cfg.tracker.worker_timeout_secs),
            skip_align: cfg.tracker.skip_align,
        },
        Arc::new(eventsub),
        worker,
        tracked,
    );
    if let Err(e) = planner.start().await {
        eprintln!("FATAL: failed to start planner: {e}");
        std::process::exit(1);
    }

    let reconciler = Reconciler::new(
        Arc::clone(&store),
        ReconcileOpts {
            window: TimeDelta::hours(i64::try_from(cfg.reconcile.window_hours).unwrap_or(2)),
            margin: TimeDelta::minutes(i64::try_from(cfg.reconcile.margin_minutes).unwrap_or(15)),
            interval: Duration::from_secs(cfg.reconcile.interval_minutes * 60),
        },
    );
    let reconcile_shutdown = planner.subscribe_shutdown();
    tokio::spawn(async move { reconciler.run(reconcile_shutdown).await });

    shutdown_signal().await;
    planner.stop();
    info!("tracker shut down gracefully");
}

/// Waits for SIGTERM or Ctrl-C (SIGINT) and returns to trigger graceful
/// shutdown.
async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => { info!("received Ctrl+C, shutting down"); },
        _ = terminate => { info!("received SIGTERM, shutting down"); },
    }
}
