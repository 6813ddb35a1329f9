//! SQLite store behavior: hour flooring, merge-dedup, flow query shape,
//! and the tracked-channel read.

use chrono::{DateTime, Utc};
use tracker::storage::{
    ChannelRepo, EdgeStore, FlowQuery, RawEventAppender, SampleSource, SqliteStore,
};
use vf_core::{BroadcasterKind, EVENT_VIEW, ReferrerEdge, TrackedChannel};

fn t(s: &str) -> DateTime<Utc> {
    s.parse().expect("valid RFC 3339 timestamp")
}

fn users(names: &[&str]) -> Vec<String> {
    names.iter().map(|u| (*u).to_owned()).collect()
}

fn edge(ts: &str, username: &str, channel: &str, referrer: &str) -> ReferrerEdge {
    ReferrerEdge {
        ts: t(ts),
        username: username.to_owned(),
        channel: channel.to_owned(),
        referrer: referrer.to_owned(),
    }
}

#[tokio::test]
async fn append_floors_timestamps_to_the_hour() {
    let store = SqliteStore::open_in_memory().expect("in-memory store");
    store
        .append_viewers(
            "streamer1",
            t("2020-10-11T10:30:20.123Z"),
            &users(&["user1", "user2", "user3", "user4", "user5"]),
        )
        .await
        .expect("append");

    let samples = store
        .samples_since(t("1970-01-01T00:00:00Z"))
        .await
        .expect("samples");
    assert_eq!(samples.len(), 5);
    for (i, sample) in samples.iter().enumerate() {
        assert_eq!(sample.ts, t("2020-10-11T10:00:00Z"));
        assert_eq!(sample.username, format!("user{}", i + 1));
        assert_eq!(sample.channel, "streamer1");
        assert_eq!(sample.event_type, EVENT_VIEW);
    }
}

#[tokio::test]
async fn repeated_appends_collapse_on_the_full_tuple() {
    let store = SqliteStore::open_in_memory().expect("in-memory store");
    for _ in 0..3 {
        store
            .append_viewers("streamer1", t("2020-10-11T10:05:00Z"), &users(&["u1", "u2"]))
            .await
            .expect("append");
    }
    // Different minute, same hour: same rows after flooring.
    store
        .append_viewers("streamer1", t("2020-10-11T10:55:00Z"), &users(&["u1"]))
        .await
        .expect("append");

    let samples = store
        .samples_since(t("1970-01-01T00:00:00Z"))
        .await
        .expect("samples");
    assert_eq!(samples.len(), 2);
}

#[tokio::test]
async fn samples_come_back_ordered_by_user_then_time() {
    let store = SqliteStore::open_in_memory().expect("in-memory store");
    store
        .append_viewers("a", t("2022-07-14T12:00:00Z"), &users(&["zoe", "amy"]))
        .await
        .expect("append");
    store
        .append_viewers("b", t("2022-07-14T10:00:00Z"), &users(&["zoe", "amy"]))
        .await
        .expect("append");

    let samples = store
        .samples_since(t("1970-01-01T00:00:00Z"))
        .await
        .expect("samples");
    let got: Vec<(String, DateTime<Utc>)> = samples
        .into_iter()
        .map(|s| (s.username, s.ts))
        .collect();
    assert_eq!(
        got,
        [
            ("amy".to_owned(), t("2022-07-14T10:00:00Z")),
            ("amy".to_owned(), t("2022-07-14T12:00:00Z")),
            ("zoe".to_owned(), t("2022-07-14T10:00:00Z")),
            ("zoe".to_owned(), t("2022-07-14T12:00:00Z")),
        ]
    );
}

#[tokio::test]
async fn samples_since_respects_the_cutoff() {
    let store = SqliteStore::open_in_memory().expect("in-memory store");
    store
        .append_viewers("a", t("2022-07-14T09:00:00Z"), &users(&["u1"]))
        .await
        .expect("append");
    store
        .append_viewers("a", t("2022-07-14T12:00:00Z"), &users(&["u1"]))
        .await
        .expect("append");

    let samples = store
        .samples_since(t("2022-07-14T09:45:00Z"))
        .await
        .expect("samples");
    assert_eq!(samples.len(), 1);
    assert_eq!(samples[0].ts, t("2022-07-14T12:00:00Z"));
}

#[tokio::test]
async fn flow_queries_cap_at_twenty_rows_ordered_by_total() {
    let store = SqliteStore::open_in_memory().expect("in-memory store");

    // 25 referrers into "dst"; referrer rN contributed N+1 distinct users.
    let mut edges = Vec::new();
    for r in 0..25u32 {
        for u in 0..=r {
            edges.push(edge(
                "2022-07-14T12:00:00Z",
                &format!("user{u:02}"),
                "dst",
                &format!("ref{r:02}"),
            ));
        }
    }
    store.insert_edges(&edges).await.expect("insert edges");
    store
        .refresh_flow_aggregates(&[t("2022-07-14T12:00:00Z")])
        .await
        .expect("refresh aggregates");

    let rows = store
        .flows_by_destination("dst", t("2022-07-14T00:00:00Z"), t("2022-07-14T23:00:00Z"))
        .await
        .expect("flow query");
    assert_eq!(rows.len(), 20);
    assert_eq!(rows[0].channel, "ref24");
    assert_eq!(rows[0].total_users, 25);
    assert!(
        rows.windows(2).all(|w| w[0].total_users >= w[1].total_users),
        "totals must be non-increasing within the hour"
    );
    assert_eq!(rows[19].total_users, 6);
}

#[tokio::test]
async fn flow_rows_order_by_hour_before_total() {
    let store = SqliteStore::open_in_memory().expect("in-memory store");
    let edges = [
        edge("2022-07-14T10:00:00Z", "u1", "dst", "small"),
        edge("2022-07-14T10:00:00Z", "u1", "dst", "big"),
        edge("2022-07-14T10:00:00Z", "u2", "dst", "big"),
        edge("2022-07-14T11:00:00Z", "u1", "dst", "later"),
    ];
    store.insert_edges(&edges).await.expect("insert edges");
    store
        .refresh_flow_aggregates(&[t("2022-07-14T10:00:00Z"), t("2022-07-14T11:00:00Z")])
        .await
        .expect("refresh aggregates");

    let rows = store
        .flows_by_destination("dst", t("2022-07-14T00:00:00Z"), t("2022-07-14T23:00:00Z"))
        .await
        .expect("flow query");
    let got: Vec<(DateTime<Utc>, String, u64)> = rows
        .into_iter()
        .map(|r| (r.ts, r.channel, r.total_users))
        .collect();
    assert_eq!(
        got,
        [
            (t("2022-07-14T10:00:00Z"), "big".to_owned(), 2),
            (t("2022-07-14T10:00:00Z"), "small".to_owned(), 1),
            (t("2022-07-14T11:00:00Z"), "later".to_owned(), 1),
        ]
    );
}

#[tokio::test]
async fn refreshing_aggregates_twice_changes_nothing() {
    let store = SqliteStore::open_in_memory().expect("in-memory store");
    let edges = [
        edge("2022-07-14T10:00:00Z", "u1", "dst", "src"),
        edge("2022-07-14T10:00:00Z", "u2", "dst", "src"),
    ];
    store.insert_edges(&edges).await.expect("insert edges");
    let hours = [t("2022-07-14T10:00:00Z")];
    store
        .refresh_flow_aggregates(&hours)
        .await
        .expect("first refresh");
    store
        .refresh_flow_aggregates(&hours)
        .await
        .expect("second refresh");

    let rows = store
        .flows_by_source("src", t("2022-07-14T00:00:00Z"), t("2022-07-14T23:00:00Z"))
        .await
        .expect("flow query");
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].total_users, 2);
}

#[tokio::test]
async fn tracked_channels_round_trip() {
    let store = SqliteStore::open_in_memory().expect("in-memory store");
    let channel = TrackedChannel {
        broadcaster_id: "36138196".to_owned(),
        display_name: "alexelcapo".to_owned(),
        login: "alexelcapo".to_owned(),
        kind: BroadcasterKind::Partner,
        profile_image_url: Some(
            "https://static-cdn.jtvnw.net/jtv_user_pictures/profile.png".to_owned(),
        ),
        offline_image_url: None,
    };
    store
        .insert_tracked_channel(&channel)
        .await
        .expect("insert channel");

    let rows = store.tracked().await.expect("tracked");
    assert_eq!(rows, [channel]);
}

#[tokio::test]
async fn file_backed_store_persists_across_reopen() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("tracker.db");

    {
        let store = SqliteStore::open(&path).expect("open store");
        store
            .append_viewers("streamer1", t("2020-10-11T10:30:00Z"), &users(&["u1", "u2"]))
            .await
            .expect("append");
    }

    let store = SqliteStore::open(&path).expect("reopen store");
    let samples = store
        .samples_since(t("1970-01-01T00:00:00Z"))
        .await
        .expect("samples");
    assert_eq!(samples.len(), 2);
}

#[tokio::test]
async fn empty_batches_are_noops() {
    let store = SqliteStore::open_in_memory().expect("in-memory store");
    store
        .append_viewers("a", t("2022-07-14T10:00:00Z"), &[])
        .await
        .expect("empty append");
    store.insert_edges(&[]).await.expect("empty edge insert");
    store
        .refresh_flow_aggregates(&[])
        .await
        .expect("empty refresh");
    assert!(
        store
            .samples_since(t("1970-01-01T00:00:00Z"))
            .await
            .expect("samples")
            .is_empty()
    );
}
