//! End-to-end pipeline tests: simulated gateway through multiplexer,
//! storage, buffer queries, and the HTTP surface.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ConnectInfo;
use axum::http::{Request, StatusCode};
use tokio::sync::{mpsc, watch};
use tower::util::ServiceExt;

use tickstream_backend::api::{self, AppState};
use tickstream_backend::background::BackgroundTracker;
use tickstream_backend::codec::{TickFields, UpstreamTimestamp};
use tickstream_backend::config::{Config, TrackedContract};
use tickstream_backend::middleware::limits::{RateLimitConfig, RateLimitLayer};
use tickstream_backend::middleware::ConnectionLimits;
use tickstream_backend::models::{now_us, StreamKey, TickType, HOUR_US};
use tickstream_backend::storage::{
    BufferQuery, FileState, PartitionIndex, QueryOptions, StorageFormat, TickStore, TimeRange,
};
use tickstream_backend::stream::{Multiplexer, NullSink, QueueSink, SinkReceiver, StreamEvent};
use tickstream_backend::supervisor::SessionSupervisor;
use tickstream_backend::upstream::sim::SimGateway;
use tickstream_backend::upstream::Gateway;

const CONTRACT: i32 = 711280073;

struct Service {
    state: AppState,
    sim: Arc<SimGateway>,
    shutdown_tx: watch::Sender<bool>,
    _dir: tempfile::TempDir,
}

/// Build the full service against the scripted gateway, the same wiring the
/// binary performs. The supervisor connects and opens tracked streams.
async fn service(tracked: Vec<TrackedContract>) -> Service {
    let dir = tempfile::tempdir().unwrap();
    let mut config = Config::default();
    config.ports = vec![1];
    config.storage_path = dir.path().to_path_buf();
    config.tracked_contracts = tracked;
    config.reconnect_interval = Duration::from_millis(10);
    config.monitor_period = Duration::from_millis(50);
    config.subscriber_queue_capacity = 256;
    let config = Arc::new(config);

    let formats = vec![StorageFormat::JsonLines, StorageFormat::Binary];
    let index = Arc::new(PartitionIndex::new());
    index.rebuild_from_disk(&config.storage_path, &formats).unwrap();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (store, _) = TickStore::spawn(
        config.storage_path.clone(),
        formats.clone(),
        index.clone(),
        config.storage_queue_capacity,
        shutdown_rx.clone(),
    );

    let (events_tx, events_rx) = mpsc::channel(4096);
    let sim = SimGateway::new(events_tx);

    let mux = Multiplexer::new(
        sim.clone(),
        store.clone(),
        config.tail_ring_capacity,
        config.max_streams,
    );
    let query = Arc::new(BufferQuery::new(index.clone(), formats));
    query.set_tail_source(mux.clone());

    let tracker = BackgroundTracker::new(mux.clone(), &config.tracked_contracts);
    let supervisor =
        SessionSupervisor::new(sim.clone(), mux.clone(), tracker.clone(), config.clone());
    supervisor.start(events_rx, shutdown_rx);

    let state = AppState {
        config: config.clone(),
        mux,
        store,
        index,
        query,
        supervisor,
        tracker,
        ws_limits: ConnectionLimits::new(config.max_connections_per_ip),
    };

    // Wait for the supervisor to establish the session.
    for _ in 0..200 {
        if sim.is_connected() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert!(sim.is_connected(), "supervisor failed to connect");

    Service {
        state,
        sim,
        shutdown_tx,
        _dir: dir,
    }
}

fn tracked_last(contract_id: i32) -> TrackedContract {
    TrackedContract {
        contract_id,
        symbol_label: "ES".to_string(),
        tick_types: vec![TickType::Last],
        buffer_hours: 1,
    }
}

async fn wait_for_request(sim: &SimGateway, key: StreamKey) {
    for _ in 0..200 {
        if sim.request_for(key).is_some() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("no upstream request for {key}");
}

fn trade_fields(event_ts_us: i64, price: f64) -> TickFields {
    TickFields {
        event_ts: Some(UpstreamTimestamp::Micros(event_ts_us)),
        price: Some(price),
        size: Some(1.0),
        ..Default::default()
    }
}

async fn emit_trades(sim: &SimGateway, key: StreamKey, start_us: i64, count: usize) {
    for i in 0..count {
        assert!(
            sim.emit_for(
                key,
                "last",
                trade_fields(start_us + (i as i64) * 1_000, 100.0 + i as f64),
            )
            .await
        );
    }
}

async fn next_tick(rx: &mut SinkReceiver) -> i64 {
    match tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("timed out waiting for tick")
    {
        Some(StreamEvent::Tick(rec)) => rec.event_ts_us,
        other => panic!("expected tick, got {other:?}"),
    }
}

/// Buffer-then-live handoff: a subscriber arriving after 100 stored ticks
/// replays all of them in order, then continues with live data, with the
/// boundary timestamps non-overlapping.
#[tokio::test]
async fn buffer_then_live_handoff() {
    let svc = service(vec![tracked_last(CONTRACT)]).await;
    let key = StreamKey::new(CONTRACT, TickType::Last);
    wait_for_request(&svc.sim, key).await;

    let base = now_us();
    emit_trades(&svc.sim, key, base, 100).await;
    svc.state.store.flush().await;

    // Subscribe with a paused sink: the receiver is not drained until the
    // historical replay is done, exactly as the transports do it.
    let (sink, mut rx) = QueueSink::channel(256);
    let sub = svc
        .state
        .mux
        .subscribe(key, Box::new(sink), false)
        .await
        .unwrap();

    let historical = svc
        .state
        .query
        .query(
            CONTRACT,
            &[TickType::Last],
            TimeRange::last_hours(1),
            QueryOptions {
                include_open_file: true,
                include_tail: true,
                limit: None,
            },
        )
        .unwrap();
    assert_eq!(historical.len(), 100);
    let historical_ts: Vec<i64> = historical.iter().map(|r| r.event_ts_us).collect();
    assert!(historical_ts.windows(2).all(|w| w[0] <= w[1]));
    assert_eq!(historical_ts[0], base);
    assert_eq!(historical_ts[99], base + 99_000);

    // Live tick #101 arrives while the subscriber is still paused, queues,
    // and is delivered after the replay with a timestamp at or past the
    // buffer's end.
    emit_trades(&svc.sim, key, base + 100_000, 1).await;
    let live_ts = next_tick(&mut rx).await;
    assert_eq!(live_ts, base + 100_000);
    assert!(live_ts >= *historical_ts.last().unwrap());

    svc.state.mux.unsubscribe(sub).await;
    svc.shutdown_tx.send(true).unwrap();
}

/// Three subscribers see identical sequences; one leaving mid-stream does
/// not disturb the others.
#[tokio::test]
async fn fan_out_with_mid_stream_disconnect() {
    let svc = service(vec![]).await;
    let key = StreamKey::new(CONTRACT, TickType::BidAsk);

    let mut receivers = Vec::new();
    let mut subs = Vec::new();
    for _ in 0..3 {
        let (sink, rx) = QueueSink::channel(64);
        subs.push(
            svc.state
                .mux
                .subscribe(key, Box::new(sink), false)
                .await
                .unwrap(),
        );
        receivers.push(rx);
    }
    wait_for_request(&svc.sim, key).await;

    let base = now_us();
    let quote = |ts| TickFields {
        event_ts: Some(UpstreamTimestamp::Micros(ts)),
        bid_price: Some(99.0),
        ask_price: Some(99.25),
        bid_size: Some(5.0),
        ask_size: Some(7.0),
        ..Default::default()
    };

    for i in 0..5 {
        assert!(svc.sim.emit_for(key, "bid_ask", quote(base + i * 1_000)).await);
    }
    // Subscriber #2 leaves after tick 5.
    svc.state.mux.unsubscribe(subs[1]).await;
    for i in 5..10 {
        assert!(svc.sim.emit_for(key, "bid_ask", quote(base + i * 1_000)).await);
    }

    for (idx, rx) in receivers.iter_mut().enumerate() {
        let expect = if idx == 1 { 5 } else { 10 };
        for i in 0..expect {
            assert_eq!(next_tick(rx).await, base + i * 1_000, "subscriber {idx}");
        }
    }
    svc.shutdown_tx.send(true).unwrap();
}

/// Ticks spanning three UTC hours produce three sealed partitions per
/// format, and a range query over the whole span returns the union in
/// order.
#[tokio::test]
async fn hour_rotation_and_cross_hour_query() {
    let svc = service(vec![tracked_last(CONTRACT)]).await;
    let key = StreamKey::new(CONTRACT, TickType::Last);
    wait_for_request(&svc.sim, key).await;

    // Three hours ending at the current hour so the staleness math stays
    // realistic.
    let hour2 = now_us() - now_us().rem_euclid(HOUR_US);
    let hour0 = hour2 - 2 * HOUR_US;
    for (hour_idx, hour_start) in [hour0, hour0 + HOUR_US, hour2].iter().enumerate() {
        for i in 0..4i64 {
            assert!(
                svc.sim
                    .emit_for(
                        key,
                        "last",
                        trade_fields(hour_start + i * 1_000, hour_idx as f64),
                    )
                    .await
            );
        }
    }
    svc.state.store.flush().await;

    for format in [StorageFormat::JsonLines, StorageFormat::Binary] {
        let entries = svc.state.index.entries(key, format);
        assert_eq!(entries.len(), 3, "{format}");
        let sealed = entries
            .iter()
            .filter(|e| e.state == FileState::Sealed)
            .count();
        assert_eq!(sealed, 2, "{format}: past hours sealed");
        assert!(entries.iter().all(|e| e.record_count == 4));
    }

    let records = svc
        .state
        .query
        .query(
            CONTRACT,
            &[TickType::Last],
            TimeRange::Explicit {
                start_us: hour0,
                end_us: hour2 + HOUR_US,
            },
            QueryOptions::default(),
        )
        .unwrap();
    assert_eq!(records.len(), 12);
    let ts: Vec<i64> = records.iter().map(|r| r.event_ts_us).collect();
    assert!(ts.windows(2).all(|w| w[0] <= w[1]));
    svc.shutdown_tx.send(true).unwrap();
}

/// A `time_sales` labelled tick lands in the `last` partition; no alias
/// partition exists anywhere on disk.
#[tokio::test]
async fn alias_folding_reaches_storage() {
    let svc = service(vec![tracked_last(CONTRACT)]).await;
    let key = StreamKey::new(CONTRACT, TickType::Last);
    wait_for_request(&svc.sim, key).await;

    let ts = now_us();
    assert!(
        svc.sim
            .emit_for(
                key,
                "time_sales",
                TickFields {
                    event_ts: Some(UpstreamTimestamp::Micros(ts)),
                    price: Some(100.0),
                    size: Some(5.0),
                    ..Default::default()
                },
            )
            .await
    );
    svc.state.store.flush().await;

    let entries = svc.state.index.entries(key, StorageFormat::JsonLines);
    assert_eq!(entries.len(), 1);
    let path = entries[0].path.to_string_lossy().into_owned();
    assert!(path.contains(&format!("{CONTRACT}_last_")));

    let stored = std::fs::read_to_string(&entries[0].path).unwrap();
    assert!(stored.contains("\"p\":100"));
    assert!(stored.contains("\"s\":5"));
    assert!(!stored.contains("time_sales"));

    // No alias partition anywhere in the tree.
    let mut stack = vec![svc.state.config.storage_path.clone()];
    while let Some(dir) = stack.pop() {
        for entry in std::fs::read_dir(&dir).unwrap() {
            let p = entry.unwrap().path();
            if p.is_dir() {
                stack.push(p);
            } else {
                assert!(!p.to_string_lossy().contains("time_sales"));
            }
        }
    }
    svc.shutdown_tx.send(true).unwrap();
}

/// The partition index can be rebuilt from a cold directory scan and keeps
/// answering range queries.
#[tokio::test]
async fn index_rebuild_from_directory_scan() {
    let svc = service(vec![tracked_last(CONTRACT)]).await;
    let key = StreamKey::new(CONTRACT, TickType::Last);
    wait_for_request(&svc.sim, key).await;

    let base = now_us();
    emit_trades(&svc.sim, key, base, 20).await;
    svc.state.store.flush().await;

    let rebuilt = Arc::new(PartitionIndex::new());
    rebuilt
        .rebuild_from_disk(
            &svc.state.config.storage_path,
            &[StorageFormat::JsonLines, StorageFormat::Binary],
        )
        .unwrap();

    for format in [StorageFormat::JsonLines, StorageFormat::Binary] {
        let entries = rebuilt.entries(key, format);
        assert_eq!(entries.len(), 1, "{format}");
        assert_eq!(entries[0].record_count, 20);
        assert_eq!(entries[0].first_event_ts_us, Some(base));
        assert_eq!(entries[0].last_event_ts_us, Some(base + 19_000));
    }

    let query = BufferQuery::new(rebuilt, vec![StorageFormat::JsonLines]);
    let records = query
        .query(
            CONTRACT,
            &[TickType::Last],
            TimeRange::Explicit {
                start_us: base + 5_000,
                end_us: base + 10_000,
            },
            QueryOptions::default(),
        )
        .unwrap();
    assert_eq!(records.len(), 6);
    svc.shutdown_tx.send(true).unwrap();
}

/// Storage keeps recording while every subscriber is slow or absent.
#[tokio::test]
async fn storage_is_independent_of_subscribers() {
    let svc = service(vec![tracked_last(CONTRACT)]).await;
    let key = StreamKey::new(CONTRACT, TickType::Last);
    wait_for_request(&svc.sim, key).await;

    // One hopelessly slow subscriber next to the background stream.
    let (sink, _rx) = QueueSink::channel(1);
    svc.state
        .mux
        .subscribe(key, Box::new(sink), false)
        .await
        .unwrap();

    let base = now_us();
    emit_trades(&svc.sim, key, base, 50).await;
    svc.state.store.flush().await;

    let entries = svc.state.index.entries(key, StorageFormat::JsonLines);
    let total: u64 = entries.iter().map(|e| e.record_count).sum();
    assert_eq!(total, 50);
    svc.shutdown_tx.send(true).unwrap();
}

fn request(path: &str) -> Request<axum::body::Body> {
    let mut req = Request::builder()
        .uri(path)
        .body(axum::body::Body::empty())
        .unwrap();
    req.extensions_mut()
        .insert(ConnectInfo(SocketAddr::from(([127, 0, 0, 1], 40000))));
    req
}

async fn json_body(response: axum::response::Response) -> serde_json::Value {
    let bytes = axum::body::to_bytes(response.into_body(), 1 << 20)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn health_endpoint_reports_session_and_storage() {
    let svc = service(vec![tracked_last(CONTRACT)]).await;
    let key = StreamKey::new(CONTRACT, TickType::Last);
    wait_for_request(&svc.sim, key).await;
    emit_trades(&svc.sim, key, now_us(), 1).await;

    // The health snapshot refreshes on the next monitor cycle.
    for _ in 0..200 {
        if svc.state.supervisor.health().data_flowing {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let router = api::router(svc.state.clone(), RateLimitLayer::new(RateLimitConfig::default()));
    let response = router.oneshot(request("/health")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;

    assert_eq!(body["tws_connected"], true);
    assert_eq!(body["storage"]["enabled"], true);
    assert_eq!(body["background_streaming"]["data_flowing"], true);
    assert_eq!(body["status"], "healthy");
    svc.shutdown_tx.send(true).unwrap();
}

#[tokio::test]
async fn buffer_range_endpoint_returns_recorded_ticks() {
    let svc = service(vec![tracked_last(CONTRACT)]).await;
    let key = StreamKey::new(CONTRACT, TickType::Last);
    wait_for_request(&svc.sim, key).await;

    let base = now_us();
    emit_trades(&svc.sim, key, base, 10).await;
    svc.state.store.flush().await;

    let router = api::router(svc.state.clone(), RateLimitLayer::new(RateLimitConfig::default()));
    let path = format!(
        "/buffer/{CONTRACT}/range?tick_types=last&start_time={}&end_time={}",
        base,
        base + 4_000
    );
    let response = router.clone().oneshot(request(&path)).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["count"], 5);
    assert_eq!(body["ticks"][0]["event_ts_us"], base);

    // Bad tick type is a 400 with a stable error code.
    let response = router
        .oneshot(request(&format!("/buffer/{CONTRACT}/range?tick_types=depth")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = json_body(response).await;
    assert_eq!(body["error"], "unknown_tick_type");
    svc.shutdown_tx.send(true).unwrap();
}

#[tokio::test]
async fn background_endpoints_expose_tracker_state() {
    let svc = service(vec![tracked_last(CONTRACT)]).await;
    let key = StreamKey::new(CONTRACT, TickType::Last);
    wait_for_request(&svc.sim, key).await;
    emit_trades(&svc.sim, key, now_us(), 1).await;

    let router = api::router(svc.state.clone(), RateLimitLayer::new(RateLimitConfig::default()));
    let response = router
        .clone()
        .oneshot(request("/background/status"))
        .await
        .unwrap();
    let body = json_body(response).await;
    assert_eq!(body["streams"][0]["contract_id"], CONTRACT);
    assert_eq!(body["streams"][0]["streaming"], true);

    let response = router
        .clone()
        .oneshot(request(&format!("/background/health/{CONTRACT}")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = router
        .oneshot(request("/background/health/999"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    svc.shutdown_tx.send(true).unwrap();
}

#[tokio::test]
async fn rate_limit_rejects_bursts() {
    let svc = service(vec![]).await;
    let limiter = RateLimitLayer::new(RateLimitConfig {
        max_requests: 3,
        window: Duration::from_secs(60),
    });
    let router = api::router(svc.state.clone(), limiter);

    for _ in 0..3 {
        let response = router
            .clone()
            .oneshot(request("/background/status"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
    let response = router
        .oneshot(request("/background/status"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    svc.shutdown_tx.send(true).unwrap();
}

/// Reconnect keeps background coverage: after a transport drop the tracked
/// stream is re-established and keeps persisting.
#[tokio::test]
async fn reconnect_restores_background_persistence() {
    let svc = service(vec![tracked_last(CONTRACT)]).await;
    let key = StreamKey::new(CONTRACT, TickType::Last);
    wait_for_request(&svc.sim, key).await;

    let base = now_us();
    emit_trades(&svc.sim, key, base, 5).await;

    svc.sim.drop_connection("flaky network").await;
    wait_for_request(&svc.sim, key).await;

    emit_trades(&svc.sim, key, base + 60_000, 5).await;
    svc.state.store.flush().await;

    let entries = svc.state.index.entries(key, StorageFormat::JsonLines);
    let total: u64 = entries.iter().map(|e| e.record_count).sum();
    assert_eq!(total, 10);

    // A NullSink background subscriber never counts as a consumer, so the
    // stream is still background-owned.
    assert!(svc.state.mux.stream_info(key).unwrap().is_background);
    svc.shutdown_tx.send(true).unwrap();
}
