//! Stream multiplexer.
//!
//! Holds at most one upstream subscription per `(contract, tick type)` and
//! fans every record out to N subscriber sinks, the in-memory tail ring,
//! and the storage pipeline. Subscribers never share channel state; a slow
//! one is cut loose without disturbing the rest.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::codec::{self, TickFields};
use crate::error::ServiceError;
use crate::models::{now_us, StreamKey, TickRecord, TickType};
use crate::storage::{TailSource, TickStore};
use crate::stream::sink::{OfferOutcome, TickSink};
use crate::upstream::Gateway;

/// Consecutive dropped offers before a subscriber is flagged slow and cut.
const SLOW_CONSUMER_DROPS: u8 = 2;

/// Gateway error codes that permanently invalidate a request.
const FATAL_REQUEST_CODES: [i32; 3] = [200, 203, 354];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamState {
    /// Upstream request issued, no tick seen yet.
    Starting,
    /// Flowing: fan out, tail, storage.
    Active,
    /// Last subscriber left; upstream cancel in flight.
    Stopping,
    /// Session lost; waiting for the supervisor to rebuild.
    PendingRestart,
}

struct SubscriberSlot {
    sink: Box<dyn TickSink>,
    consecutive_drops: u8,
}

/// One multiplex slot. Owned by the multiplexer; subscribers hold only a
/// [`Subscription`] key back into it.
pub struct StreamHandle {
    key: StreamKey,
    request_id: AtomicI32,
    state: Mutex<StreamState>,
    subscribers: Mutex<HashMap<u64, SubscriberSlot>>,
    tail: Mutex<VecDeque<TickRecord>>,
    tail_capacity: usize,
    last_event_ts_us: AtomicI64,
    is_background: AtomicBool,
}

impl StreamHandle {
    fn new(key: StreamKey, request_id: i32, tail_capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            key,
            request_id: AtomicI32::new(request_id),
            state: Mutex::new(StreamState::Starting),
            subscribers: Mutex::new(HashMap::new()),
            tail: Mutex::new(VecDeque::with_capacity(tail_capacity)),
            tail_capacity,
            last_event_ts_us: AtomicI64::new(i64::MIN),
            is_background: AtomicBool::new(false),
        })
    }

    fn state(&self) -> StreamState {
        *self.state.lock()
    }

    fn set_state(&self, next: StreamState) {
        *self.state.lock() = next;
    }

    fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }

    fn push_tail(&self, record: &TickRecord) {
        let mut tail = self.tail.lock();
        if tail.len() == self.tail_capacity {
            tail.pop_front();
        }
        tail.push_back(record.clone());
    }

    /// Timestamp of the most recent record, or `None` before the first.
    pub fn last_event_ts_us(&self) -> Option<i64> {
        match self.last_event_ts_us.load(Ordering::Acquire) {
            i64::MIN => None,
            ts => Some(ts),
        }
    }
}

/// A subscriber's key back into the multiplexer. Dropping it does not
/// unsubscribe; transports call [`Multiplexer::unsubscribe`] explicitly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Subscription {
    pub key: StreamKey,
    id: u64,
}

/// Introspection row for the status endpoints.
#[derive(Debug, Clone, Serialize)]
pub struct StreamInfo {
    pub contract_id: i32,
    pub tick_type: TickType,
    pub request_id: i32,
    pub state: StreamState,
    pub subscriber_count: usize,
    pub is_background: bool,
    pub last_event_ts_us: Option<i64>,
    pub tail_len: usize,
}

pub struct Multiplexer {
    gateway: Arc<dyn Gateway>,
    store: TickStore,
    streams: RwLock<HashMap<StreamKey, Arc<StreamHandle>>>,
    by_request: RwLock<HashMap<i32, StreamKey>>,
    tail_capacity: usize,
    max_streams: usize,
    next_subscriber: AtomicU64,
}

impl Multiplexer {
    pub fn new(
        gateway: Arc<dyn Gateway>,
        store: TickStore,
        tail_capacity: usize,
        max_streams: usize,
    ) -> Arc<Self> {
        Arc::new(Self {
            gateway,
            store,
            streams: RwLock::new(HashMap::new()),
            by_request: RwLock::new(HashMap::new()),
            tail_capacity,
            max_streams,
            next_subscriber: AtomicU64::new(1),
        })
    }

    /// Attach a sink to the stream for `key`, opening the upstream
    /// subscription if this is the first interest in it. A second
    /// subscriber on the same key shares the existing upstream stream.
    pub async fn subscribe(
        &self,
        key: StreamKey,
        sink: Box<dyn TickSink>,
        background: bool,
    ) -> Result<Subscription, ServiceError> {
        if key.contract_id <= 0 {
            return Err(ServiceError::InvalidContract(key.contract_id.to_string()));
        }

        enum Attach {
            Existing,
            /// First interest in the key; the upstream request must be made.
            Fresh,
            /// The handle was stopping; its cancelled upstream subscription
            /// needs a new request id.
            Reactivate,
        }

        let (handle, attach) = {
            let mut streams = self.streams.write();
            match streams.get(&key) {
                Some(handle) => {
                    let attach = if handle.state() == StreamState::Stopping {
                        Attach::Reactivate
                    } else {
                        Attach::Existing
                    };
                    (handle.clone(), attach)
                }
                None => {
                    if streams.len() >= self.max_streams {
                        return Err(ServiceError::StreamLimitReached(streams.len()));
                    }
                    let request_id = self.fresh_request_id(key);
                    let handle = StreamHandle::new(key, request_id, self.tail_capacity);
                    streams.insert(key, handle.clone());
                    self.by_request.write().insert(request_id, key);
                    (handle, Attach::Fresh)
                }
            }
        };

        if background {
            handle.is_background.store(true, Ordering::Release);
        }
        let id = self.next_subscriber.fetch_add(1, Ordering::Relaxed);
        handle.subscribers.lock().insert(
            id,
            SubscriberSlot {
                sink,
                consecutive_drops: 0,
            },
        );

        match attach {
            Attach::Fresh => self.open_upstream(&handle).await,
            Attach::Reactivate => self.reopen_upstream(&handle).await,
            Attach::Existing => {}
        }

        Ok(Subscription { key, id })
    }

    /// Detach a subscriber. When the last non-background subscriber leaves,
    /// the upstream subscription is cancelled and the slot removed.
    pub async fn unsubscribe(&self, subscription: Subscription) {
        let Some(handle) = self.streams.read().get(&subscription.key).cloned() else {
            return;
        };
        handle.subscribers.lock().remove(&subscription.id);

        if handle.subscriber_count() == 0 && !handle.is_background.load(Ordering::Acquire) {
            handle.set_state(StreamState::Stopping);
            let request_id = handle.request_id.load(Ordering::Acquire);
            if let Err(e) = self.gateway.cancel_ticks(request_id).await {
                debug!(stream = %subscription.key, error = %e, "cancel on unsubscribe failed");
            }
            // A racing subscribe may have reactivated the handle.
            if handle.state() == StreamState::Stopping && handle.subscriber_count() == 0 {
                self.streams.write().remove(&subscription.key);
                self.by_request.write().remove(&request_id);
                info!(stream = %subscription.key, "stream closed");
            }
        }
    }

    /// Route one upstream tick callback into the owning stream.
    pub fn on_upstream_tick(&self, request_id: i32, tick_type_label: &str, fields: TickFields) {
        let Some(key) = self.by_request.read().get(&request_id).copied() else {
            debug!(request_id, "tick for unknown request id");
            return;
        };
        let Some(handle) = self.streams.read().get(&key).cloned() else {
            return;
        };

        match handle.state() {
            StreamState::Stopping | StreamState::PendingRestart => return,
            StreamState::Starting => {
                handle.set_state(StreamState::Active);
            }
            StreamState::Active => {}
        }

        let mut record = match codec::encode(key.contract_id, tick_type_label, fields) {
            Ok(record) => record,
            Err(e) => {
                warn!(stream = %key, error = %e, "dropping unnormalizable tick");
                return;
            }
        };
        if record.tick_type != key.tick_type {
            warn!(
                stream = %key,
                label = tick_type_label,
                "tick label does not match stream, dropping"
            );
            return;
        }
        record.request_id = handle.request_id.load(Ordering::Acquire);

        // Per-stream timestamps never go backwards downstream; a regressing
        // upstream clock is clamped to the previous value (duplicates are
        // fine).
        let prev = handle.last_event_ts_us.load(Ordering::Acquire);
        if prev != i64::MIN && record.event_ts_us < prev {
            debug!(stream = %key, "clamping regressing event timestamp");
            record.event_ts_us = prev;
        }
        handle
            .last_event_ts_us
            .store(record.event_ts_us, Ordering::Release);

        handle.push_tail(&record);
        self.store.record(record.clone());
        self.fan_out(&handle, &record);
    }

    /// Gateway error routed by request id. Fatal codes close every
    /// subscriber and drop the stream; anything else is logged only.
    pub async fn on_upstream_error(&self, request_id: i32, code: i32, message: &str) {
        let Some(key) = self.by_request.read().get(&request_id).copied() else {
            warn!(request_id, code, message, "gateway error for unknown request");
            return;
        };
        if !FATAL_REQUEST_CODES.contains(&code) {
            warn!(stream = %key, code, message, "gateway warning for stream");
            return;
        }

        warn!(stream = %key, code, message, "fatal gateway error, closing stream");
        let handle = { self.streams.write().remove(&key) };
        self.by_request.write().remove(&request_id);
        if let Some(handle) = handle {
            let error = ServiceError::InvalidContract(format!("{code}: {message}"));
            let mut subscribers = handle.subscribers.lock();
            for (_, slot) in subscribers.drain() {
                slot.sink.close(Some(&error));
            }
        }
    }

    fn fan_out(&self, handle: &StreamHandle, record: &TickRecord) {
        let mut subscribers = handle.subscribers.lock();
        let mut evict = Vec::new();
        for (id, slot) in subscribers.iter_mut() {
            match slot.sink.try_offer(record) {
                OfferOutcome::Accepted => slot.consecutive_drops = 0,
                OfferOutcome::Dropped => {
                    slot.consecutive_drops += 1;
                    if slot.consecutive_drops >= SLOW_CONSUMER_DROPS {
                        warn!(stream = %handle.key, subscriber = id, "closing slow consumer");
                        slot.sink.close(Some(&ServiceError::SlowConsumer));
                        evict.push(*id);
                    }
                }
                OfferOutcome::Closed => evict.push(*id),
            }
        }
        for id in evict {
            subscribers.remove(&id);
        }
    }

    /// Mark every stream as waiting for the session to come back. Called by
    /// the supervisor the moment the transport drops.
    pub fn suspend_all(&self) {
        for handle in self.streams.read().values() {
            handle.set_state(StreamState::PendingRestart);
        }
    }

    /// Re-establish upstream subscriptions after a reconnect, in parallel.
    /// Streams that are background or still have subscribers get a fresh
    /// request id; abandoned ones are dropped.
    pub async fn resume_all(&self) {
        let handles: Vec<_> = self.streams.read().values().cloned().collect();
        let mut wanted = Vec::new();
        for handle in handles {
            if handle.is_background.load(Ordering::Acquire) || handle.subscriber_count() > 0 {
                wanted.push(handle);
            } else {
                let request_id = handle.request_id.load(Ordering::Acquire);
                self.streams.write().remove(&handle.key);
                self.by_request.write().remove(&request_id);
                debug!(stream = %handle.key, "dropping abandoned stream after reconnect");
            }
        }
        futures_util::future::join_all(wanted.iter().map(|handle| self.reopen_upstream(handle)))
            .await;
    }

    /// Tear down and re-request one stream (escalation level 2).
    pub async fn restart_stream(&self, key: StreamKey) {
        let Some(handle) = self.streams.read().get(&key).cloned() else {
            return;
        };
        let old_request = handle.request_id.load(Ordering::Acquire);
        if let Err(e) = self.gateway.cancel_ticks(old_request).await {
            debug!(stream = %key, error = %e, "cancel during stream restart failed");
        }
        self.reopen_upstream(&handle).await;
        info!(stream = %key, "stream worker restarted");
    }

    /// Send an unrecoverable-session error to every subscriber. Background
    /// handles survive so recovery can continue to retry.
    pub fn fail_all_subscribers(&self, reason: &str) {
        let error = ServiceError::UpstreamDisconnected(reason.to_string());
        for handle in self.streams.read().values() {
            let mut subscribers = handle.subscribers.lock();
            for (_, slot) in subscribers.drain() {
                slot.sink.close(Some(&error));
            }
        }
    }

    /// Complete every subscriber cleanly. First step of the global
    /// shutdown drain; storage flush and session teardown follow.
    pub fn complete_all_subscribers(&self) {
        for handle in self.streams.read().values() {
            let mut subscribers = handle.subscribers.lock();
            for (_, slot) in subscribers.drain() {
                slot.sink.close(None);
            }
        }
    }

    async fn open_upstream(&self, handle: &Arc<StreamHandle>) {
        let request_id = handle.request_id.load(Ordering::Acquire);
        match self
            .gateway
            .request_ticks(request_id, handle.key.contract_id, handle.key.tick_type)
            .await
        {
            Ok(()) => {
                handle.set_state(StreamState::Active);
                info!(stream = %handle.key, request_id, "upstream stream opened");
            }
            Err(e) => {
                // Keep the handle; the supervisor rebuilds it on reconnect.
                handle.set_state(StreamState::PendingRestart);
                warn!(stream = %handle.key, error = %e, "upstream request deferred");
            }
        }
    }

    async fn reopen_upstream(&self, handle: &Arc<StreamHandle>) {
        let old_request = handle.request_id.load(Ordering::Acquire);
        let request_id = self.fresh_request_id(handle.key);
        {
            let mut by_request = self.by_request.write();
            by_request.remove(&old_request);
            by_request.insert(request_id, handle.key);
        }
        handle.request_id.store(request_id, Ordering::Release);
        self.open_upstream(handle).await;
    }

    fn fresh_request_id(&self, key: StreamKey) -> i32 {
        let by_request = self.by_request.read();
        let mut ts = now_us();
        loop {
            let candidate = codec::request_id(key.contract_id, key.tick_type, ts);
            if !by_request.contains_key(&candidate) {
                return candidate;
            }
            ts += 1;
        }
    }

    pub fn stream_info(&self, key: StreamKey) -> Option<StreamInfo> {
        self.streams.read().get(&key).map(|handle| StreamInfo {
            contract_id: key.contract_id,
            tick_type: key.tick_type,
            request_id: handle.request_id.load(Ordering::Acquire),
            state: handle.state(),
            subscriber_count: handle.subscriber_count(),
            is_background: handle.is_background.load(Ordering::Acquire),
            last_event_ts_us: handle.last_event_ts_us(),
            tail_len: handle.tail.lock().len(),
        })
    }

    pub fn stream_infos(&self) -> Vec<StreamInfo> {
        let keys: Vec<_> = self.streams.read().keys().copied().collect();
        keys.into_iter()
            .filter_map(|key| self.stream_info(key))
            .collect()
    }

    /// Age of the newest record for `key`, against `now`.
    pub fn last_event_ts(&self, key: StreamKey) -> Option<i64> {
        self.streams
            .read()
            .get(&key)
            .and_then(|h| h.last_event_ts_us())
    }

    pub fn stream_count(&self) -> usize {
        self.streams.read().len()
    }
}

impl TailSource for Multiplexer {
    fn tail(&self, key: StreamKey) -> Vec<TickRecord> {
        self.streams
            .read()
            .get(&key)
            .map(|handle| handle.tail.lock().iter().cloned().collect())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::UpstreamTimestamp;
    use crate::storage::{PartitionIndex, StorageFormat, TickStore};
    use crate::stream::sink::{NullSink, QueueSink, SinkReceiver, StreamEvent};
    use crate::upstream::sim::SimGateway;
    use tokio::sync::{mpsc, watch};

    struct Rig {
        mux: Arc<Multiplexer>,
        sim: Arc<SimGateway>,
        _dir: tempfile::TempDir,
        _shutdown: watch::Sender<bool>,
    }

    async fn rig() -> Rig {
        let dir = tempfile::tempdir().unwrap();
        let (events_tx, mut events_rx) = mpsc::channel(256);
        let sim = SimGateway::new(events_tx);
        sim.connect("sim", 0, 1).await.unwrap();

        let index = Arc::new(PartitionIndex::new());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (store, _) = TickStore::spawn(
            dir.path().to_path_buf(),
            vec![StorageFormat::JsonLines],
            index,
            1024,
            shutdown_rx,
        );
        let mux = Multiplexer::new(sim.clone(), store, 64, 8);

        // Inline event pump, standing in for the supervisor's dispatcher.
        let pump_mux = mux.clone();
        tokio::spawn(async move {
            while let Some(event) = events_rx.recv().await {
                if let crate::upstream::GatewayEvent::Tick {
                    request_id,
                    tick_type_label,
                    fields,
                } = event
                {
                    pump_mux.on_upstream_tick(request_id, tick_type_label, fields);
                }
            }
        });

        Rig {
            mux,
            sim,
            _dir: dir,
            _shutdown: shutdown_tx,
        }
    }

    fn fields(ts_us: i64, price: f64) -> TickFields {
        TickFields {
            event_ts: Some(UpstreamTimestamp::Micros(ts_us)),
            price: Some(price),
            size: Some(1.0),
            ..Default::default()
        }
    }

    async fn recv_tick(rx: &mut SinkReceiver) -> TickRecord {
        match tokio::time::timeout(std::time::Duration::from_secs(1), rx.recv())
            .await
            .expect("timed out")
        {
            Some(StreamEvent::Tick(rec)) => rec,
            other => panic!("expected tick, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn second_subscriber_shares_upstream_stream() {
        let rig = rig().await;
        let key = StreamKey::new(100, TickType::Last);

        let (sink_a, _rx_a) = QueueSink::channel(16);
        let (sink_b, _rx_b) = QueueSink::channel(16);
        rig.mux
            .subscribe(key, Box::new(sink_a), false)
            .await
            .unwrap();
        rig.mux
            .subscribe(key, Box::new(sink_b), false)
            .await
            .unwrap();

        assert_eq!(rig.sim.active_requests().len(), 1);
        assert_eq!(rig.mux.stream_info(key).unwrap().subscriber_count, 2);
    }

    #[tokio::test]
    async fn fan_out_delivers_to_all_subscribers() {
        let rig = rig().await;
        let key = StreamKey::new(100, TickType::Last);

        let (sink_a, mut rx_a) = QueueSink::channel(16);
        let (sink_b, mut rx_b) = QueueSink::channel(16);
        rig.mux
            .subscribe(key, Box::new(sink_a), false)
            .await
            .unwrap();
        rig.mux
            .subscribe(key, Box::new(sink_b), false)
            .await
            .unwrap();

        for i in 0..5 {
            assert!(rig.sim.emit_for(key, "last", fields(1_000 + i, 10.0)).await);
        }
        for rx in [&mut rx_a, &mut rx_b] {
            for i in 0..5 {
                assert_eq!(recv_tick(rx).await.event_ts_us, 1_000 + i);
            }
        }
    }

    #[tokio::test]
    async fn slow_consumer_is_cut_without_affecting_others() {
        let rig = rig().await;
        let key = StreamKey::new(100, TickType::Last);

        let (slow_sink, mut slow_rx) = QueueSink::channel(1);
        let (fast_sink, mut fast_rx) = QueueSink::channel(64);
        rig.mux
            .subscribe(key, Box::new(slow_sink), false)
            .await
            .unwrap();
        rig.mux
            .subscribe(key, Box::new(fast_sink), false)
            .await
            .unwrap();

        // Queue of 1 with no draining: first tick accepted, next two
        // dropped, slow flag trips on the second drop.
        for i in 0..10 {
            assert!(rig.sim.emit_for(key, "last", fields(1_000 + i, 10.0)).await);
            tokio::task::yield_now().await;
        }
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        // Fast subscriber saw everything.
        for i in 0..10 {
            assert_eq!(recv_tick(&mut fast_rx).await.event_ts_us, 1_000 + i);
        }

        // Slow subscriber: one tick, then the terminal error.
        let mut saw_error = false;
        while let Ok(Some(event)) =
            tokio::time::timeout(std::time::Duration::from_millis(200), slow_rx.recv()).await
        {
            if let StreamEvent::Error { code, .. } = event {
                assert_eq!(code, "slow_consumer");
                saw_error = true;
                break;
            }
        }
        assert!(saw_error);
        assert_eq!(rig.mux.stream_info(key).unwrap().subscriber_count, 1);
    }

    #[tokio::test]
    async fn unsubscribe_of_last_subscriber_cancels_upstream() {
        let rig = rig().await;
        let key = StreamKey::new(100, TickType::BidAsk);

        let (sink, _rx) = QueueSink::channel(16);
        let sub = rig.mux.subscribe(key, Box::new(sink), false).await.unwrap();
        assert_eq!(rig.sim.active_requests().len(), 1);

        rig.mux.unsubscribe(sub).await;
        assert!(rig.sim.active_requests().is_empty());
        assert_eq!(rig.sim.cancelled_requests().len(), 1);
        assert!(rig.mux.stream_info(key).is_none());
    }

    #[tokio::test]
    async fn background_stream_survives_subscriber_churn() {
        let rig = rig().await;
        let key = StreamKey::new(100, TickType::Last);

        rig.mux
            .subscribe(key, Box::new(NullSink), true)
            .await
            .unwrap();
        let (sink, _rx) = QueueSink::channel(16);
        let sub = rig.mux.subscribe(key, Box::new(sink), false).await.unwrap();
        rig.mux.unsubscribe(sub).await;

        assert!(rig.mux.stream_info(key).unwrap().is_background);
        assert_eq!(rig.sim.active_requests().len(), 1);
    }

    #[tokio::test]
    async fn alias_label_folds_into_stream() {
        let rig = rig().await;
        let key = StreamKey::new(100, TickType::Last);

        let (sink, mut rx) = QueueSink::channel(16);
        rig.mux.subscribe(key, Box::new(sink), false).await.unwrap();
        assert!(
            rig.sim
                .emit_for(key, "time_sales", fields(5_000, 42.0))
                .await
        );

        let rec = recv_tick(&mut rx).await;
        assert_eq!(rec.tick_type, TickType::Last);
        assert_eq!(rec.price, Some(42.0));
    }

    #[tokio::test]
    async fn timestamps_are_clamped_monotone() {
        let rig = rig().await;
        let key = StreamKey::new(100, TickType::Last);

        let (sink, mut rx) = QueueSink::channel(16);
        rig.mux.subscribe(key, Box::new(sink), false).await.unwrap();

        rig.sim.emit_for(key, "last", fields(2_000, 1.0)).await;
        rig.sim.emit_for(key, "last", fields(1_500, 2.0)).await; // regresses
        rig.sim.emit_for(key, "last", fields(3_000, 3.0)).await;

        assert_eq!(recv_tick(&mut rx).await.event_ts_us, 2_000);
        assert_eq!(recv_tick(&mut rx).await.event_ts_us, 2_000); // clamped
        assert_eq!(recv_tick(&mut rx).await.event_ts_us, 3_000);
    }

    #[tokio::test]
    async fn reconnect_rebuilds_wanted_streams_with_fresh_ids() {
        let rig = rig().await;
        let live_key = StreamKey::new(100, TickType::Last);
        let bg_key = StreamKey::new(200, TickType::BidAsk);

        let (sink, _rx) = QueueSink::channel(16);
        rig.mux
            .subscribe(live_key, Box::new(sink), false)
            .await
            .unwrap();
        rig.mux
            .subscribe(bg_key, Box::new(NullSink), true)
            .await
            .unwrap();
        let old_live = rig.sim.request_for(live_key).unwrap();

        rig.sim.drop_connection("test").await;
        rig.mux.suspend_all();
        assert_eq!(
            rig.mux.stream_info(live_key).unwrap().state,
            StreamState::PendingRestart
        );

        rig.sim.connect("sim", 0, 2).await.unwrap();
        rig.mux.resume_all().await;

        let new_live = rig.sim.request_for(live_key).unwrap();
        assert_ne!(old_live, new_live);
        assert!(rig.sim.request_for(bg_key).is_some());
        assert_eq!(
            rig.mux.stream_info(live_key).unwrap().state,
            StreamState::Active
        );
    }

    #[tokio::test]
    async fn fatal_gateway_error_closes_stream() {
        let rig = rig().await;
        let key = StreamKey::new(100, TickType::Last);

        let (sink, mut rx) = QueueSink::channel(16);
        rig.mux.subscribe(key, Box::new(sink), false).await.unwrap();
        let request_id = rig.sim.request_for(key).unwrap();

        rig.mux
            .on_upstream_error(request_id, 200, "No security definition found")
            .await;

        assert!(rig.mux.stream_info(key).is_none());
        let Some(StreamEvent::Error { code, .. }) = rx.recv().await else {
            panic!("expected error event");
        };
        assert_eq!(code, "invalid_contract");
    }

    #[tokio::test]
    async fn stream_cap_is_enforced() {
        let rig = rig().await;
        for i in 1..=8 {
            rig.mux
                .subscribe(StreamKey::new(i, TickType::Last), Box::new(NullSink), true)
                .await
                .unwrap();
        }
        let err = rig
            .mux
            .subscribe(StreamKey::new(9, TickType::Last), Box::new(NullSink), true)
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::StreamLimitReached(8)));
    }
}
