//! Background stream tracker.
//!
//! Keeps the configured set of `(contract, tick type)` streams open for the
//! lifetime of the process, independent of external subscribers, so that
//! storage and the tail ring always have data for new subscribers' buffer
//! windows. Also supplies the data-flow half of the supervisor's health
//! signal.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tracing::{info, warn};

use crate::config::TrackedContract;
use crate::models::{StreamKey, TickType};
use crate::storage::MarketSession;
use crate::stream::{Multiplexer, NullSink};

#[derive(Debug, Clone)]
struct TrackedEntry {
    key: StreamKey,
    symbol_label: String,
    buffer_hours: u32,
}

/// Per-stream row for the background status endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct TrackedStreamStatus {
    pub contract_id: i32,
    pub symbol_label: String,
    pub tick_type: TickType,
    pub buffer_hours: u32,
    pub streaming: bool,
    pub last_event_ts_us: Option<i64>,
    pub age_us: Option<i64>,
}

/// Health classification for one tracked contract, with market-hours
/// context: a silent stream outside trading hours is idle, not stale.
#[derive(Debug, Clone, Serialize)]
pub struct TrackedHealth {
    pub contract_id: i32,
    pub status: &'static str,
    pub market_open: bool,
    pub streams: Vec<TrackedStreamStatus>,
}

pub struct BackgroundTracker {
    mux: Arc<Multiplexer>,
    entries: Vec<TrackedEntry>,
}

impl BackgroundTracker {
    pub fn new(mux: Arc<Multiplexer>, tracked: &[TrackedContract]) -> Arc<Self> {
        let entries = tracked
            .iter()
            .flat_map(|contract| {
                contract.tick_types.iter().map(move |tick_type| TrackedEntry {
                    key: StreamKey::new(contract.contract_id, *tick_type),
                    symbol_label: contract.symbol_label.clone(),
                    buffer_hours: contract.buffer_hours,
                })
            })
            .collect();
        Arc::new(Self { mux, entries })
    }

    /// Open every tracked stream that is not already running. Called at
    /// startup and again after every reconnect, so streams lost to fatal
    /// upstream errors come back too.
    pub async fn ensure_started(&self) {
        for entry in &self.entries {
            if self.mux.stream_info(entry.key).is_some() {
                continue;
            }
            match self
                .mux
                .subscribe(entry.key, Box::new(NullSink), true)
                .await
            {
                Ok(_) => {
                    info!(stream = %entry.key, label = %entry.symbol_label, "background stream opened")
                }
                Err(e) => {
                    warn!(stream = %entry.key, error = %e, "failed to open background stream")
                }
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn keys(&self) -> Vec<StreamKey> {
        self.entries.iter().map(|e| e.key).collect()
    }

    /// Buffer window for a tracked contract, if any of its streams are
    /// tracked.
    pub fn buffer_hours(&self, contract_id: i32) -> Option<u32> {
        self.entries
            .iter()
            .find(|e| e.key.contract_id == contract_id)
            .map(|e| e.buffer_hours)
    }

    pub fn is_tracked(&self, contract_id: i32) -> bool {
        self.entries.iter().any(|e| e.key.contract_id == contract_id)
    }

    /// True when at least one tracked stream produced a tick within
    /// `threshold`. With nothing tracked there is no data signal to judge,
    /// so the check passes vacuously.
    pub fn data_flowing(&self, threshold: Duration, now_us: i64) -> bool {
        if self.entries.is_empty() {
            return true;
        }
        let threshold_us = threshold.as_micros() as i64;
        self.entries.iter().any(|entry| {
            self.mux
                .last_event_ts(entry.key)
                .is_some_and(|ts| now_us - ts <= threshold_us)
        })
    }

    /// Tracked streams with no tick inside `threshold`, with their age
    /// (`None` until a first tick arrives).
    pub fn stale_streams(&self, threshold: Duration, now_us: i64) -> Vec<(StreamKey, Option<i64>)> {
        let threshold_us = threshold.as_micros() as i64;
        self.entries
            .iter()
            .filter_map(|entry| match self.mux.last_event_ts(entry.key) {
                Some(ts) if now_us - ts <= threshold_us => None,
                Some(ts) => Some((entry.key, Some(now_us - ts))),
                None => Some((entry.key, None)),
            })
            .collect()
    }

    fn stream_status(&self, entry: &TrackedEntry, now_us: i64) -> TrackedStreamStatus {
        let info = self.mux.stream_info(entry.key);
        let last_event_ts_us = info.as_ref().and_then(|i| i.last_event_ts_us);
        TrackedStreamStatus {
            contract_id: entry.key.contract_id,
            symbol_label: entry.symbol_label.clone(),
            tick_type: entry.key.tick_type,
            buffer_hours: entry.buffer_hours,
            streaming: info.is_some(),
            last_event_ts_us,
            age_us: last_event_ts_us.map(|ts| now_us - ts),
        }
    }

    /// Status rows for every tracked stream.
    pub fn status(&self, now_us: i64) -> Vec<TrackedStreamStatus> {
        self.entries
            .iter()
            .map(|entry| self.stream_status(entry, now_us))
            .collect()
    }

    /// Health classification for one contract with market-hours context.
    pub fn health_for(
        &self,
        contract_id: i32,
        staleness: Duration,
        now_us: i64,
    ) -> Option<TrackedHealth> {
        let entries: Vec<_> = self
            .entries
            .iter()
            .filter(|e| e.key.contract_id == contract_id)
            .collect();
        if entries.is_empty() {
            return None;
        }

        let market_open = MarketSession::UsExtended.contains(Utc::now());
        let threshold_us = staleness.as_micros() as i64;
        let streams: Vec<_> = entries
            .iter()
            .map(|entry| self.stream_status(entry, now_us))
            .collect();

        let flowing = streams
            .iter()
            .any(|s| s.age_us.is_some_and(|age| age <= threshold_us));
        let status = if flowing {
            "streaming"
        } else if !market_open {
            "idle_market_closed"
        } else {
            "stale"
        };

        Some(TrackedHealth {
            contract_id,
            status,
            market_open,
            streams,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{TickFields, UpstreamTimestamp};
    use crate::models::now_us;
    use crate::storage::{PartitionIndex, StorageFormat, TickStore};
    use crate::upstream::sim::SimGateway;
    use crate::upstream::{Gateway, GatewayEvent};
    use tokio::sync::{mpsc, watch};

    async fn rig(
        tracked: &[TrackedContract],
    ) -> (
        Arc<BackgroundTracker>,
        Arc<Multiplexer>,
        Arc<SimGateway>,
        tempfile::TempDir,
        watch::Sender<bool>,
    ) {
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
        let mux = Multiplexer::new(sim.clone(), store, 64, 16);
        let pump = mux.clone();
        tokio::spawn(async move {
            while let Some(event) = events_rx.recv().await {
                if let GatewayEvent::Tick {
                    request_id,
                    tick_type_label,
                    fields,
                } = event
                {
                    pump.on_upstream_tick(request_id, tick_type_label, fields);
                }
            }
        });

        let tracker = BackgroundTracker::new(mux.clone(), tracked);
        (tracker, mux, sim, dir, shutdown_tx)
    }

    fn tracked(contract_id: i32) -> TrackedContract {
        TrackedContract {
            contract_id,
            symbol_label: "ES".to_string(),
            tick_types: vec![TickType::Last],
            buffer_hours: 2,
        }
    }

    #[tokio::test]
    async fn opens_configured_streams_as_background() {
        let (tracker, mux, sim, _dir, _sd) = rig(&[tracked(100)]).await;
        tracker.ensure_started().await;

        let key = StreamKey::new(100, TickType::Last);
        assert!(mux.stream_info(key).unwrap().is_background);
        assert_eq!(sim.active_requests().len(), 1);

        // Idempotent.
        tracker.ensure_started().await;
        assert_eq!(sim.active_requests().len(), 1);
    }

    #[tokio::test]
    async fn staleness_reflects_tick_flow() {
        let (tracker, _mux, sim, _dir, _sd) = rig(&[tracked(100)]).await;
        tracker.ensure_started().await;
        let key = StreamKey::new(100, TickType::Last);
        let threshold = Duration::from_secs(60);

        // No tick yet: stale, unknown age.
        let stale = tracker.stale_streams(threshold, now_us());
        assert_eq!(stale, vec![(key, None)]);
        assert!(!tracker.data_flowing(threshold, now_us()));

        let ts = now_us();
        sim.emit_for(
            key,
            "last",
            TickFields {
                event_ts: Some(UpstreamTimestamp::Micros(ts)),
                price: Some(1.0),
                size: Some(1.0),
                ..Default::default()
            },
        )
        .await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(tracker.data_flowing(threshold, now_us()));
        assert!(tracker.stale_streams(threshold, now_us()).is_empty());

        // Ticks older than the threshold are stale again.
        assert!(!tracker.data_flowing(threshold, ts + threshold.as_micros() as i64 + 1));
    }

    #[tokio::test]
    async fn empty_tracker_reports_data_flowing() {
        let (tracker, _mux, _sim, _dir, _sd) = rig(&[]).await;
        assert!(tracker.data_flowing(Duration::from_secs(60), now_us()));
        assert!(tracker.is_empty());
    }

    #[tokio::test]
    async fn health_classification_includes_market_context() {
        let (tracker, _mux, _sim, _dir, _sd) = rig(&[tracked(100)]).await;
        tracker.ensure_started().await;

        let health = tracker
            .health_for(100, Duration::from_secs(60), now_us())
            .unwrap();
        assert_eq!(health.contract_id, 100);
        assert!(matches!(health.status, "stale" | "idle_market_closed"));
        assert!(tracker.health_for(999, Duration::from_secs(60), now_us()).is_none());
    }
}
