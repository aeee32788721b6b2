//! Connection supervisor.
//!
//! Owns the upstream session end to end: the reconnect loop over the
//! configured port candidates, the gateway event dispatcher, and the health
//! monitor with its escalating recovery ladder. Socket liveness and data
//! flow are judged independently, which is what catches the zombie session
//! (transport up, seat lost, no data).

pub mod tasks;

use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;
use std::time::Instant;

use arc_swap::ArcSwap;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{mpsc, watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::background::BackgroundTracker;
use crate::config::Config;
use crate::models::now_us;
use crate::stream::Multiplexer;
use crate::supervisor::tasks::{spawn_supervised, Worker};
use crate::upstream::{Gateway, GatewayEvent};

/// Upstream session lifecycle. Transitions here are the only trigger for
/// tearing down or rebuilding the multiplexer's streams.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Disconnected,
    Connecting,
    Handshaking,
    Ready,
    /// Socket up, no data flowing: the zombie session.
    Degraded,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Handshaking => "handshaking",
            Self::Ready => "ready",
            Self::Degraded => "degraded",
        };
        f.write_str(s)
    }
}

/// Why a transition happened; logged with every state change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionReason {
    Startup,
    ConnectAttempt,
    ConnectFailed,
    HandshakeOk,
    TransportLost,
    DataStale,
    DataRestored,
    SessionReset,
    Shutdown,
}

impl std::fmt::Display for TransitionReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Startup => "startup",
            Self::ConnectAttempt => "connect_attempt",
            Self::ConnectFailed => "connect_failed",
            Self::HandshakeOk => "handshake_ok",
            Self::TransportLost => "transport_lost",
            Self::DataStale => "data_stale",
            Self::DataRestored => "data_restored",
            Self::SessionReset => "session_reset",
            Self::Shutdown => "shutdown",
        };
        f.write_str(s)
    }
}

/// Snapshot served on the health surface. Swapped atomically each monitor
/// cycle so readers never take the supervisor's locks.
#[derive(Debug, Clone, Serialize)]
pub struct HealthView {
    pub session_state: SessionState,
    pub socket_connected: bool,
    pub data_flowing: bool,
    /// 0 when healthy; otherwise the highest ladder level reached.
    pub escalation_level: u8,
    pub critical: bool,
    pub client_id: i32,
}

impl HealthView {
    pub fn status_label(&self) -> &'static str {
        if self.critical {
            "critical"
        } else if self.socket_connected && self.data_flowing {
            "healthy"
        } else if self.socket_connected {
            "degraded"
        } else {
            "disconnected"
        }
    }
}

#[derive(Default)]
struct LadderState {
    unhealthy_since: Option<Instant>,
    last_stream_restart: Option<Instant>,
    last_session_reset: Option<Instant>,
    critical_raised: bool,
}

pub struct SessionSupervisor {
    gateway: Arc<dyn Gateway>,
    mux: Arc<Multiplexer>,
    tracker: Arc<BackgroundTracker>,
    config: Arc<Config>,
    state: Mutex<SessionState>,
    ladder: Mutex<LadderState>,
    health: ArcSwap<HealthView>,
    client_id: AtomicI32,
    reconnect_now: Notify,
}

impl SessionSupervisor {
    pub fn new(
        gateway: Arc<dyn Gateway>,
        mux: Arc<Multiplexer>,
        tracker: Arc<BackgroundTracker>,
        config: Arc<Config>,
    ) -> Arc<Self> {
        let initial = HealthView {
            session_state: SessionState::Disconnected,
            socket_connected: false,
            data_flowing: false,
            escalation_level: 0,
            critical: false,
            client_id: config.client_id,
        };
        Arc::new(Self {
            gateway,
            mux,
            tracker,
            client_id: AtomicI32::new(initial.client_id),
            config,
            state: Mutex::new(SessionState::Disconnected),
            ladder: Mutex::new(LadderState::default()),
            health: ArcSwap::from_pointee(initial),
            reconnect_now: Notify::new(),
        })
    }

    /// Launch the supervisor's workers: the gateway event dispatcher, the
    /// session maintainer, and the health monitor. All supervised.
    pub fn start(
        self: &Arc<Self>,
        events: mpsc::Receiver<GatewayEvent>,
        shutdown: watch::Receiver<bool>,
    ) -> Vec<JoinHandle<()>> {
        let dispatcher = Arc::new(tokio::sync::Mutex::new(DispatcherWorker {
            supervisor: self.clone(),
            events,
        }));
        let maintainer = Arc::new(tokio::sync::Mutex::new(MaintainerWorker {
            supervisor: self.clone(),
        }));
        let monitor = Arc::new(tokio::sync::Mutex::new(MonitorWorker {
            supervisor: self.clone(),
        }));
        vec![
            spawn_supervised("gateway-dispatcher", shutdown.clone(), dispatcher),
            spawn_supervised("session-maintainer", shutdown.clone(), maintainer),
            spawn_supervised("health-monitor", shutdown, monitor),
        ]
    }

    pub fn health(&self) -> HealthView {
        self.health.load().as_ref().clone()
    }

    pub fn session_state(&self) -> SessionState {
        *self.state.lock()
    }

    fn transition(&self, next: SessionState, reason: TransitionReason) {
        let previous = {
            let mut state = self.state.lock();
            let previous = *state;
            *state = next;
            previous
        };
        if previous != next {
            info!(from = %previous, to = %next, reason = %reason, "session transition");
        }
    }

    fn handle_event(&self, event: GatewayEvent) -> Option<GatewayEvent> {
        match event {
            GatewayEvent::Tick {
                request_id,
                tick_type_label,
                fields,
            } => {
                self.mux.on_upstream_tick(request_id, tick_type_label, fields);
                None
            }
            GatewayEvent::Connected { client_id, .. } => {
                debug!(client_id, "gateway session confirmed");
                self.transition(SessionState::Ready, TransitionReason::HandshakeOk);
                None
            }
            GatewayEvent::Disconnected { reason } => {
                warn!(reason = %reason, "gateway transport lost");
                self.transition(SessionState::Disconnected, TransitionReason::TransportLost);
                self.mux.suspend_all();
                self.reconnect_now.notify_one();
                None
            }
            event @ GatewayEvent::Error { .. } => Some(event),
        }
    }

    /// One sweep over the configured port candidates, with per-port retry.
    /// Returns true once a session is established.
    async fn reconnect_sweep(&self, shutdown: &watch::Receiver<bool>) -> bool {
        self.transition(SessionState::Connecting, TransitionReason::ConnectAttempt);
        for port in &self.config.ports {
            for attempt in 0..self.config.reconnect_attempts.max(1) {
                if *shutdown.borrow() {
                    return false;
                }
                let client_id = self.client_id.load(Ordering::Acquire);
                self.transition(SessionState::Handshaking, TransitionReason::ConnectAttempt);
                match self
                    .gateway
                    .connect(&self.config.host, *port, client_id)
                    .await
                {
                    Ok(()) => {
                        self.transition(SessionState::Ready, TransitionReason::HandshakeOk);
                        info!(port, client_id, "session established, rebuilding streams");
                        self.mux.resume_all().await;
                        self.tracker.ensure_started().await;
                        return true;
                    }
                    Err(e) => {
                        warn!(
                            host = %self.config.host,
                            port,
                            attempt,
                            error = %e,
                            "connect attempt failed"
                        );
                        self.transition(
                            SessionState::Disconnected,
                            TransitionReason::ConnectFailed,
                        );
                        tokio::time::sleep(self.config.reconnect_interval).await;
                    }
                }
            }
        }
        false
    }

    /// Level-3 action: drop the session and come back with a fresh client
    /// id, in case the old one's seat is wedged on the gateway side.
    async fn session_reset(&self) {
        let next_id = self.client_id.fetch_add(1, Ordering::AcqRel) + 1;
        warn!(next_client_id = next_id, "forcing full session reset");
        self.transition(SessionState::Disconnected, TransitionReason::SessionReset);
        self.mux.suspend_all();
        self.gateway.disconnect().await;
        self.reconnect_now.notify_one();
    }

    /// One health-monitor cycle: evaluate both signals, walk the ladder.
    async fn evaluate_health(&self) {
        let socket_connected = self.gateway.is_connected();
        let data_flowing = self
            .tracker
            .data_flowing(self.config.data_staleness_threshold, now_us());
        let healthy = socket_connected && data_flowing;

        let mut escalation_level = 0u8;
        let mut critical = false;

        if healthy {
            let mut ladder = self.ladder.lock();
            if ladder.unhealthy_since.is_some() {
                info!("session healthy again, resetting recovery ladder");
            }
            *ladder = LadderState::default();
            if self.session_state() == SessionState::Degraded {
                self.transition(SessionState::Ready, TransitionReason::DataRestored);
            }
        } else {
            if socket_connected {
                self.transition(SessionState::Degraded, TransitionReason::DataStale);
            }

            let (elapsed, do_restart, do_reset, raise_critical) = {
                let mut ladder = self.ladder.lock();
                let since = *ladder.unhealthy_since.get_or_insert_with(Instant::now);
                let elapsed = since.elapsed();

                let do_restart = elapsed >= self.config.stream_restart_threshold
                    && ladder
                        .last_stream_restart
                        .map_or(true, |t| t.elapsed() >= self.config.stream_restart_threshold);
                if do_restart {
                    ladder.last_stream_restart = Some(Instant::now());
                }

                let do_reset = elapsed >= self.config.connection_reset_threshold
                    && ladder
                        .last_session_reset
                        .map_or(true, |t| t.elapsed() >= self.config.connection_reset_threshold);
                if do_reset {
                    ladder.last_session_reset = Some(Instant::now());
                }

                let raise_critical =
                    elapsed >= self.config.critical_alert_threshold && !ladder.critical_raised;
                if raise_critical {
                    ladder.critical_raised = true;
                }
                critical = ladder.critical_raised;
                (elapsed, do_restart, do_reset, raise_critical)
            };

            // Level 1: name every stale stream.
            if elapsed >= self.config.data_staleness_threshold {
                escalation_level = 1;
                for (key, age_us) in self
                    .tracker
                    .stale_streams(self.config.data_staleness_threshold, now_us())
                {
                    match age_us {
                        Some(age) => warn!(stream = %key, age_secs = age / 1_000_000, "stream is stale"),
                        None => warn!(stream = %key, "stream has produced no data"),
                    }
                }
            }

            // Level 2: bounce the affected stream workers.
            if elapsed >= self.config.stream_restart_threshold {
                escalation_level = 2;
                if do_restart && socket_connected {
                    for (key, _) in self
                        .tracker
                        .stale_streams(self.config.data_staleness_threshold, now_us())
                    {
                        self.mux.restart_stream(key).await;
                    }
                }
            }

            // Level 3: full session reset with a fresh client id.
            if elapsed >= self.config.connection_reset_threshold {
                escalation_level = 3;
                if do_reset {
                    self.session_reset().await;
                }
            }

            // Level 4: alert, tell subscribers recovery is not coming soon,
            // keep trying at the level-3 cadence.
            if elapsed >= self.config.critical_alert_threshold {
                escalation_level = 4;
                if raise_critical {
                    error!(
                        elapsed_secs = elapsed.as_secs(),
                        "critical: auto-recovery unable to resolve upstream data flow"
                    );
                    self.mux
                        .fail_all_subscribers("upstream session could not be recovered");
                }
            }
        }

        self.health.store(Arc::new(HealthView {
            session_state: self.session_state(),
            socket_connected,
            data_flowing,
            escalation_level,
            critical,
            client_id: self.client_id.load(Ordering::Acquire),
        }));
    }

    /// Drain order on shutdown: subscribers first, then writers (handled by
    /// the caller), then the upstream session.
    pub async fn shutdown_session(&self) {
        self.transition(SessionState::Disconnected, TransitionReason::Shutdown);
        self.gateway.disconnect().await;
    }
}

struct DispatcherWorker {
    supervisor: Arc<SessionSupervisor>,
    events: mpsc::Receiver<GatewayEvent>,
}

#[async_trait]
impl Worker for DispatcherWorker {
    async fn run(&mut self, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        loop {
            tokio::select! {
                event = self.events.recv() => match event {
                    Some(event) => {
                        if let Some(GatewayEvent::Error { request_id, code, message }) =
                            self.supervisor.handle_event(event)
                        {
                            match request_id {
                                Some(id) => {
                                    self.supervisor.mux.on_upstream_error(id, code, &message).await;
                                }
                                None => warn!(code, message = %message, "gateway message"),
                            }
                        }
                    }
                    None => return Ok(()),
                },
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return Ok(());
                    }
                }
            }
        }
    }
}

struct MaintainerWorker {
    supervisor: Arc<SessionSupervisor>,
}

#[async_trait]
impl Worker for MaintainerWorker {
    async fn run(&mut self, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        loop {
            if *shutdown.borrow() {
                return Ok(());
            }
            if !self.supervisor.gateway.is_connected() {
                let connected = self.supervisor.reconnect_sweep(&shutdown).await;
                if !connected && !*shutdown.borrow() {
                    tokio::time::sleep(self.supervisor.config.reconnect_interval).await;
                    continue;
                }
            }
            tokio::select! {
                _ = self.supervisor.reconnect_now.notified() => {}
                _ = tokio::time::sleep(self.supervisor.config.reconnect_interval) => {}
                _ = shutdown.changed() => {}
            }
        }
    }
}

struct MonitorWorker {
    supervisor: Arc<SessionSupervisor>,
}

#[async_trait]
impl Worker for MonitorWorker {
    async fn run(&mut self, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        let mut ticker = tokio::time::interval(self.supervisor.config.monitor_period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => self.supervisor.evaluate_health().await,
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return Ok(());
                    }
                }
            }
        }
    }
}
