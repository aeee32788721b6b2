//! Scripted in-process gateway.
//!
//! Stands in for a live TWS/IB Gateway in tests and local development:
//! connection attempts, request bookkeeping, and tick emission are all
//! driven programmatically. Behaves like the real adapter at the trait
//! boundary, including connect failures and silent (zombie) sessions.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::codec::TickFields;
use crate::error::GatewayError;
use crate::models::{StreamKey, TickType};
use crate::upstream::{Gateway, GatewayEvent, GatewayEventSender};

#[derive(Default)]
struct SimState {
    /// request_id -> stream key for active subscriptions.
    active: HashMap<i32, StreamKey>,
    /// Client ids seen across all successful connects, in order.
    client_ids: Vec<i32>,
    /// Fail this many upcoming connect attempts.
    fail_connects: u32,
    cancelled: Vec<i32>,
}

pub struct SimGateway {
    events: GatewayEventSender,
    state: Mutex<SimState>,
    connected: AtomicBool,
}

impl SimGateway {
    pub fn new(events: GatewayEventSender) -> Arc<Self> {
        Arc::new(Self {
            events,
            state: Mutex::new(SimState::default()),
            connected: AtomicBool::new(false),
        })
    }

    /// Active `(request_id, key)` pairs.
    pub fn active_requests(&self) -> Vec<(i32, StreamKey)> {
        self.state
            .lock()
            .active
            .iter()
            .map(|(id, key)| (*id, *key))
            .collect()
    }

    /// The live request id for a stream, if one is open.
    pub fn request_for(&self, key: StreamKey) -> Option<i32> {
        self.state
            .lock()
            .active
            .iter()
            .find(|(_, k)| **k == key)
            .map(|(id, _)| *id)
    }

    pub fn client_ids(&self) -> Vec<i32> {
        self.state.lock().client_ids.clone()
    }

    pub fn connect_count(&self) -> usize {
        self.state.lock().client_ids.len()
    }

    pub fn cancelled_requests(&self) -> Vec<i32> {
        self.state.lock().cancelled.clone()
    }

    /// Make the next `n` connect attempts fail.
    pub fn fail_next_connects(&self, n: u32) {
        self.state.lock().fail_connects = n;
    }

    /// Emit one tick on an explicit request id.
    pub async fn emit(&self, request_id: i32, tick_type_label: &'static str, fields: TickFields) {
        let _ = self
            .events
            .send(GatewayEvent::Tick {
                request_id,
                tick_type_label,
                fields,
            })
            .await;
    }

    /// Emit one tick routed through the active subscription for `key`.
    /// Returns false when no subscription is open for the key.
    pub async fn emit_for(
        &self,
        key: StreamKey,
        tick_type_label: &'static str,
        fields: TickFields,
    ) -> bool {
        let Some(request_id) = self.request_for(key) else {
            return false;
        };
        self.emit(request_id, tick_type_label, fields).await;
        true
    }

    /// Emit a gateway-scoped error message.
    pub async fn emit_error(&self, request_id: Option<i32>, code: i32, message: &str) {
        let _ = self
            .events
            .send(GatewayEvent::Error {
                request_id,
                code,
                message: message.to_string(),
            })
            .await;
    }

    /// Drop the transport: subscriptions are gone, an event is emitted. The
    /// session stays down until the next `connect`.
    pub async fn drop_connection(&self, reason: &str) {
        self.connected.store(false, Ordering::SeqCst);
        self.state.lock().active.clear();
        let _ = self
            .events
            .send(GatewayEvent::Disconnected {
                reason: reason.to_string(),
            })
            .await;
    }

}

#[async_trait]
impl Gateway for SimGateway {
    async fn connect(&self, _host: &str, _port: u16, client_id: i32) -> Result<(), GatewayError> {
        {
            let mut state = self.state.lock();
            if state.fail_connects > 0 {
                state.fail_connects -= 1;
                return Err(GatewayError::Handshake("scripted connect failure".into()));
            }
            state.client_ids.push(client_id);
            state.active.clear();
        }
        self.connected.store(true, Ordering::SeqCst);
        let _ = self
            .events
            .send(GatewayEvent::Connected {
                server_version: MAX_SIM_SERVER_VERSION,
                client_id,
            })
            .await;
        Ok(())
    }

    async fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
        self.state.lock().active.clear();
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn request_ticks(
        &self,
        request_id: i32,
        contract_id: i32,
        tick_type: TickType,
    ) -> Result<(), GatewayError> {
        if !self.is_connected() {
            return Err(GatewayError::NotConnected);
        }
        self.state
            .lock()
            .active
            .insert(request_id, StreamKey::new(contract_id, tick_type));
        Ok(())
    }

    async fn cancel_ticks(&self, request_id: i32) -> Result<(), GatewayError> {
        let mut state = self.state.lock();
        state.active.remove(&request_id);
        state.cancelled.push(request_id);
        Ok(())
    }
}

const MAX_SIM_SERVER_VERSION: i32 = 187;

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn tracks_subscriptions_and_connects() {
        let (tx, mut rx) = mpsc::channel(16);
        let sim = SimGateway::new(tx);

        sim.connect("localhost", 4001, 10).await.unwrap();
        assert!(sim.is_connected());
        assert!(matches!(
            rx.recv().await,
            Some(GatewayEvent::Connected { client_id: 10, .. })
        ));

        let key = StreamKey::new(1, TickType::Last);
        sim.request_ticks(77, 1, TickType::Last).await.unwrap();
        assert_eq!(sim.request_for(key), Some(77));

        assert!(sim.emit_for(key, "last", TickFields::default()).await);
        assert!(matches!(
            rx.recv().await,
            Some(GatewayEvent::Tick { request_id: 77, .. })
        ));

        sim.cancel_ticks(77).await.unwrap();
        assert_eq!(sim.request_for(key), None);
        assert_eq!(sim.cancelled_requests(), vec![77]);
    }

    #[tokio::test]
    async fn scripted_connect_failures() {
        let (tx, _rx) = mpsc::channel(16);
        let sim = SimGateway::new(tx);
        sim.fail_next_connects(2);

        assert!(sim.connect("h", 1, 5).await.is_err());
        assert!(sim.connect("h", 1, 6).await.is_err());
        assert!(sim.connect("h", 1, 7).await.is_ok());
        assert_eq!(sim.client_ids(), vec![7]);
    }

    #[tokio::test]
    async fn dropped_connection_clears_subscriptions() {
        let (tx, mut rx) = mpsc::channel(16);
        let sim = SimGateway::new(tx);
        sim.connect("h", 1, 5).await.unwrap();
        let _ = rx.recv().await;

        sim.request_ticks(9, 2, TickType::BidAsk).await.unwrap();
        sim.drop_connection("test").await;
        assert!(!sim.is_connected());
        assert!(sim.active_requests().is_empty());
        assert!(matches!(
            rx.recv().await,
            Some(GatewayEvent::Disconnected { .. })
        ));
    }
}
