//! Upstream gateway interface.
//!
//! Everything above this module deals with the trait, never with the wire:
//! the supervisor drives connection lifecycle, the multiplexer issues and
//! cancels tick subscriptions, and tests substitute a scripted in-process
//! gateway. The TWS socket adapter lives in [`tws`]; it is the only code in
//! the service that knows the gateway framing.

pub mod sim;
pub mod tws;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::codec::TickFields;
use crate::error::GatewayError;
use crate::models::TickType;

/// Events emitted by a gateway adapter. Delivered on a single channel so
/// ordering between connection state and data is preserved.
#[derive(Debug, Clone)]
pub enum GatewayEvent {
    /// Handshake completed; the session is usable.
    Connected { server_version: i32, client_id: i32 },
    /// The transport dropped or the gateway closed the session.
    Disconnected { reason: String },
    /// One tick-by-tick callback for an active request.
    Tick {
        request_id: i32,
        tick_type_label: &'static str,
        fields: TickFields,
    },
    /// Gateway-reported error, possibly scoped to one request.
    Error {
        request_id: Option<i32>,
        code: i32,
        message: String,
    },
}

/// Channel used by gateway adapters to publish events.
pub type GatewayEventSender = mpsc::Sender<GatewayEvent>;

/// The upstream session as the rest of the service sees it.
///
/// Implementations serialize their own I/O internally; callers may invoke
/// methods from any task. `is_connected` must reflect transport liveness
/// only, not data flow; the supervisor combines it with stream staleness to
/// classify health.
#[async_trait]
pub trait Gateway: Send + Sync {
    /// Establish a session. Replaces any existing one.
    async fn connect(&self, host: &str, port: u16, client_id: i32) -> Result<(), GatewayError>;

    /// Tear the session down. Idempotent.
    async fn disconnect(&self);

    /// Transport-level liveness: socket up and handshake token received.
    fn is_connected(&self) -> bool;

    /// Open a tick-by-tick subscription under the given request id.
    async fn request_ticks(
        &self,
        request_id: i32,
        contract_id: i32,
        tick_type: TickType,
    ) -> Result<(), GatewayError>;

    /// Cancel a previously opened subscription.
    async fn cancel_ticks(&self, request_id: i32) -> Result<(), GatewayError>;
}

/// Upstream label for a canonical tick type, as used in tick-by-tick
/// requests.
pub fn tick_type_request_label(tick_type: TickType) -> &'static str {
    match tick_type {
        TickType::Last => "Last",
        TickType::AllLast => "AllLast",
        TickType::BidAsk => "BidAsk",
        TickType::MidPoint => "MidPoint",
    }
}
