//! Service error types.
//!
//! Each variant maps to a propagation rule: subscriber-facing errors are
//! serialized into `error` envelope messages and close the subscription,
//! storage errors are logged and retried without ever reaching subscribers,
//! and upstream loss is handled by the connection supervisor.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("unknown tick type: {0}")]
    UnknownTickType(String),

    #[error("invalid contract id: {0}")]
    InvalidContract(String),

    #[error("invalid time range: {0}")]
    InvalidRange(String),

    #[error("upstream disconnected: {0}")]
    UpstreamDisconnected(String),

    #[error("storage write failed: {0}")]
    StorageWriteFailed(#[from] std::io::Error),

    #[error("subscriber cannot keep up with the stream")]
    SlowConsumer,

    #[error("rate limit exceeded: {0}")]
    RateLimitExceeded(String),

    #[error("stream capacity exhausted ({0} active)")]
    StreamLimitReached(usize),

    #[error("subscription closed")]
    SubscriptionClosed,
}

impl ServiceError {
    /// Machine-readable code used in `error` messages on the wire.
    pub fn code(&self) -> &'static str {
        match self {
            Self::UnknownTickType(_) => "unknown_tick_type",
            Self::InvalidContract(_) => "invalid_contract",
            Self::InvalidRange(_) => "invalid_range",
            Self::UpstreamDisconnected(_) => "upstream_disconnected",
            Self::StorageWriteFailed(_) => "storage_write_failed",
            Self::SlowConsumer => "slow_consumer",
            Self::RateLimitExceeded(_) => "rate_limit_exceeded",
            Self::StreamLimitReached(_) => "stream_limit_reached",
            Self::SubscriptionClosed => "subscription_closed",
        }
    }

    /// Whether the supervisor may still recover the condition. Sent to
    /// subscribers so clients know when a reconnect is worthwhile.
    pub fn recoverable(&self) -> bool {
        matches!(self, Self::UpstreamDisconnected(_))
    }
}

/// Errors raised by the upstream gateway adapter.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("gateway not connected")]
    NotConnected,

    #[error("handshake failed: {0}")]
    Handshake(String),

    #[error("gateway io: {0}")]
    Io(#[from] std::io::Error),

    #[error("gateway rejected request {request_id}: {code} {message}")]
    Rejected {
        request_id: i32,
        code: i32,
        message: String,
    },
}
