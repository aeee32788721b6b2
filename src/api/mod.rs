//! HTTP surface: health and query endpoints, the SSE adapter, and the
//! WebSocket adapter.

pub mod envelope;
pub mod routes;
pub mod sse;
pub mod ws;

use std::sync::Arc;

use axum::routing::get;
use axum::Router;
use tower_http::cors::CorsLayer;

use crate::background::BackgroundTracker;
use crate::config::Config;
use crate::middleware::limits::{rate_limit_middleware, RateLimitLayer};
use crate::middleware::{request_logging, ConnectionLimits};
use crate::storage::{BufferQuery, PartitionIndex, TickStore};
use crate::stream::Multiplexer;
use crate::supervisor::SessionSupervisor;

/// Everything the handlers need, constructed once at startup and cloned
/// into the router. No module-level globals anywhere.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub mux: Arc<Multiplexer>,
    pub store: TickStore,
    pub index: Arc<PartitionIndex>,
    pub query: Arc<BufferQuery>,
    pub supervisor: Arc<SessionSupervisor>,
    pub tracker: Arc<BackgroundTracker>,
    pub ws_limits: ConnectionLimits,
}

pub fn router(state: AppState, limiter: RateLimitLayer) -> Router {
    Router::new()
        .route("/health", get(routes::health))
        .route("/stream/:contract_id", get(sse::stream_multi))
        .route("/stream/:contract_id/with-buffer", get(sse::stream_with_buffer))
        .route("/stream/:contract_id/:tick_type", get(sse::stream_single))
        .route("/buffer/:contract_id/range", get(routes::buffer_range))
        .route("/buffer/:contract_id/info", get(routes::buffer_info))
        .route("/background/status", get(routes::background_status))
        .route("/background/health/:contract_id", get(routes::background_health))
        .route("/ws/stream", get(ws::ws_handler))
        .layer(axum::middleware::from_fn_with_state(
            limiter,
            rate_limit_middleware,
        ))
        .layer(axum::middleware::from_fn(request_logging))
        .layer(CorsLayer::permissive())
        .with_state(state)
}
