//! Tick streaming backend library.
//!
//! Ingests tick-by-tick market data from a TWS/IB Gateway session and
//! redistributes it to SSE and WebSocket subscribers while persisting every
//! record to hourly-partitioned JSON-Lines and binary files. New
//! subscribers can replay a recent buffer window before going live.

pub mod api;
pub mod background;
pub mod codec;
pub mod config;
pub mod error;
pub mod middleware;
pub mod models;
pub mod storage;
pub mod stream;
pub mod supervisor;
pub mod upstream;

pub use api::AppState;
pub use config::Config;
pub use error::{GatewayError, ServiceError};
pub use models::{StreamKey, TickRecord, TickType};
