//! HTTP middleware: request logging and per-IP limits.

pub mod limits;
pub mod logging;

pub use limits::{ConnectionGuard, ConnectionLimits, RateLimitConfig, RateLimitLayer};
pub use logging::request_logging;
