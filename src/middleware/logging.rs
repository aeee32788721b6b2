//! Request logging middleware.
//!
//! One structured line per HTTP request with method, path, status, and
//! latency. Streaming endpoints are logged at accept time only; their
//! response lives as long as the subscriber.

use axum::{
    body::Body,
    extract::ConnectInfo,
    http::Request,
    middleware::Next,
    response::Response,
};
use std::net::SocketAddr;
use std::time::Instant;
use tracing::{info, warn};

pub async fn request_logging(
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let method = request.method().clone();
    let path = request.uri().path().to_string();

    // Health probes are noise at info level.
    if path == "/health" {
        return next.run(request).await;
    }

    let start = Instant::now();
    let response = next.run(request).await;
    let status = response.status().as_u16();
    let latency_ms = start.elapsed().as_millis() as u64;

    if status >= 500 {
        warn!(%method, %path, client_ip = %addr.ip(), status, latency_ms, "request failed");
    } else {
        info!(%method, %path, client_ip = %addr.ip(), status, latency_ms, "request");
    }
    response
}
