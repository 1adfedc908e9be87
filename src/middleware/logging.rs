//! Structured request logging: one span per request carrying method, path,
//! client IP, status, and latency, skipping the health-check endpoint to
//! keep the liveness probe from drowning out real traffic in the logs.

use axum::{
    body::Body,
    extract::ConnectInfo,
    http::Request,
    middleware::Next,
    response::Response,
};
use std::net::SocketAddr;
use std::time::Instant;
use tracing::{info, warn, Span};

const SKIP_PATHS: &[&str] = &["/health"];

pub async fn request_logging(
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let method = request.method().clone();
    let path = request.uri().path().to_string();

    if SKIP_PATHS.contains(&path.as_str()) {
        return next.run(request).await;
    }

    let start = Instant::now();
    let span = tracing::info_span!(
        "http_request",
        method = %method,
        path = %path,
        client_ip = %addr.ip(),
        status = tracing::field::Empty,
        latency_ms = tracing::field::Empty,
    );
    let _guard = span.enter();

    let response = next.run(request).await;

    let latency_ms = start.elapsed().as_millis() as u64;
    let status = response.status().as_u16();
    Span::current().record("status", status);
    Span::current().record("latency_ms", latency_ms);

    if status >= 500 {
        warn!(method = %method, path = %path, status, latency_ms, client_ip = %addr.ip(), "request failed");
    } else {
        info!(method = %method, path = %path, status, latency_ms, "request completed");
    }

    response
}
