//! Per-IP sliding-window rate limiting in front of the API.
//!
//! Each IP gets `max_requests` per `window`, plus a `burst` allowance above
//! that before requests are hard-rejected with `429`.

use axum::{
    body::Body,
    extract::{ConnectInfo, State},
    http::{Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::warn;

#[derive(Clone)]
pub struct RateLimitConfig {
    pub max_requests: u32,
    pub window: Duration,
    pub burst: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_requests: 100,
            window: Duration::from_secs(60),
            burst: 20,
        }
    }
}

struct Window {
    count: u32,
    started_at: Instant,
}

enum Verdict {
    Allowed,
    Exceeded { retry_after: Duration },
}

#[derive(Clone)]
pub struct RateLimitLayer {
    config: RateLimitConfig,
    windows: Arc<Mutex<HashMap<IpAddr, Window>>>,
}

impl RateLimitLayer {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            windows: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn admit(&self, ip: IpAddr) -> Verdict {
        let mut windows = self.windows.lock();
        let now = Instant::now();

        let window = windows.entry(ip).or_insert_with(|| Window {
            count: 0,
            started_at: now,
        });

        if now.duration_since(window.started_at) >= self.config.window {
            window.count = 0;
            window.started_at = now;
        }
        window.count += 1;

        let ceiling = self.config.max_requests + self.config.burst;
        if window.count > ceiling {
            Verdict::Exceeded {
                retry_after: (window.started_at + self.config.window).duration_since(now),
            }
        } else {
            Verdict::Allowed
        }
    }

    /// Drop windows that have been idle for two full periods. Intended to be
    /// called periodically from a background task so the map doesn't grow
    /// unbounded with one-off clients.
    pub fn cleanup(&self) {
        let mut windows = self.windows.lock();
        let now = Instant::now();
        let stale_after = self.config.window * 2;
        windows.retain(|_, w| now.duration_since(w.started_at) < stale_after);
    }
}

pub async fn rate_limit_middleware(
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    State(limiter): State<RateLimitLayer>,
    request: Request<Body>,
    next: Next,
) -> Response {
    match limiter.admit(addr.ip()) {
        Verdict::Allowed => next.run(request).await,
        Verdict::Exceeded { retry_after } => {
            warn!(ip = %addr.ip(), retry_after_secs = retry_after.as_secs(), "rate limit exceeded");
            (
                StatusCode::TOO_MANY_REQUESTS,
                [("Retry-After", retry_after.as_secs().to_string())],
                axum::Json(serde_json::json!({
                    "error": "rate_limit_exceeded",
                    "retry_after_seconds": retry_after.as_secs(),
                })),
            )
                .into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn localhost() -> IpAddr {
        "127.0.0.1".parse().unwrap()
    }

    #[test]
    fn allows_requests_within_limit() {
        let limiter = RateLimitLayer::new(RateLimitConfig {
            max_requests: 10,
            window: Duration::from_secs(60),
            burst: 5,
        });
        let ip = localhost();
        for _ in 0..15 {
            assert!(matches!(limiter.admit(ip), Verdict::Allowed));
        }
    }

    #[test]
    fn rejects_past_the_burst_ceiling() {
        let limiter = RateLimitLayer::new(RateLimitConfig {
            max_requests: 5,
            window: Duration::from_secs(60),
            burst: 3,
        });
        let ip = localhost();
        for _ in 0..8 {
            assert!(matches!(limiter.admit(ip), Verdict::Allowed));
        }
        assert!(matches!(limiter.admit(ip), Verdict::Exceeded { .. }));
    }

    #[test]
    fn cleanup_drops_stale_windows_only() {
        let limiter = RateLimitLayer::new(RateLimitConfig {
            max_requests: 5,
            window: Duration::from_millis(1),
            burst: 0,
        });
        limiter.admit(localhost());
        std::thread::sleep(Duration::from_millis(5));
        limiter.cleanup();
        assert!(limiter.windows.lock().is_empty());
    }
}
