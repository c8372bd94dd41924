//! Per-IP request rate limiting
//!
//! Fixed-window counting keyed by source address. Over-limit callers get a
//! structured 429 body; everything else passes through untouched.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use axum::extract::connect_info::ConnectInfo;
use axum::extract::{Request, State};
use axum::http::StatusCode;
use axum::middleware::Next;
use axum::response::{IntoResponse, Json, Response};
use dashmap::DashMap;
use serde_json::json;
use tracing::warn;

/// Fixed-window per-IP request limiter
///
/// Windows for sources that stop calling are swept out, so the map stays
/// bounded by the set of addresses active within the last window.
pub struct RateLimiter {
    limit: u32,
    window: Duration,
    windows: DashMap<IpAddr, (Instant, u32)>,
    last_sweep: Mutex<Instant>,
}

impl RateLimiter {
    /// `limit` requests per `window` per source IP
    pub fn new(limit: u32, window: Duration) -> Self {
        Self {
            limit,
            window,
            windows: DashMap::new(),
            last_sweep: Mutex::new(Instant::now()),
        }
    }

    /// Record one request from `ip`; false means over the limit
    pub fn check(&self, ip: IpAddr) -> bool {
        let now = Instant::now();
        self.sweep(now);
        let mut entry = self.windows.entry(ip).or_insert((now, 0));
        let (started, count) = *entry;

        if now.duration_since(started) >= self.window {
            *entry = (now, 1);
            return true;
        }
        if count >= self.limit {
            return false;
        }
        *entry = (started, count + 1);
        true
    }

    /// Drop fully expired windows. Runs at most once per window length so
    /// the sweep cost stays off the per-request path.
    fn sweep(&self, now: Instant) {
        let Ok(mut last) = self.last_sweep.lock() else {
            return;
        };
        if now.duration_since(*last) < self.window {
            return;
        }
        *last = now;
        drop(last);
        self.windows
            .retain(|_, (started, _)| now.duration_since(*started) < self.window);
    }
}

/// Axum middleware wrapping [`RateLimiter`]
pub async fn rate_limit(
    State(limiter): State<Arc<RateLimiter>>,
    request: Request,
    next: Next,
) -> Response {
    // Without connection info (e.g. in-process tests) all callers share one
    // bucket
    let ip = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(a)| a.ip())
        .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED));

    if !limiter.check(ip) {
        warn!(%ip, "Rate limit exceeded");
        return (
            StatusCode::TOO_MANY_REQUESTS,
            Json(json!({
                "status": "error",
                "message": "Too many requests. Please slow down."
            })),
        )
            .into_response();
    }

    next.run(request).await
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(last: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(10, 0, 0, last))
    }

    #[test]
    fn test_allows_up_to_limit() {
        let limiter = RateLimiter::new(3, Duration::from_secs(60));
        assert!(limiter.check(ip(1)));
        assert!(limiter.check(ip(1)));
        assert!(limiter.check(ip(1)));
        assert!(!limiter.check(ip(1)));
    }

    #[test]
    fn test_limits_are_per_ip() {
        let limiter = RateLimiter::new(1, Duration::from_secs(60));
        assert!(limiter.check(ip(1)));
        assert!(!limiter.check(ip(1)));
        assert!(limiter.check(ip(2)));
    }

    #[test]
    fn test_window_resets() {
        let limiter = RateLimiter::new(1, Duration::from_millis(20));
        assert!(limiter.check(ip(1)));
        assert!(!limiter.check(ip(1)));
        std::thread::sleep(Duration::from_millis(30));
        assert!(limiter.check(ip(1)));
    }

    #[test]
    fn test_idle_entries_are_swept() {
        let limiter = RateLimiter::new(5, Duration::from_millis(20));
        assert!(limiter.check(ip(1)));
        assert_eq!(limiter.windows.len(), 1);

        std::thread::sleep(Duration::from_millis(30));
        assert!(limiter.check(ip(2)));

        // The expired window for ip(1) is gone; only the active caller
        // remains tracked
        assert!(!limiter.windows.contains_key(&ip(1)));
        assert_eq!(limiter.windows.len(), 1);
    }

    #[tokio::test]
    async fn test_middleware_keys_on_connection_address() {
        use axum::body::Body;
        use axum::http::{Request as HttpRequest, StatusCode};
        use axum::middleware;
        use axum::routing::get;
        use axum::Router;
        use tower::util::ServiceExt;

        let limiter = Arc::new(RateLimiter::new(1, Duration::from_secs(60)));
        let app = Router::new()
            .route("/", get(|| async { "ok" }))
            .layer(middleware::from_fn_with_state(limiter, rate_limit));

        let request = |last: u8| {
            let mut req = HttpRequest::builder()
                .uri("/")
                .body(Body::empty())
                .unwrap();
            req.extensions_mut()
                .insert(ConnectInfo(SocketAddr::from(([10, 0, 0, last], 4000))));
            req
        };

        let ok = app.clone().oneshot(request(1)).await.unwrap();
        assert_eq!(ok.status(), StatusCode::OK);

        // Same source address is over its limit
        let limited = app.clone().oneshot(request(1)).await.unwrap();
        assert_eq!(limited.status(), StatusCode::TOO_MANY_REQUESTS);

        // A different source gets its own window
        let other = app.oneshot(request(2)).await.unwrap();
        assert_eq!(other.status(), StatusCode::OK);
    }
}
