use crate::error::AppError;
use crate::state::AppState;
use axum::extract::{Request, State};
use axum::http::HeaderMap;
use axum::middleware::Next;
use axum::response::Response;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Keys tracked before stale windows get swept out.
const MAX_TRACKED_KEYS: usize = 4096;

/// Fixed-window request counter, keyed by client IP.
///
/// Process-local on purpose: the deployment model is a single instance, and
/// windows reset lazily on the next access rather than on a timer.
pub struct FixedWindowLimiter {
    windows: DashMap<String, Window>,
    max_requests: u32,
    window: Duration,
}

struct Window {
    started: Instant,
    count: u32,
}

impl FixedWindowLimiter {
    pub fn new(max_requests: u32, window: Duration) -> Self {
        Self {
            windows: DashMap::new(),
            max_requests,
            window,
        }
    }

    pub fn check(&self, key: &str) -> bool {
        self.check_at(key, Instant::now())
    }

    /// Clock-injected variant so window arithmetic is testable.
    pub fn check_at(&self, key: &str, now: Instant) -> bool {
        if self.windows.len() >= MAX_TRACKED_KEYS {
            self.windows
                .retain(|_, w| now.duration_since(w.started) < self.window);
        }

        let mut entry = self.windows.entry(key.to_string()).or_insert(Window {
            started: now,
            count: 0,
        });
        if now.duration_since(entry.started) >= self.window {
            entry.started = now;
            entry.count = 0;
        }
        if entry.count >= self.max_requests {
            return false;
        }
        entry.count += 1;
        true
    }
}

pub async fn rate_limit_middleware(
    State(state): State<Arc<AppState>>,
    req: Request,
    next: Next,
) -> Result<Response, AppError> {
    let key = client_ip(req.headers());
    if !state.limiter.check(&key) {
        tracing::warn!(client = %key, "Rate limit exceeded");
        return Err(AppError::TooManyRequests("Too many requests".into()));
    }
    Ok(next.run(req).await)
}

fn client_ip(headers: &HeaderMap) -> String {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(|s| s.trim().to_string())
        .unwrap_or_else(|| "unknown".into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_above_limit_within_window() {
        let limiter = FixedWindowLimiter::new(3, Duration::from_secs(60));
        let t0 = Instant::now();

        for _ in 0..3 {
            assert!(limiter.check_at("1.2.3.4", t0));
        }
        assert!(!limiter.check_at("1.2.3.4", t0));

        // Other keys are unaffected.
        assert!(limiter.check_at("5.6.7.8", t0));
    }

    #[test]
    fn window_resets_after_expiry() {
        let limiter = FixedWindowLimiter::new(2, Duration::from_secs(60));
        let t0 = Instant::now();

        assert!(limiter.check_at("k", t0));
        assert!(limiter.check_at("k", t0));
        assert!(!limiter.check_at("k", t0 + Duration::from_secs(59)));
        assert!(limiter.check_at("k", t0 + Duration::from_secs(60)));
    }

    #[test]
    fn forwarded_for_takes_first_hop() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", "10.0.0.1, 172.16.0.1".parse().unwrap());
        assert_eq!(client_ip(&headers), "10.0.0.1");
        assert_eq!(client_ip(&HeaderMap::new()), "unknown");
    }
}
