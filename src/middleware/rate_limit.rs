//! Per-serial (device-facing) and per-IP (fallback) request throttling.

use axum::{
    extract::Request,
    http::{HeaderMap, StatusCode},
    middleware::Next,
    response::Response,
};
use dashmap::DashMap;
use once_cell::sync::Lazy;
use std::{
    sync::Arc,
    time::{Duration, Instant},
};

/// Token bucket rate limiter.
#[derive(Clone)]
pub struct TokenBucket {
    capacity: u32,
    tokens: f64,
    refill_rate: f64,
    last_refill: Instant,
}

impl TokenBucket {
    pub fn new(capacity: u32, refill_rate: f64) -> Self {
        Self {
            capacity,
            tokens: capacity as f64,
            refill_rate,
            last_refill: Instant::now(),
        }
    }

    pub fn try_consume(&mut self) -> bool {
        self.refill();
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        let new_tokens = elapsed * self.refill_rate;
        self.tokens = (self.tokens + new_tokens).min(self.capacity as f64);
        self.last_refill = now;
    }

    pub fn retry_after_secs(&self) -> u64 {
        if self.tokens >= 1.0 {
            0
        } else {
            let needed_tokens = 1.0 - self.tokens;
            (needed_tokens / self.refill_rate).ceil() as u64
        }
    }
}

/// Keyed bucket store, one instance per keying strategy (serial or IP).
#[derive(Clone)]
pub struct RateLimiter {
    buckets: Arc<DashMap<String, TokenBucket>>,
    capacity: u32,
    refill_rate: f64,
}

impl RateLimiter {
    pub fn new(capacity: u32, refill_rate: f64) -> Self {
        Self {
            buckets: Arc::new(DashMap::new()),
            capacity,
            refill_rate,
        }
    }

    pub fn check(&self, key: &str) -> Result<(), u64> {
        let mut bucket = self
            .buckets
            .entry(key.to_string())
            .or_insert_with(|| TokenBucket::new(self.capacity, self.refill_rate));

        if bucket.try_consume() {
            Ok(())
        } else {
            Err(bucket.retry_after_secs())
        }
    }

    /// Drop buckets untouched for `max_age`, run periodically so a long-lived
    /// process doesn't accumulate one entry per serial/IP ever seen.
    pub async fn cleanup_old_buckets(&self, max_age: Duration) {
        let now = Instant::now();
        self.buckets
            .retain(|_, bucket| now.duration_since(bucket.last_refill) < max_age);
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        let per_minute = std::env::var("RATE_LIMIT_DEVICE_PER_MINUTE")
            .ok()
            .and_then(|v| v.parse::<u32>().ok())
            .unwrap_or(120);
        let burst = std::env::var("RATE_LIMIT_DEVICE_BURST")
            .ok()
            .and_then(|v| v.parse::<u32>().ok())
            .unwrap_or(per_minute.max(10) / 10);
        let refill = per_minute as f64 / 60.0;
        Self::new(burst, refill)
    }
}

/// Per-serial request limiter for the device-facing port.
pub static SERIAL_RATE_LIMITER: Lazy<RateLimiter> = Lazy::new(RateLimiter::default);

/// Per-IP fallback for requests that never resolved a device serial (the
/// handler/extractor downstream still rejects these with 401; this limiter
/// just keeps an unauthenticated flood from burning CPU first).
pub static IP_RATE_LIMITER: Lazy<RateLimiter> = Lazy::new(RateLimiter::default);

fn extract_client_ip(headers: &HeaderMap) -> String {
    if let Some(xff) = headers.get("x-forwarded-for").and_then(|h| h.to_str().ok()) {
        if let Some(ip) = xff.split(',').next().map(|s| s.trim().to_string()) {
            if !ip.is_empty() {
                return ip;
            }
        }
    }
    if let Some(ip) = headers
        .get("cf-connecting-ip")
        .or_else(|| headers.get("x-real-ip"))
        .and_then(|h| h.to_str().ok())
    {
        return ip.to_string();
    }
    "unknown".to_string()
}

fn too_many_requests(retry_after: u64) -> Response {
    let mut resp = Response::new(axum::body::Body::empty());
    *resp.status_mut() = StatusCode::TOO_MANY_REQUESTS;
    resp.headers_mut().insert(
        axum::http::header::RETRY_AFTER,
        axum::http::HeaderValue::from_str(&retry_after.to_string())
            .unwrap_or(axum::http::HeaderValue::from_static("1")),
    );
    resp
}

/// Keys on the resolved device-identity header when present, else the
/// client IP. Applied to the device-facing router only.
pub async fn device_rate_limit_middleware(request: Request, next: Next) -> Result<Response, StatusCode> {
    let headers = request.headers();
    let serial = headers
        .get(crate::device_utils::DEVICE_IDENTITY_HEADER)
        .and_then(|v| v.to_str().ok())
        .and_then(|raw| raw.split('|').next())
        .filter(|s| !s.is_empty());

    let (limiter, key): (&RateLimiter, String) = match serial {
        Some(serial) => (&SERIAL_RATE_LIMITER, serial.to_string()),
        None => (&IP_RATE_LIMITER, extract_client_ip(headers)),
    };

    match limiter.check(&key) {
        Ok(()) => Ok(next.run(request).await),
        Err(retry_after) => {
            tracing::debug!(key, retry_after, "rate limit exceeded");
            Ok(too_many_requests(retry_after))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_bucket_exhausts_then_blocks() {
        let mut bucket = TokenBucket::new(10, 5.0);
        for _ in 0..10 {
            assert!(bucket.try_consume());
        }
        assert!(!bucket.try_consume());
    }

    #[tokio::test]
    async fn token_bucket_refills_over_time() {
        let mut bucket = TokenBucket::new(10, 10.0);
        for _ in 0..10 {
            bucket.try_consume();
        }
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(bucket.try_consume());
    }

    #[test]
    fn rate_limiter_tracks_buckets_independently() {
        let limiter = RateLimiter::new(5, 1.0);
        for _ in 0..5 {
            assert!(limiter.check("ABC123").is_ok());
        }
        assert!(limiter.check("ABC123").is_err());
        assert!(limiter.check("XYZ999").is_ok());
    }
}
