//! Fixed-window per-client rate limiting.
//!
//! Each client key gets a counter that resets when its window elapses. Windows
//! start at the client's first request, not on a global boundary.

use std::net::SocketAddr;
use std::time::Duration;

use axum::extract::ConnectInfo;
use axum::http::{HeaderMap, Request};
use dashmap::DashMap;
use tokio::time::Instant;

use super::config::RateLimitConfig;

/// Result of charging one request against a client's window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateDecision {
    pub allowed: bool,
    pub limit: u32,
    pub remaining: u32,
    /// Time until the client's window resets.
    pub reset_after: Duration,
}

#[derive(Debug, Clone, Copy)]
struct Window {
    started: Instant,
    count: u32,
}

/// Counts requests per client key in fixed windows.
#[derive(Debug)]
pub struct FixedWindowLimiter {
    config: RateLimitConfig,
    windows: DashMap<String, Window>,
}

impl FixedWindowLimiter {
    #[must_use]
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            windows: DashMap::new(),
        }
    }

    /// Charges one request to `key`.
    pub fn check(&self, key: &str) -> RateDecision {
        let now = Instant::now();
        let mut entry = self.windows.entry(key.to_string()).or_insert(Window {
            started: now,
            count: 0,
        });
        if now.duration_since(entry.started) >= self.config.window {
            *entry = Window {
                started: now,
                count: 0,
            };
        }

        let allowed = entry.count < self.config.max_requests;
        if allowed {
            entry.count += 1;
        }
        let reset_after = self
            .config
            .window
            .saturating_sub(now.duration_since(entry.started));

        RateDecision {
            allowed,
            limit: self.config.max_requests,
            remaining: self.config.max_requests.saturating_sub(entry.count),
            reset_after,
        }
    }

    /// Drops windows that have fully elapsed. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.windows.len();
        self.windows
            .retain(|_, w| now.duration_since(w.started) < self.config.window);
        before - self.windows.len()
    }

    #[must_use]
    pub fn tracked_clients(&self) -> usize {
        self.windows.len()
    }
}

/// Identifies the client for rate limiting: first `X-Forwarded-For` hop, then
/// the socket peer address, then a shared fallback bucket.
#[must_use]
pub fn client_key<B>(req: &Request<B>) -> String {
    if let Some(forwarded) = forwarded_for(req.headers()) {
        return forwarded;
    }
    req.extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map_or_else(|| "unknown".to_string(), |ConnectInfo(addr)| addr.ip().to_string())
}

fn forwarded_for(headers: &HeaderMap) -> Option<String> {
    let value = headers.get("x-forwarded-for")?.to_str().ok()?;
    let first = value.split(',').next()?.trim();
    (!first.is_empty()).then(|| first.to_string())
}
