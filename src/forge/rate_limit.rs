//! GitHub API rate-limit bookkeeping.
//!
//! Every API response carries `X-RateLimit-Remaining` / `X-RateLimit-Reset`.
//! The latest values are kept here so they can be exported as a gauge.  The
//! state is process-wide while GitHub counts per token, so it only describes
//! the most recent caller.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tracing::debug;

/// Shared rate-limit state, updated after every GitHub response.
#[derive(Debug, Clone)]
pub struct RateLimitState {
    remaining: Arc<AtomicU64>,
    reset_at: Arc<AtomicU64>,
}

impl Default for RateLimitState {
    fn default() -> Self {
        Self::new()
    }
}

impl RateLimitState {
    pub fn new() -> Self {
        Self {
            remaining: Arc::new(AtomicU64::new(u64::MAX)),
            reset_at: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Remaining calls in the current window; `u64::MAX` until first seen.
    pub fn remaining(&self) -> u64 {
        self.remaining.load(Ordering::Relaxed)
    }

    /// Unix timestamp at which the window resets.
    pub fn reset_at(&self) -> u64 {
        self.reset_at.load(Ordering::Relaxed)
    }

    /// Whether the last response said the window is used up.
    pub fn is_exhausted(&self) -> bool {
        self.remaining() == 0
    }

    /// Record the rate-limit headers of a response, if present.
    ///
    /// Returns the new remaining count when the response carried one.
    pub fn update_from_headers(&self, headers: &reqwest::header::HeaderMap) -> Option<u64> {
        let remaining = header_u64(headers, "X-RateLimit-Remaining");
        let reset = header_u64(headers, "X-RateLimit-Reset");

        if let Some(r) = reset {
            self.reset_at.store(r, Ordering::Relaxed);
        }
        if let Some(r) = remaining {
            self.remaining.store(r, Ordering::Relaxed);
            debug!(remaining = r, "GitHub rate limit updated");
        }
        remaining
    }
}

fn header_u64(headers: &reqwest::header::HeaderMap, name: &str) -> Option<u64> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
}
