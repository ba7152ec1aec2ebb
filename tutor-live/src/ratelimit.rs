//! Fixed-window rate limiting keyed by `(principal, operation)`.
//!
//! Counters live in memory only. A window that has expired is reset before
//! the next increment; a rejected call still counts, so the counter sits
//! above the limit until the window rolls over.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

use crate::room::UserId;

#[derive(Debug, Clone, Copy)]
struct Counter {
    count: u32,
    expires_at: Instant,
}

/// Per-principal, per-operation fixed-window limiter.
#[derive(Default)]
pub struct RateLimiter {
    counters: Mutex<HashMap<(UserId, String), Counter>>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count one call and report whether it is within `limit` per `window`.
    pub fn allow(&self, principal: UserId, op: &str, limit: u32, window: Duration) -> bool {
        let now = Instant::now();
        let mut counters = match self.counters.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let counter = counters
            .entry((principal, op.to_owned()))
            .or_insert(Counter {
                count: 0,
                expires_at: now + window,
            });
        if counter.expires_at <= now {
            counter.count = 0;
            counter.expires_at = now + window;
        }
        counter.count = counter.count.saturating_add(1);
        let allowed = counter.count <= limit;
        if !allowed {
            log::debug!("Rate limit hit: {principal} {op} ({}/{limit})", counter.count);
        }
        allowed
    }

    /// Evict counters whose window has passed. Returns how many were removed.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let mut counters = match self.counters.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let before = counters.len();
        counters.retain(|_, c| c.expires_at > now);
        before - counters.len()
    }

    pub fn len(&self) -> usize {
        self.counters.lock().map(|c| c.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
