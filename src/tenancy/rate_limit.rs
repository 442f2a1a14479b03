//! Token-bucket rate limiter.
//!
//! Refill is computed lazily from elapsed wall-clock time at each
//! `allow()` call; there is no background timer. The token count is
//! always within `[0, burst_limit]`.

use std::time::Instant;

use serde::Deserialize;

/// Per-project rate limit: sustained rate plus burst capacity.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct RateLimitConfig {
    pub events_per_second: f64,
    pub burst_limit: u32,
}

/// Lazy-refill token bucket. Checks never suspend; they synchronously
/// permit or deny.
#[derive(Debug)]
pub struct TokenBucket {
    capacity: f64,
    refill_rate: f64,
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    pub fn new(config: RateLimitConfig) -> Self {
        let capacity = f64::from(config.burst_limit);
        Self {
            capacity,
            refill_rate: config.events_per_second,
            // A fresh bucket starts full.
            tokens: capacity,
            last_refill: Instant::now(),
        }
    }

    /// Take one token if available.
    pub fn allow(&mut self) -> bool {
        self.allow_at(Instant::now())
    }

    /// Clock-injectable variant of [`allow`](Self::allow).
    pub fn allow_at(&mut self, now: Instant) -> bool {
        self.refill(now);
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Current token count.
    pub fn available(&self) -> f64 {
        self.tokens
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill);
        self.tokens = (self.tokens + elapsed.as_secs_f64() * self.refill_rate).min(self.capacity);
        self.last_refill = now;
    }
}

// =============================================================================
// Tests
// =============================================================================
