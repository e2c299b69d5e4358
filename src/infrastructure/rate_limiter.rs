//! Rate Limiter
//!
//! Token bucket rate limiting per client address.

use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Rate limiter configuration.
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// Tokens refilled per window
    pub max_requests: u64,
    /// Refill window
    pub window: Duration,
    /// Bucket capacity
    pub burst_size: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_requests: 30,
            window: Duration::from_secs(60),
            burst_size: 10,
        }
    }
}

/// Result of a rate limit check.
#[derive(Debug, Clone, PartialEq)]
pub enum RateLimitResult {
    Allowed { remaining: u64 },
    Limited { retry_after_ms: u64 },
}

impl RateLimitResult {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed { .. })
    }
}

struct ClientState {
    tokens: AtomicU64,
    /// Milliseconds since the limiter's epoch
    last_refill_ms: AtomicU64,
}

/// Token bucket rate limiter keyed by normalized client address.
pub struct RateLimiter {
    config: RateLimitConfig,
    clients: DashMap<String, ClientState>,
    epoch: Instant,
    /// Tokens added per millisecond
    refill_rate_per_ms: f64,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        let window_ms = config.window.as_millis().max(1) as f64;
        let refill_rate_per_ms = config.max_requests as f64 / window_ms;
        Self {
            config,
            clients: DashMap::new(),
            epoch: Instant::now(),
            refill_rate_per_ms,
        }
    }

    fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    /// Take one token for `address`.
    pub fn check(&self, address: &str) -> RateLimitResult {
        let now_ms = self.now_ms();
        let state = self
            .clients
            .entry(address.to_string())
            .or_insert_with(|| ClientState {
                tokens: AtomicU64::new(self.config.burst_size),
                last_refill_ms: AtomicU64::new(now_ms),
            });

        let last_refill = state.last_refill_ms.load(Ordering::Relaxed);
        let elapsed_ms = now_ms.saturating_sub(last_refill);
        let tokens_to_add = (elapsed_ms as f64 * self.refill_rate_per_ms) as u64;

        if tokens_to_add > 0 {
            let current = state.tokens.load(Ordering::Relaxed);
            let refilled = (current + tokens_to_add).min(self.config.burst_size);
            state.tokens.store(refilled, Ordering::Relaxed);
            state.last_refill_ms.store(now_ms, Ordering::Relaxed);
        }

        let mut current = state.tokens.load(Ordering::Relaxed);
        loop {
            if current == 0 {
                return RateLimitResult::Limited {
                    retry_after_ms: self.retry_after_ms(),
                };
            }
            match state.tokens.compare_exchange_weak(
                current,
                current - 1,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => {
                    return RateLimitResult::Allowed {
                        remaining: current - 1,
                    }
                }
                Err(c) => current = c,
            }
        }
    }

    fn retry_after_ms(&self) -> u64 {
        if self.refill_rate_per_ms <= 0.0 {
            return self.config.window.as_millis() as u64;
        }
        (1.0 / self.refill_rate_per_ms).ceil() as u64
    }

    /// Tokens left for `address`; unknown addresses have a full bucket.
    pub fn remaining(&self, address: &str) -> u64 {
        self.clients
            .get(address)
            .map(|s| s.tokens.load(Ordering::Relaxed))
            .unwrap_or(self.config.burst_size)
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    /// Forget clients not seen for `max_age`.
    pub fn cleanup(&self, max_age: Duration) -> usize {
        let now_ms = self.now_ms();
        let max_age_ms = max_age.as_millis() as u64;

        let before = self.clients.len();
        self.clients.retain(|_, state| {
            let last_refill = state.last_refill_ms.load(Ordering::Relaxed);
            now_ms.saturating_sub(last_refill) < max_age_ms
        });
        let removed = before.saturating_sub(self.clients.len());
        if removed > 0 {
            tracing::debug!("rate limiter cleanup: removed {} stale entries", removed);
        }
        removed
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(RateLimitConfig::default())
    }
}
