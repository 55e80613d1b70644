use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tracing::debug;

use crate::error::{GatewayError, GatewayResult};

/// Buckets untouched for this long are evicted during checks.
const IDLE_GRACE: Duration = Duration::from_secs(300);
/// How often the eviction sweep may run.
const SWEEP_PERIOD: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RateDecision {
    Allowed,
    Limited { retry_after: f64 },
}

struct Bucket {
    tokens: f64,
    last_refill: Instant,
    last_seen: Instant,
}

struct LimiterState {
    buckets: HashMap<String, Bucket>,
    last_sweep: Instant,
}

/// Token bucket per client key.
///
/// Capacity is `requests_per_minute`, refilled continuously at
/// capacity/60 tokens per second. A non-positive capacity disables
/// limiting entirely.
#[derive(Clone)]
pub struct RateLimiter {
    state: Arc<Mutex<LimiterState>>,
    capacity: f64,
    refill_per_sec: f64,
    max_wait: Duration,
}

impl RateLimiter {
    pub fn new(requests_per_minute: i64, max_wait: Duration) -> Self {
        let capacity = requests_per_minute.max(0) as f64;
        Self {
            state: Arc::new(Mutex::new(LimiterState {
                buckets: HashMap::new(),
                last_sweep: Instant::now(),
            })),
            capacity,
            refill_per_sec: capacity / 60.0,
            max_wait,
        }
    }

    pub fn enabled(&self) -> bool {
        self.capacity > 0.0
    }

    /// Take one token for `key` if available.
    pub fn check(&self, key: &str) -> RateDecision {
        if !self.enabled() {
            return RateDecision::Allowed;
        }

        let now = Instant::now();
        let mut state = self.state.lock().expect("rate limiter mutex poisoned");

        if now.duration_since(state.last_sweep) >= SWEEP_PERIOD {
            state.buckets.retain(|_, b| now.duration_since(b.last_seen) < IDLE_GRACE);
            state.last_sweep = now;
        }

        let capacity = self.capacity;
        let refill = self.refill_per_sec;
        let bucket = state.buckets.entry(key.to_string()).or_insert(Bucket {
            tokens: capacity,
            last_refill: now,
            last_seen: now,
        });

        let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * refill).min(capacity);
        bucket.last_refill = now;
        bucket.last_seen = now;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            RateDecision::Allowed
        } else {
            let retry_after = (1.0 - bucket.tokens) / refill;
            RateDecision::Limited { retry_after }
        }
    }

    /// Take a token, suspending up to the configured bound when the bucket
    /// is dry. Fails with `RateLimit` carrying the remaining wait.
    pub async fn acquire(&self, key: &str) -> GatewayResult<()> {
        let deadline = Instant::now() + self.max_wait;

        loop {
            match self.check(key) {
                RateDecision::Allowed => return Ok(()),
                RateDecision::Limited { retry_after } => {
                    let now = Instant::now();
                    let wait = Duration::from_secs_f64(retry_after.max(0.001));
                    if now + wait > deadline {
                        debug!(key, retry_after, "rate limit exceeded");
                        return Err(GatewayError::RateLimit { retry_after });
                    }
                    tokio::time::sleep(wait).await;
                }
            }
        }
    }

    #[cfg(test)]
    fn bucket_count(&self) -> usize {
        self.state.lock().unwrap().buckets.len()
    }
}
