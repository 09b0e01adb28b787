//! Per-user generation quota.

use std::{
    collections::HashMap,
    sync::Mutex,
    time::{Duration, Instant},
};

use async_trait::async_trait;
use tracing::info;

use crate::{
    config::Config,
    domain::{ChatId, UserId},
    ports::QuotaChecker,
    Result,
};

// ============== Token bucket ==============

#[derive(Clone, Debug)]
struct Bucket {
    tokens: f64,
    refilled_at: Instant,
}

/// Outcome of one [`RateLimiter::check`].
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Decision {
    pub allowed: bool,
    /// Time until the next request would pass, when denied.
    pub retry_after: Option<Duration>,
}

#[derive(Clone, Debug)]
pub struct RateLimiter {
    enabled: bool,
    capacity: f64,
    refill_per_sec: f64,
    buckets: HashMap<UserId, Bucket>,
    /// Buckets that have refilled completely are dropped once this many users are tracked.
    max_tracked_users: usize,
}

impl RateLimiter {
    /// `requests` generations per `window`, with bursts up to `requests`.
    pub fn new(enabled: bool, requests: u32, window: Duration) -> Self {
        let capacity = f64::from(requests.max(1));
        Self {
            enabled,
            capacity,
            refill_per_sec: capacity / window.as_secs_f64().max(1e-9),
            buckets: HashMap::new(),
            max_tracked_users: 1024,
        }
    }

    pub fn with_max_tracked_users(mut self, max: usize) -> Self {
        self.max_tracked_users = max.max(1);
        self
    }

    pub fn check(&mut self, user: UserId) -> Decision {
        self.check_at(user, Instant::now())
    }

    pub fn check_at(&mut self, user: UserId, now: Instant) -> Decision {
        if !self.enabled {
            return Decision {
                allowed: true,
                retry_after: None,
            };
        }

        let capacity = self.capacity;
        if self.buckets.len() >= self.max_tracked_users && !self.buckets.contains_key(&user) {
            // A full bucket is indistinguishable from a fresh one.
            let refill = self.refill_per_sec;
            self.buckets.retain(|_, b| {
                let elapsed = now.saturating_duration_since(b.refilled_at).as_secs_f64();
                b.tokens + elapsed * refill < capacity
            });
        }
        let bucket = self.buckets.entry(user).or_insert_with(|| Bucket {
            tokens: capacity,
            refilled_at: now,
        });

        let elapsed = now.saturating_duration_since(bucket.refilled_at).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.refill_per_sec).min(capacity);
        bucket.refilled_at = now;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            return Decision {
                allowed: true,
                retry_after: None,
            };
        }

        let wait = (1.0 - bucket.tokens) / self.refill_per_sec;
        Decision {
            allowed: false,
            retry_after: Some(Duration::from_secs_f64(wait.max(0.0))),
        }
    }
}

// ============== Quota port ==============

/// [`QuotaChecker`] backed by an in-memory [`RateLimiter`].
pub struct RateLimitQuota {
    limiter: Mutex<RateLimiter>,
}

impl RateLimitQuota {
    pub fn new(limiter: RateLimiter) -> Self {
        Self {
            limiter: Mutex::new(limiter),
        }
    }

    pub fn from_config(cfg: &Config) -> Self {
        Self::new(RateLimiter::new(
            cfg.rate_limit_enabled,
            cfg.rate_limit_requests,
            cfg.rate_limit_window,
        ))
    }
}

#[async_trait]
impl QuotaChecker for RateLimitQuota {
    async fn can_proceed(&self, user: UserId, chat: ChatId) -> Result<bool> {
        let decision = self
            .limiter
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .check(user);
        if !decision.allowed {
            info!(
                user_id = user.0,
                chat_id = chat.0,
                retry_after_secs = decision.retry_after.map(|d| d.as_secs()).unwrap_or(0),
                "generation quota exhausted"
            );
        }
        Ok(decision.allowed)
    }
}
