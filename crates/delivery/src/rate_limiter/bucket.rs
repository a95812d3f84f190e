//! Token bucket state and refill math.
//!
//! Pure computation: time is passed in explicitly, nothing here touches the
//! store or the system clock.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A named rate-limit policy: `capacity` tokens replenished evenly over
/// `window`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimitPolicy {
    /// Endpoint/operation the policy guards. Part of the bucket key and of
    /// every recorded violation.
    pub name: String,
    /// Maximum tokens (burst size).
    pub capacity: u32,
    /// Time to refill an empty bucket; also the idle expiry of a bucket.
    pub window: Duration,
}

impl RateLimitPolicy {
    pub fn new(name: impl Into<String>, capacity: u32, window: Duration) -> Self {
        Self {
            name: name.into(),
            capacity,
            window,
        }
    }

    /// Outbound SMS/MMS per actor: 100 recipients per hour.
    pub fn sms_send() -> Self {
        Self::new("sms_send", 100, Duration::from_secs(3600))
    }

    /// Generic API calls per actor: 100 per minute.
    pub fn api_request() -> Self {
        Self::new("api_request", 100, Duration::from_secs(60))
    }

    /// Tokens added per second.
    pub fn refill_rate(&self) -> f64 {
        self.tokens_for(1.0)
    }

    /// Tokens replenished over `elapsed_secs`.
    fn tokens_for(&self, elapsed_secs: f64) -> f64 {
        let window = self.window.as_secs_f64();
        if window <= 0.0 {
            return self.capacity as f64;
        }
        elapsed_secs * self.capacity as f64 / window
    }

    /// Seconds needed to replenish `tokens`.
    fn secs_for(&self, tokens: f64) -> f64 {
        if self.capacity == 0 {
            return self.window.as_secs_f64();
        }
        tokens * self.window.as_secs_f64() / self.capacity as f64
    }
}

/// Persisted bucket for one (policy, subject) pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bucket {
    pub tokens: f64,
    pub last_refill: DateTime<Utc>,
    /// Lifetime request count, admitted or not.
    pub total_requests: u64,
}

impl Bucket {
    /// A fresh bucket at full capacity.
    pub fn full(policy: &RateLimitPolicy, now: DateTime<Utc>) -> Self {
        Self {
            tokens: policy.capacity as f64,
            last_refill: now,
            total_requests: 0,
        }
    }

    /// Replenish tokens for the time elapsed since `last_refill`, capped at
    /// capacity. Clock skew (a `now` earlier than `last_refill`) adds nothing.
    pub fn refilled(&self, policy: &RateLimitPolicy, now: DateTime<Utc>) -> Self {
        let elapsed_ms = (now - self.last_refill).num_milliseconds().max(0);
        let elapsed_secs = elapsed_ms as f64 / 1000.0;
        let capacity = policy.capacity as f64;
        let tokens = if elapsed_secs > 0.0 {
            (self.tokens + policy.tokens_for(elapsed_secs)).min(capacity)
        } else {
            self.tokens.min(capacity)
        };

        Self {
            tokens,
            last_refill: if elapsed_ms > 0 { now } else { self.last_refill },
            total_requests: self.total_requests,
        }
    }

    /// Spend `cost` tokens if available. Never drives the count below zero.
    pub fn try_consume(&mut self, cost: f64) -> bool {
        if self.tokens >= cost {
            self.tokens -= cost;
            true
        } else {
            false
        }
    }

    /// Time until at least one token is available.
    pub fn retry_after(&self, policy: &RateLimitPolicy) -> Duration {
        let deficit = 1.0 - self.tokens;
        if deficit <= 0.0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(policy.secs_for(deficit))
    }

    /// Time until the bucket is full again.
    pub fn time_to_full(&self, policy: &RateLimitPolicy) -> Duration {
        let deficit = policy.capacity as f64 - self.tokens;
        if deficit <= 0.0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(policy.secs_for(deficit))
    }
}
