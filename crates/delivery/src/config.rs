//! Reliability tuning, grouped per primitive.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use herald_core::{DomainError, DomainResult};

use crate::circuit_breaker::CircuitBreakerConfig;
use crate::delivery::{DEFAULT_DEAD_LETTER_RETENTION, RetryPolicy};
use crate::job_lock::DEFAULT_LOCK_TTL;
use crate::rate_limiter::RateLimitPolicy;
use crate::store::DEFAULT_STORE_TIMEOUT;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReliabilityConfig {
    /// Upper bound for every shared store round-trip.
    pub store_timeout: Duration,
    pub breaker: CircuitBreakerConfig,
    pub retry: RetryPolicy,
    /// Per-actor outbound message limit.
    pub sms_rate: RateLimitPolicy,
    pub lock_ttl: Duration,
    pub dead_letter_retention: Duration,
}

impl Default for ReliabilityConfig {
    fn default() -> Self {
        Self {
            store_timeout: DEFAULT_STORE_TIMEOUT,
            breaker: CircuitBreakerConfig::default(),
            retry: RetryPolicy::default(),
            sms_rate: RateLimitPolicy::sms_send(),
            lock_ttl: DEFAULT_LOCK_TTL,
            dead_letter_retention: DEFAULT_DEAD_LETTER_RETENTION,
        }
    }
}

impl ReliabilityConfig {
    /// Reject settings that would disable a primitive outright.
    pub fn validate(&self) -> DomainResult<()> {
        if self.store_timeout.is_zero() {
            return Err(DomainError::validation("store_timeout must be positive"));
        }
        if self.breaker.failure_threshold == 0 {
            return Err(DomainError::validation("breaker.failure_threshold must be at least 1"));
        }
        if self.sms_rate.capacity == 0 || self.sms_rate.window.is_zero() {
            return Err(DomainError::validation(
                "sms_rate needs a positive capacity and window",
            ));
        }
        if self.retry.backoff_multiplier < 1.0 {
            return Err(DomainError::validation("retry.backoff_multiplier must be >= 1"));
        }
        if self.retry.initial_delay > self.retry.max_delay {
            return Err(DomainError::validation(
                "retry.initial_delay must not exceed retry.max_delay",
            ));
        }
        if self.lock_ttl.is_zero() {
            return Err(DomainError::validation("lock_ttl must be positive"));
        }
        Ok(())
    }
}
