//! Process configuration from `HERALD_*` environment variables.
//!
//! Unset variables fall back to the defaults in [`ReliabilityConfig`] and
//! the job configs; a set but unparsable variable is an error, never a silent
//! default.

use std::fmt::Display;
use std::str::FromStr;
use std::time::Duration;

use herald_core::DomainError;
use herald_delivery::ReliabilityConfig;

use crate::jobs::BroadcastExecutorConfig;

pub const REDIS_URL: &str = "HERALD_REDIS_URL";
pub const STORE_TIMEOUT_MS: &str = "HERALD_STORE_TIMEOUT_MS";
pub const BREAKER_FAILURE_THRESHOLD: &str = "HERALD_BREAKER_FAILURE_THRESHOLD";
pub const BREAKER_RESET_TIMEOUT_SECS: &str = "HERALD_BREAKER_RESET_TIMEOUT_SECS";
pub const RETRY_MAX: &str = "HERALD_RETRY_MAX";
pub const RETRY_INITIAL_DELAY_MS: &str = "HERALD_RETRY_INITIAL_DELAY_MS";
pub const RETRY_MAX_DELAY_MS: &str = "HERALD_RETRY_MAX_DELAY_MS";
pub const SMS_RATE_CAPACITY: &str = "HERALD_SMS_RATE_CAPACITY";
pub const SMS_RATE_WINDOW_SECS: &str = "HERALD_SMS_RATE_WINDOW_SECS";
pub const BROADCAST_MAX_CONCURRENT: &str = "HERALD_BROADCAST_MAX_CONCURRENT";
pub const BROADCAST_QUEUE_CAPACITY: &str = "HERALD_BROADCAST_QUEUE_CAPACITY";
pub const DLQ_SWEEP_INTERVAL_SECS: &str = "HERALD_DLQ_SWEEP_INTERVAL_SECS";
pub const DLQ_SWEEP_BATCH: &str = "HERALD_DLQ_SWEEP_BATCH";
pub const LOCK_TTL_MS: &str = "HERALD_LOCK_TTL_MS";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value:?} ({reason})")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },

    #[error("invalid configuration: {0}")]
    Validation(#[from] DomainError),
}

/// Dead-letter replay sweep schedule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadLetterSweepConfig {
    pub interval: Duration,
    /// Entries replayed per run.
    pub batch: usize,
}

impl Default for DeadLetterSweepConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(300),
            batch: 50,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct AppConfig {
    /// Shared store location. `None` runs on the in-memory store.
    pub redis_url: Option<String>,
    pub reliability: ReliabilityConfig,
    pub broadcast: BroadcastExecutorConfig,
    pub dead_letter_sweep: DeadLetterSweepConfig,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self {
            redis_url: lookup(REDIS_URL).filter(|url| !url.trim().is_empty()),
            ..Self::default()
        };

        let reliability = &mut config.reliability;
        if let Some(ms) = parse::<u64, _>(&lookup, STORE_TIMEOUT_MS)? {
            reliability.store_timeout = Duration::from_millis(ms);
        }
        if let Some(n) = parse(&lookup, BREAKER_FAILURE_THRESHOLD)? {
            reliability.breaker.failure_threshold = n;
        }
        if let Some(secs) = parse::<u64, _>(&lookup, BREAKER_RESET_TIMEOUT_SECS)? {
            reliability.breaker.reset_timeout = Duration::from_secs(secs);
        }
        if let Some(n) = parse(&lookup, RETRY_MAX)? {
            reliability.retry.max_retries = n;
        }
        if let Some(ms) = parse::<u64, _>(&lookup, RETRY_INITIAL_DELAY_MS)? {
            reliability.retry.initial_delay = Duration::from_millis(ms);
        }
        if let Some(ms) = parse::<u64, _>(&lookup, RETRY_MAX_DELAY_MS)? {
            reliability.retry.max_delay = Duration::from_millis(ms);
        }
        if let Some(n) = parse(&lookup, SMS_RATE_CAPACITY)? {
            reliability.sms_rate.capacity = n;
        }
        if let Some(secs) = parse::<u64, _>(&lookup, SMS_RATE_WINDOW_SECS)? {
            reliability.sms_rate.window = Duration::from_secs(secs);
        }
        if let Some(ms) = parse::<u64, _>(&lookup, LOCK_TTL_MS)? {
            reliability.lock_ttl = Duration::from_millis(ms);
        }
        reliability.validate()?;

        if let Some(n) = parse(&lookup, BROADCAST_MAX_CONCURRENT)? {
            config.broadcast.max_concurrent = positive(BROADCAST_MAX_CONCURRENT, n)?;
        }
        if let Some(n) = parse(&lookup, BROADCAST_QUEUE_CAPACITY)? {
            config.broadcast.queue_capacity = positive(BROADCAST_QUEUE_CAPACITY, n)?;
        }
        if let Some(secs) = parse(&lookup, DLQ_SWEEP_INTERVAL_SECS)? {
            let secs = positive(DLQ_SWEEP_INTERVAL_SECS, secs)?;
            config.dead_letter_sweep.interval = Duration::from_secs(secs as u64);
        }
        if let Some(n) = parse(&lookup, DLQ_SWEEP_BATCH)? {
            config.dead_letter_sweep.batch = positive(DLQ_SWEEP_BATCH, n)?;
        }

        Ok(config)
    }
}

fn parse<T, F>(lookup: &F, key: &'static str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: Display,
    F: Fn(&str) -> Option<String>,
{
    let Some(raw) = lookup(key) else {
        return Ok(None);
    };
    raw.trim()
        .parse()
        .map(Some)
        .map_err(|e: T::Err| ConfigError::Invalid {
            key,
            value: raw.clone(),
            reason: e.to_string(),
        })
}

fn positive(key: &'static str, n: usize) -> Result<usize, ConfigError> {
    if n == 0 {
        return Err(ConfigError::Invalid {
            key,
            value: n.to_string(),
            reason: "must be at least 1".to_string(),
        });
    }
    Ok(n)
}
