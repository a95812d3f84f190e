//! Circuit breaker guarding one upstream dependency.
//!
//! ```text
//! Closed   → Open:     consecutive failures reach the threshold
//! Open     → HalfOpen: first can_attempt() after the reset timeout
//! HalfOpen → Closed:   a probe succeeds (counters reset)
//! HalfOpen → Open:     a probe fails (cooldown restarts)
//! ```
//!
//! State is per process and in memory; a restart starts Closed.

use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use herald_core::SharedClock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl core::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let s = match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        };
        f.write_str(s)
    }
}

/// Breaker configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the circuit.
    pub failure_threshold: u32,
    /// Cooldown before a probe is let through.
    pub reset_timeout: Duration,
    /// Probes admitted while half-open before an outcome is recorded.
    /// `None` admits every caller.
    pub half_open_max_probes: Option<u32>,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout: Duration::from_secs(60),
            half_open_max_probes: None,
        }
    }
}

/// Point-in-time view of a breaker.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CircuitStats {
    pub name: String,
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub failure_count: u64,
    pub success_count: u64,
    pub total_attempts: u64,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub last_success_at: Option<DateTime<Utc>>,
    pub opened_at: Option<DateTime<Utc>>,
    /// `opened_at + reset_timeout`, only while open.
    pub next_recovery_attempt: Option<DateTime<Utc>>,
}

#[derive(Debug)]
struct Inner {
    state: CircuitState,
    consecutive_failures: u32,
    failure_count: u64,
    success_count: u64,
    total_attempts: u64,
    half_open_probes: u32,
    last_failure_at: Option<DateTime<Utc>>,
    last_success_at: Option<DateTime<Utc>>,
    opened_at: Option<DateTime<Utc>>,
}

impl Inner {
    fn closed() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            failure_count: 0,
            success_count: 0,
            total_attempts: 0,
            half_open_probes: 0,
            last_failure_at: None,
            last_success_at: None,
            opened_at: None,
        }
    }
}

/// In-process breaker for a single named dependency (e.g. `carrier-api`).
///
/// All state sits behind one mutex so concurrent deliveries never lose or
/// double count an outcome.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    clock: SharedClock,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig, clock: SharedClock) -> Self {
        Self {
            name: name.into(),
            config,
            clock,
            inner: Mutex::new(Inner::closed()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn reset_timeout(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.config.reset_timeout).unwrap_or_default()
    }

    /// Whether a call to the dependency should be attempted now.
    ///
    /// An open circuit whose cooldown has elapsed moves to half-open on this
    /// call and admits it as a probe.
    pub fn can_attempt(&self) -> bool {
        let now = self.clock.now();
        let mut inner = self.lock();

        let state = inner.state;
        let admitted = match state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                let cooled_down = inner
                    .opened_at
                    .is_none_or(|opened| now - opened >= self.reset_timeout());
                if cooled_down {
                    inner.state = CircuitState::HalfOpen;
                    inner.half_open_probes = 1;
                    info!(breaker = %self.name, "circuit half-open; admitting probe");
                }
                cooled_down
            }
            CircuitState::HalfOpen => match self.config.half_open_max_probes {
                Some(max) if inner.half_open_probes >= max => false,
                _ => {
                    inner.half_open_probes = inner.half_open_probes.saturating_add(1);
                    true
                }
            },
        };

        if admitted {
            inner.total_attempts = inner.total_attempts.saturating_add(1);
        }
        admitted
    }

    /// Whether [`can_attempt`](Self::can_attempt) would admit a call now.
    ///
    /// Changes no state and admits nothing, so an open circuit whose
    /// cooldown has elapsed reports `true` while still `Open`.
    pub fn would_admit(&self) -> bool {
        let now = self.clock.now();
        let inner = self.lock();
        match inner.state {
            CircuitState::Closed => true,
            CircuitState::Open => inner
                .opened_at
                .is_none_or(|opened| now - opened >= self.reset_timeout()),
            CircuitState::HalfOpen => self
                .config
                .half_open_max_probes
                .is_none_or(|max| inner.half_open_probes < max),
        }
    }

    /// Report a successful call.
    pub fn record_success(&self) {
        let now = self.clock.now();
        let mut inner = self.lock();
        inner.last_success_at = Some(now);

        let state = inner.state;
        match state {
            CircuitState::HalfOpen => {
                inner.state = CircuitState::Closed;
                inner.consecutive_failures = 0;
                inner.failure_count = 0;
                inner.success_count = 0;
                inner.half_open_probes = 0;
                inner.opened_at = None;
                info!(breaker = %self.name, "circuit closed after successful probe");
            }
            CircuitState::Closed | CircuitState::Open => {
                inner.success_count = inner.success_count.saturating_add(1);
            }
        }
    }

    /// Report a failed call.
    pub fn record_failure(&self) {
        let now = self.clock.now();
        let mut inner = self.lock();
        inner.last_failure_at = Some(now);
        inner.failure_count = inner.failure_count.saturating_add(1);
        inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);

        let state = inner.state;
        match state {
            CircuitState::HalfOpen => {
                inner.state = CircuitState::Open;
                inner.opened_at = Some(now);
                inner.half_open_probes = 0;
                warn!(breaker = %self.name, "probe failed; circuit re-opened");
            }
            CircuitState::Closed if inner.consecutive_failures >= self.config.failure_threshold => {
                inner.state = CircuitState::Open;
                inner.opened_at = Some(now);
                warn!(
                    breaker = %self.name,
                    failures = inner.consecutive_failures,
                    "failure threshold reached; circuit opened"
                );
            }
            CircuitState::Closed | CircuitState::Open => {}
        }
    }

    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    pub fn stats(&self) -> CircuitStats {
        let inner = self.lock();
        let next_recovery_attempt = match inner.state {
            CircuitState::Open => inner.opened_at.map(|at| at + self.reset_timeout()),
            _ => None,
        };

        CircuitStats {
            name: self.name.clone(),
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            failure_count: inner.failure_count,
            success_count: inner.success_count,
            total_attempts: inner.total_attempts,
            last_failure_at: inner.last_failure_at,
            last_success_at: inner.last_success_at,
            opened_at: inner.opened_at,
            next_recovery_attempt,
        }
    }

    /// Force the breaker closed and clear its counters.
    pub fn reset(&self) {
        *self.lock() = Inner::closed();
        info!(breaker = %self.name, "circuit manually reset");
    }
}
