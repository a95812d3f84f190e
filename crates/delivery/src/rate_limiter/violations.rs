//! Rate-limit violation trail for abuse analysis.
//!
//! Every rejected admission is appended to a per-subject, time-bounded list.
//! Reporting tooling reads it back and grades subjects by how often they hit
//! their limits.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::store::StoreError;

/// Rolling window over which violations are graded and retained.
pub const VIOLATION_WINDOW: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Per-subject cap on retained violations.
pub const MAX_VIOLATIONS_PER_SUBJECT: usize = 1000;

const MEDIUM_THRESHOLD: usize = 50;
const HIGH_THRESHOLD: usize = 100;
const HOURLY_SPIKE_THRESHOLD: usize = 10;

/// A single rejected admission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Violation {
    pub subject: String,
    pub endpoint: String,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
}

/// Graded view of a subject's recent violations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ViolationSummary {
    pub subject: String,
    /// Violations within [`VIOLATION_WINDOW`].
    pub total: usize,
    /// Violations within the last hour.
    pub last_hour: usize,
    pub severity: Severity,
    pub last_seen: Option<DateTime<Utc>>,
}

/// Grade `violations` for `subject` as of `now`.
///
/// More than 100 in the window is high, more than 50 medium; a spike of more
/// than 10 within the last hour is high regardless of the total.
pub fn summarize(subject: &str, violations: &[Violation], now: DateTime<Utc>) -> ViolationSummary {
    let window_start = now - chrono::Duration::from_std(VIOLATION_WINDOW).unwrap_or_default();
    let hour_start = now - chrono::Duration::hours(1);

    let in_window: Vec<&Violation> = violations
        .iter()
        .filter(|v| v.subject == subject && v.occurred_at > window_start)
        .collect();
    let last_hour = in_window
        .iter()
        .filter(|v| v.occurred_at > hour_start)
        .count();
    let total = in_window.len();

    let severity = if total > HIGH_THRESHOLD || last_hour > HOURLY_SPIKE_THRESHOLD {
        Severity::High
    } else if total > MEDIUM_THRESHOLD {
        Severity::Medium
    } else {
        Severity::Low
    };

    ViolationSummary {
        subject: subject.to_string(),
        total,
        last_hour,
        severity,
        last_seen: in_window.iter().map(|v| v.occurred_at).max(),
    }
}

/// Append-only, per-subject, time-bounded violation list.
#[async_trait]
pub trait ViolationSink: Send + Sync + core::fmt::Debug {
    async fn record(&self, violation: &Violation) -> Result<(), StoreError>;

    /// Violations for `subject` that occurred after `since`, oldest first.
    async fn recent(
        &self,
        subject: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<Violation>, StoreError>;
}

/// In-memory violation sink for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryViolationSink {
    inner: Mutex<HashMap<String, VecDeque<Violation>>>,
}

impl InMemoryViolationSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subjects(&self) -> Vec<String> {
        let map = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let mut subjects: Vec<String> = map.keys().cloned().collect();
        subjects.sort();
        subjects
    }
}

#[async_trait]
impl ViolationSink for InMemoryViolationSink {
    async fn record(&self, violation: &Violation) -> Result<(), StoreError> {
        let cutoff = violation.occurred_at
            - chrono::Duration::from_std(VIOLATION_WINDOW).unwrap_or_default();

        let mut map = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let list = map.entry(violation.subject.clone()).or_default();
        list.push_back(violation.clone());
        while list.len() > MAX_VIOLATIONS_PER_SUBJECT {
            list.pop_front();
        }

        // Quiet subjects age out entirely, like the per-subject TTL in Redis.
        map.retain(|_, list| {
            while list.front().is_some_and(|v| v.occurred_at <= cutoff) {
                list.pop_front();
            }
            !list.is_empty()
        });
        Ok(())
    }

    async fn recent(
        &self,
        subject: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<Violation>, StoreError> {
        let map = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(map
            .get(subject)
            .map(|list| {
                list.iter()
                    .filter(|v| v.occurred_at > since)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }
}
