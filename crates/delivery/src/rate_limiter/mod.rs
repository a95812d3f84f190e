//! Per-subject token-bucket rate limiting backed by the shared store.
//!
//! ## Design
//!
//! - One bucket per (policy, subject), created lazily at full capacity
//! - Buckets expire from the store after one window of inactivity
//! - Updates go through compare-and-swap with a bounded retry loop, so two
//!   processes reading the same bucket cannot both spend its last token
//! - Store unavailable: **fail open** (admit) and log
//! - Rejections are appended to an optional [`ViolationSink`]

pub mod bucket;
pub mod violations;

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, warn};

use herald_core::SharedClock;

use crate::store::{DEFAULT_STORE_TIMEOUT, SharedStore, StoreError, with_timeout};

pub use bucket::{Bucket, RateLimitPolicy};
pub use violations::{
    InMemoryViolationSink, Severity, VIOLATION_WINDOW, Violation, ViolationSink, ViolationSummary,
    summarize,
};

/// Attempts at the read/compare-and-swap cycle before treating contention as
/// a rejection.
const MAX_CAS_RETRIES: u32 = 5;

const KEY_PREFIX: &str = "ratelimit";

/// Snapshot of a subject's bucket, computed without spending a token.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RateLimitStatus {
    pub limit: u32,
    /// Whole tokens currently available.
    pub remaining: u32,
    /// When the bucket will be back at full capacity.
    pub reset_at: DateTime<Utc>,
    /// Time until at least one token is available (zero if one already is).
    pub retry_after: Duration,
}

impl RateLimitStatus {
    /// `retry_after` rounded up to whole seconds, as sent in `Retry-After`.
    pub fn retry_after_secs(&self) -> u64 {
        self.retry_after.as_secs_f64().ceil() as u64
    }
}

/// Token-bucket limiter over a [`SharedStore`].
pub struct RateLimiter<S> {
    store: S,
    clock: SharedClock,
    violations: Option<Arc<dyn ViolationSink>>,
    store_timeout: Duration,
}

impl<S: SharedStore> RateLimiter<S> {
    pub fn new(store: S, clock: SharedClock) -> Self {
        Self {
            store,
            clock,
            violations: None,
            store_timeout: DEFAULT_STORE_TIMEOUT,
        }
    }

    pub fn with_violation_sink(mut self, sink: Arc<dyn ViolationSink>) -> Self {
        self.violations = Some(sink);
        self
    }

    pub fn with_store_timeout(mut self, timeout: Duration) -> Self {
        self.store_timeout = timeout;
        self
    }

    fn bucket_key(policy: &RateLimitPolicy, subject: &str) -> String {
        format!("{KEY_PREFIX}:{}:{subject}", policy.name)
    }

    /// Spend `cost` tokens from `subject`'s bucket.
    ///
    /// Returns `true` when admitted. Fails open if the store cannot be reached.
    pub async fn admit(&self, subject: &str, cost: u32, policy: &RateLimitPolicy) -> bool {
        match self.try_admit(subject, cost, policy).await {
            Ok(true) => true,
            Ok(false) => {
                debug!(subject, policy = %policy.name, cost, "rate limit exceeded");
                self.record_violation(subject, policy).await;
                false
            }
            Err(e) => {
                warn!(
                    subject,
                    policy = %policy.name,
                    error = %e,
                    "rate limiter store unavailable; failing open"
                );
                true
            }
        }
    }

    async fn try_admit(
        &self,
        subject: &str,
        cost: u32,
        policy: &RateLimitPolicy,
    ) -> Result<bool, StoreError> {
        let key = Self::bucket_key(policy, subject);

        for attempt in 1..=MAX_CAS_RETRIES {
            let now = self.clock.now();
            let raw = with_timeout(self.store_timeout, self.store.get(&key)).await?;
            let current = decode_bucket(raw.as_deref(), policy, now);

            let mut next = current.refilled(policy, now);
            next.total_requests = next.total_requests.saturating_add(1);
            let admitted = next.try_consume(cost as f64);

            let encoded = serde_json::to_string(&next)
                .map_err(|e| StoreError::Serialization(e.to_string()))?;
            let swapped = with_timeout(
                self.store_timeout,
                self.store
                    .compare_and_swap(&key, raw.as_deref(), &encoded, policy.window),
            )
            .await?;

            if swapped {
                return Ok(admitted);
            }
            debug!(subject, policy = %policy.name, attempt, "bucket update contended; retrying");
        }

        // Sustained contention on one bucket is itself a sign of overload.
        Ok(false)
    }

    /// Current bucket state without consuming a token.
    pub async fn status(&self, subject: &str, policy: &RateLimitPolicy) -> RateLimitStatus {
        let now = self.clock.now();
        let key = Self::bucket_key(policy, subject);

        let bucket = match with_timeout(self.store_timeout, self.store.get(&key)).await {
            Ok(raw) => decode_bucket(raw.as_deref(), policy, now).refilled(policy, now),
            Err(e) => {
                warn!(
                    subject,
                    policy = %policy.name,
                    error = %e,
                    "rate limiter store unavailable; reporting full bucket"
                );
                Bucket::full(policy, now)
            }
        };

        RateLimitStatus {
            limit: policy.capacity,
            remaining: bucket.tokens.max(0.0).floor() as u32,
            reset_at: now
                + chrono::Duration::from_std(bucket.time_to_full(policy)).unwrap_or_default(),
            retry_after: bucket.retry_after(policy),
        }
    }

    /// Drop `subject`'s bucket so the next request starts from full capacity.
    pub async fn reset(&self, subject: &str, policy: &RateLimitPolicy) -> Result<bool, StoreError> {
        let key = Self::bucket_key(policy, subject);
        with_timeout(self.store_timeout, self.store.delete(&key)).await
    }

    /// Graded violation history for `subject`, if a sink is configured.
    pub async fn violation_summary(
        &self,
        subject: &str,
    ) -> Result<Option<ViolationSummary>, StoreError> {
        let Some(sink) = &self.violations else {
            return Ok(None);
        };
        let now = self.clock.now();
        let since = now - chrono::Duration::from_std(VIOLATION_WINDOW).unwrap_or_default();
        let recent = with_timeout(self.store_timeout, sink.recent(subject, since)).await?;
        Ok(Some(summarize(subject, &recent, now)))
    }

    async fn record_violation(&self, subject: &str, policy: &RateLimitPolicy) {
        let Some(sink) = &self.violations else {
            return;
        };
        let violation = Violation {
            subject: subject.to_string(),
            endpoint: policy.name.clone(),
            occurred_at: self.clock.now(),
        };
        if let Err(e) = with_timeout(self.store_timeout, sink.record(&violation)).await {
            warn!(
                subject,
                policy = %policy.name,
                error = %e,
                "failed to record rate limit violation"
            );
        }
    }
}

/// Parse a stored bucket; missing or unreadable values start a fresh bucket.
fn decode_bucket(raw: Option<&str>, policy: &RateLimitPolicy, now: DateTime<Utc>) -> Bucket {
    match raw {
        Some(json) => serde_json::from_str(json).unwrap_or_else(|e| {
            warn!(policy = %policy.name, error = %e, "discarding unreadable bucket");
            Bucket::full(policy, now)
        }),
        None => Bucket::full(policy, now),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemorySharedStore;
    use herald_core::{Clock, ManualClock};
    use proptest::prelude::*;

    fn limiter() -> (
        RateLimiter<Arc<InMemorySharedStore>>,
        Arc<InMemorySharedStore>,
        Arc<ManualClock>,
        Arc<InMemoryViolationSink>,
    ) {
        let clock = ManualClock::starting_now();
        let store = Arc::new(InMemorySharedStore::with_clock(clock.clone()));
        let sink = Arc::new(InMemoryViolationSink::new());
        let limiter =
            RateLimiter::new(store.clone(), clock.clone()).with_violation_sink(sink.clone());
        (limiter, store, clock, sink)
    }

    fn five_per_minute() -> RateLimitPolicy {
        RateLimitPolicy::new("sms_send", 5, Duration::from_secs(60))
    }

    #[tokio::test]
    async fn sixth_request_in_window_is_rejected_then_recovers() {
        let (limiter, _store, clock, _sink) = limiter();
        let policy = five_per_minute();

        for _ in 0..5 {
            assert!(limiter.admit("user1", 1, &policy).await);
        }
        assert!(!limiter.admit("user1", 1, &policy).await);

        clock.advance(Duration::from_secs(60));
        assert!(limiter.admit("user1", 1, &policy).await);
    }

    #[tokio::test]
    async fn subjects_have_independent_buckets() {
        let (limiter, _store, _clock, _sink) = limiter();
        let policy = five_per_minute();

        assert!(limiter.admit("user1", 5, &policy).await);
        assert!(!limiter.admit("user1", 1, &policy).await);
        assert!(limiter.admit("user2", 1, &policy).await);
    }

    #[tokio::test]
    async fn idle_bucket_expires_to_full_capacity() {
        let (limiter, store, clock, _sink) = limiter();
        let policy = five_per_minute();

        assert!(limiter.admit("user1", 5, &policy).await);
        clock.advance(Duration::from_secs(61));

        // The key itself has expired; status reports a fresh bucket.
        assert!(!store.exists("ratelimit:sms_send:user1").await.unwrap());
        let status = limiter.status("user1", &policy).await;
        assert_eq!(status.remaining, 5);
        assert_eq!(status.retry_after, Duration::ZERO);
    }

    #[tokio::test]
    async fn status_does_not_consume() {
        let (limiter, _store, clock, _sink) = limiter();
        let policy = five_per_minute();

        assert!(limiter.admit("user1", 5, &policy).await);
        let t0 = clock.now();
        let status = limiter.status("user1", &policy).await;
        assert_eq!(status.remaining, 0);
        assert_eq!(status.retry_after, Duration::from_secs(12));
        assert_eq!(status.retry_after_secs(), 12);
        assert_eq!(status.reset_at, t0 + chrono::Duration::seconds(60));

        let again = limiter.status("user1", &policy).await;
        assert_eq!(again.remaining, 0);
    }

    #[tokio::test]
    async fn fails_open_when_store_is_down() {
        let (limiter, store, _clock, sink) = limiter();
        let policy = five_per_minute();
        store.simulate_outage(true);

        for _ in 0..20 {
            assert!(limiter.admit("user1", 1, &policy).await);
        }
        assert!(sink.subjects().is_empty());
    }

    #[tokio::test]
    async fn rejections_are_recorded_as_violations() {
        let (limiter, _store, _clock, _sink) = limiter();
        let policy = five_per_minute();

        assert!(limiter.admit("user1", 5, &policy).await);
        for _ in 0..3 {
            assert!(!limiter.admit("user1", 1, &policy).await);
        }

        let summary = limiter.violation_summary("user1").await.unwrap().unwrap();
        assert_eq!(summary.total, 3);
        assert_eq!(summary.severity, Severity::Low);
    }

    #[tokio::test]
    async fn reset_restores_capacity() {
        let (limiter, _store, _clock, _sink) = limiter();
        let policy = five_per_minute();

        assert!(limiter.admit("user1", 5, &policy).await);
        assert!(limiter.reset("user1", &policy).await.unwrap());
        assert!(limiter.admit("user1", 5, &policy).await);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_admits_never_overspend() {
        let clock = ManualClock::starting_now();
        let store = Arc::new(InMemorySharedStore::with_clock(clock.clone()));
        let limiter = Arc::new(RateLimiter::new(store, clock));
        let policy = RateLimitPolicy::new("burst", 10, Duration::from_secs(3600));

        let mut handles = Vec::new();
        for _ in 0..40 {
            let limiter = limiter.clone();
            let policy = policy.clone();
            handles.push(tokio::spawn(async move { limiter.admit("shared", 1, &policy).await }));
        }

        let mut admitted = 0;
        for h in handles {
            if h.await.unwrap() {
                admitted += 1;
            }
        }
        assert!(admitted <= 10, "admitted {admitted} with capacity 10");
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 64,
            ..ProptestConfig::default()
        })]

        /// Property: within one window, admitted cost never exceeds capacity.
        #[test]
        fn admitted_cost_within_window_is_bounded(
            costs in prop::collection::vec(1u32..4, 1..40),
            gaps_ms in prop::collection::vec(0u64..1500, 40),
        ) {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_time()
                .build()
                .unwrap();

            runtime.block_on(async {
                let clock = ManualClock::starting_now();
                let store = Arc::new(InMemorySharedStore::with_clock(clock.clone()));
                let limiter = RateLimiter::new(store, clock.clone());
                let policy = RateLimitPolicy::new("prop", 10, Duration::from_secs(60));

                let mut elapsed = Duration::ZERO;
                let mut admitted = 0u32;
                for (cost, gap) in costs.iter().zip(gaps_ms.iter()) {
                    let gap = Duration::from_millis(*gap);
                    clock.advance(gap);
                    elapsed += gap;
                    if limiter.admit("s", *cost, &policy).await {
                        admitted += cost;
                    }
                }

                // Capacity plus whatever refilled during the elapsed time.
                let refilled = elapsed.as_secs_f64() * policy.refill_rate();
                prop_assert!(admitted as f64 <= policy.capacity as f64 + refilled + 1e-9);
                Ok::<(), TestCaseError>(())
            })?;
        }
    }
}
