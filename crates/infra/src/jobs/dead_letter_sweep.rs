//! Recovery sweep: replay dead letters once the carrier is healthy again.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use herald_delivery::{DeadLetterStore, DeliveryError, DeliveryPipeline, MessageSender, RetryPolicy};

use super::recurring::RecurringJob;

pub const DEAD_LETTER_SWEEP_JOB: &str = "dead-letter-replay";

/// Wall time one run may spend replaying. Keep it well under the job's
/// lock TTL so the lock never lapses mid-run.
pub const DEFAULT_SWEEP_BUDGET: Duration = Duration::from_secs(15);

/// Replays up to `batch` of the longest-waiting dead letters per run.
///
/// Each replay is a single attempt; retrying is what the next run is for.
/// A run does nothing while the breaker would refuse calls, and stops early
/// once its time budget is spent or the breaker stops admitting.
pub struct DeadLetterReplaySweep<S, D> {
    pipeline: Arc<DeliveryPipeline<S, D>>,
    batch: usize,
    replay_policy: RetryPolicy,
    time_budget: Duration,
}

/// Counts from one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepSummary {
    pub replayed: usize,
    pub still_failing: usize,
    /// Removed by someone else between listing and replay.
    pub vanished: usize,
    /// Listed but left for the next run.
    pub deferred: usize,
}

impl<S, D> DeadLetterReplaySweep<S, D>
where
    S: MessageSender,
    D: DeadLetterStore,
{
    pub fn new(pipeline: Arc<DeliveryPipeline<S, D>>, batch: usize) -> Self {
        Self {
            pipeline,
            batch: batch.max(1),
            replay_policy: RetryPolicy::no_retry(),
            time_budget: DEFAULT_SWEEP_BUDGET,
        }
    }

    pub fn with_replay_policy(mut self, policy: RetryPolicy) -> Self {
        self.replay_policy = policy;
        self
    }

    pub fn with_time_budget(mut self, budget: Duration) -> Self {
        self.time_budget = budget;
        self
    }

    pub async fn sweep(&self) -> Result<SweepSummary, DeliveryError> {
        let mut summary = SweepSummary::default();
        let breaker = self.pipeline.breaker();

        if !breaker.would_admit() {
            debug!(breaker = breaker.name(), "breaker refusing calls; skipping sweep");
            return Ok(summary);
        }

        let deadline = Instant::now() + self.time_budget;
        let entries = self.pipeline.oldest_dead_letters(self.batch).await?;

        for (done, entry) in entries.iter().enumerate() {
            if Instant::now() >= deadline || !breaker.would_admit() {
                summary.deferred = entries.len() - done;
                break;
            }
            match self.pipeline.replay_with(&entry.id, &self.replay_policy).await {
                Ok(result) if result.success => summary.replayed += 1,
                Ok(_) => summary.still_failing += 1,
                Err(DeliveryError::NotFound(_)) => summary.vanished += 1,
                Err(e) => return Err(e),
            }
        }

        if summary.replayed + summary.still_failing > 0 {
            info!(
                replayed = summary.replayed,
                still_failing = summary.still_failing,
                deferred = summary.deferred,
                "dead letter sweep finished"
            );
        }
        if summary.still_failing > 0 {
            warn!(
                still_failing = summary.still_failing,
                "dead letters still failing after replay"
            );
        }
        Ok(summary)
    }
}

#[async_trait]
impl<S, D> RecurringJob for DeadLetterReplaySweep<S, D>
where
    S: MessageSender,
    D: DeadLetterStore,
{
    fn name(&self) -> &str {
        DEAD_LETTER_SWEEP_JOB
    }

    async fn run(&self) -> anyhow::Result<()> {
        self.sweep().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use herald_core::{ManualClock, TenantId};
    use herald_delivery::{
        CircuitBreaker, CircuitBreakerConfig, CircuitState, Envelope, InMemorySharedStore,
        Recipient, ScriptedSender, SharedStoreDeadLetters,
    };

    type Pipeline =
        DeliveryPipeline<Arc<ScriptedSender>, SharedStoreDeadLetters<Arc<InMemorySharedStore>>>;

    /// Pipeline on the default retry policy, so the sweep's own policy is
    /// what keeps replays short.
    fn pipeline(
        sender: Arc<ScriptedSender>,
        failure_threshold: u32,
    ) -> (Arc<Pipeline>, Arc<ManualClock>) {
        let clock = ManualClock::starting_now();
        let store = Arc::new(InMemorySharedStore::with_clock(clock.clone()));
        let pipeline = DeliveryPipeline::new(
            sender,
            SharedStoreDeadLetters::new(store).with_clock(clock.clone()),
            Arc::new(CircuitBreaker::new(
                "sms-carrier",
                CircuitBreakerConfig {
                    failure_threshold,
                    ..Default::default()
                },
                clock.clone(),
            )),
            clock.clone(),
        );
        (Arc::new(pipeline), clock)
    }

    async fn dead_letter(pipeline: &Pipeline, to: &str, body: &str) {
        let result = pipeline
            .deliver_with(
                &Envelope::new(TenantId::new(), body),
                &Recipient::new(to).unwrap(),
                &RetryPolicy::no_retry(),
            )
            .await;
        assert!(!result.success);
        assert!(result.dead_lettered);
    }

    #[tokio::test(start_paused = true)]
    async fn replays_once_carrier_recovers() {
        let sender = Arc::new(ScriptedSender::always_failing());
        let (pipeline, _clock) = pipeline(sender.clone(), 5);
        dead_letter(&pipeline, "+15550001", "hi").await;

        sender.set_failing(false);
        let sweep = DeadLetterReplaySweep::new(pipeline.clone(), 10);
        let summary = sweep.sweep().await.unwrap();

        assert_eq!(summary.replayed, 1);
        assert!(pipeline.list_dead_letters(10).await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn open_breaker_defers_until_cooldown_elapses() {
        let sender = Arc::new(ScriptedSender::always_failing());
        let (pipeline, clock) = pipeline(sender.clone(), 2);
        dead_letter(&pipeline, "+15550001", "hi").await;
        dead_letter(&pipeline, "+15550002", "hi").await;
        assert_eq!(pipeline.breaker().state(), CircuitState::Open);

        sender.set_failing(false);
        let sweep = DeadLetterReplaySweep::new(pipeline.clone(), 10);
        let calls = sender.call_count();
        assert_eq!(sweep.sweep().await.unwrap(), SweepSummary::default());
        assert_eq!(sender.call_count(), calls);

        clock.advance(pipeline.breaker().config().reset_timeout);
        let summary = sweep.sweep().await.unwrap();

        assert_eq!(summary.replayed, 2);
        assert_eq!(pipeline.breaker().state(), CircuitState::Closed);
        assert!(pipeline.list_dead_letters(10).await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn still_failing_entries_get_one_attempt_each() {
        let sender = Arc::new(ScriptedSender::always_failing());
        let (pipeline, _clock) = pipeline(sender.clone(), 100);
        for i in 0..12 {
            dead_letter(&pipeline, &format!("+1555000{i:02}"), "hi").await;
        }

        let calls = sender.call_count();
        let started = Instant::now();
        let summary = DeadLetterReplaySweep::new(pipeline.clone(), 50).sweep().await.unwrap();

        assert_eq!(summary.still_failing, 12);
        assert_eq!(sender.call_count() - calls, 12);
        // No backoff sleeps between or within replays.
        assert_eq!(started.elapsed(), Duration::ZERO);
        assert_eq!(pipeline.list_dead_letters(50).await.unwrap().len(), 12);
    }

    #[tokio::test(start_paused = true)]
    async fn stops_when_time_budget_is_spent() {
        let sender = Arc::new(ScriptedSender::always_failing());
        let (pipeline, _clock) = pipeline(sender.clone(), 100);
        for i in 0..12 {
            dead_letter(&pipeline, &format!("+1555000{i:02}"), "hi").await;
        }
        sender.set_latency(Duration::from_secs(5));

        let started = Instant::now();
        let summary = DeadLetterReplaySweep::new(pipeline.clone(), 50)
            .with_time_budget(Duration::from_secs(20))
            .sweep()
            .await
            .unwrap();

        assert_eq!(summary.still_failing, 4);
        assert_eq!(summary.deferred, 8);
        assert!(started.elapsed() < Duration::from_secs(25));
    }

    #[tokio::test(start_paused = true)]
    async fn longest_waiting_entries_go_first() {
        let sender = Arc::new(ScriptedSender::always_failing());
        let (pipeline, clock) = pipeline(sender.clone(), 100);
        for body in ["first", "second", "third"] {
            dead_letter(&pipeline, "+15550001", body).await;
            clock.advance(Duration::from_secs(60));
        }

        sender.set_failing(false);
        let summary = DeadLetterReplaySweep::new(pipeline.clone(), 1).sweep().await.unwrap();

        assert_eq!(summary.replayed, 1);
        let remaining: Vec<String> = pipeline
            .list_dead_letters(10)
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.body)
            .collect();
        assert_eq!(remaining, ["third", "second"]);
    }
}
