//! Retrying, breaker-guarded delivery with dead-letter hand-off.

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, instrument, warn};

use herald_core::{MessageId, SharedClock};

use super::dead_letter::{DeadLetterEntry, DeadLetterId, DeadLetterStore};
use super::envelope::{DeliveryAttempt, Envelope, Recipient};
use super::sender::{MessageSender, ProviderMessageId, SendError};
use crate::circuit_breaker::CircuitBreaker;
use crate::error::DeliveryError;

/// Exponential backoff schedule for one delivery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts, including the first. Zero is treated as one.
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(8000),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// A single attempt, no backoff.
    pub fn no_retry() -> Self {
        Self {
            max_retries: 1,
            ..Default::default()
        }
    }

    pub fn exponential(max_retries: u32, initial_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_retries,
            initial_delay,
            max_delay,
            ..Default::default()
        }
    }

    /// Attempts actually made.
    pub fn attempts(&self) -> u32 {
        self.max_retries.max(1)
    }

    /// Wait after failed attempt `attempt` (1-indexed):
    /// `min(max_delay, initial_delay * multiplier^(attempt - 1))`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let exponent = i32::try_from(attempt - 1).unwrap_or(i32::MAX);
        let delay_ms =
            self.initial_delay.as_millis() as f64 * self.backoff_multiplier.powi(exponent);
        let max_ms = self.max_delay.as_millis() as f64;

        if !delay_ms.is_finite() || delay_ms >= max_ms {
            return self.max_delay;
        }
        Duration::from_millis(delay_ms.max(0.0) as u64)
    }
}

/// Outcome of delivering one envelope to one recipient.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeliveryResult {
    pub recipient: Recipient,
    pub success: bool,
    pub attempts: u32,
    pub provider_id: Option<ProviderMessageId>,
    pub last_error: Option<String>,
    /// A failed delivery is held in the dead-letter store. `false` on a
    /// failure means the store write failed too and the message is lost.
    pub dead_lettered: bool,
}

impl DeliveryResult {
    fn delivered(recipient: &Recipient, attempts: u32, provider_id: ProviderMessageId) -> Self {
        Self {
            recipient: recipient.clone(),
            success: true,
            attempts,
            provider_id: Some(provider_id),
            last_error: None,
            dead_lettered: false,
        }
    }

    fn failed(recipient: &Recipient, attempts: u32, reason: String, dead_lettered: bool) -> Self {
        Self {
            recipient: recipient.clone(),
            success: false,
            attempts,
            provider_id: None,
            last_error: Some(reason),
            dead_lettered,
        }
    }
}

/// Outcome of fanning one envelope out to many recipients.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BroadcastResult {
    pub successful: Vec<DeliveryResult>,
    pub failed: Vec<DeliveryResult>,
    /// Failed results actually held in the dead-letter store.
    pub dead_letter_count: usize,
}

impl BroadcastResult {
    pub fn total(&self) -> usize {
        self.successful.len() + self.failed.len()
    }
}

#[derive(Debug, thiserror::Error)]
enum AttemptFailure {
    #[error("circuit breaker '{0}' is open")]
    CircuitOpen(String),
    #[error(transparent)]
    Upstream(#[from] SendError),
}

/// Delivers messages through one upstream sender.
///
/// Each attempt first asks the breaker for permission; a refused attempt
/// still spends retry budget. A delivery that fails every attempt is written
/// to the dead-letter store and reported as a failed [`DeliveryResult`];
/// `deliver` never returns an error. If that write fails the result says so
/// through `dead_lettered`.
pub struct DeliveryPipeline<S, D> {
    sender: S,
    dead_letters: D,
    breaker: Arc<CircuitBreaker>,
    policy: RetryPolicy,
    clock: SharedClock,
}

impl<S, D> DeliveryPipeline<S, D>
where
    S: MessageSender,
    D: DeadLetterStore,
{
    pub fn new(
        sender: S,
        dead_letters: D,
        breaker: Arc<CircuitBreaker>,
        clock: SharedClock,
    ) -> Self {
        Self {
            sender,
            dead_letters,
            breaker,
            policy: RetryPolicy::default(),
            clock,
        }
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    /// Deliver with the pipeline's default retry policy.
    pub async fn deliver(&self, envelope: &Envelope, recipient: &Recipient) -> DeliveryResult {
        self.deliver_with(envelope, recipient, &self.policy).await
    }

    #[instrument(
        name = "deliver",
        skip_all,
        fields(
            message_id = %envelope.message_id,
            tenant_id = %envelope.tenant_id,
            recipient = %recipient,
        )
    )]
    pub async fn deliver_with(
        &self,
        envelope: &Envelope,
        recipient: &Recipient,
        policy: &RetryPolicy,
    ) -> DeliveryResult {
        match self.attempt_all(envelope, recipient, policy).await {
            Ok((attempt, provider_id)) => {
                DeliveryResult::delivered(recipient, attempt, provider_id)
            }
            Err(last_error) => {
                let attempts = policy.attempts();
                let now = self.clock.now();
                let entry = DeadLetterEntry::new(envelope, recipient, &last_error, attempts, now);
                let dead_lettered = self.store_dead_letter(&entry).await;
                DeliveryResult::failed(recipient, attempts, last_error, dead_lettered)
            }
        }
    }

    /// Run the retry loop. `Ok` carries the successful attempt number, `Err`
    /// the last error once every attempt failed.
    async fn attempt_all(
        &self,
        envelope: &Envelope,
        recipient: &Recipient,
        policy: &RetryPolicy,
    ) -> Result<(u32, ProviderMessageId), String> {
        let max_attempts = policy.attempts();
        let mut last_error = String::new();

        for attempt in 1..=max_attempts {
            let current = DeliveryAttempt {
                envelope,
                recipient,
                attempt,
                backoff: policy.delay_for_attempt(attempt),
            };

            match self.attempt(&current).await {
                Ok(provider_id) => {
                    info!(attempt, provider_id = %provider_id, "message delivered");
                    return Ok((attempt, provider_id));
                }
                Err(failure) => {
                    warn!(attempt, max_attempts, error = %failure, "delivery attempt failed");
                    last_error = failure.to_string();
                }
            }

            if attempt < max_attempts {
                debug!(attempt, backoff_ms = current.backoff.as_millis() as u64, "backing off");
                tokio::time::sleep(current.backoff).await;
            }
        }

        Err(last_error)
    }

    async fn attempt(
        &self,
        current: &DeliveryAttempt<'_>,
    ) -> Result<ProviderMessageId, AttemptFailure> {
        if !self.breaker.can_attempt() {
            return Err(AttemptFailure::CircuitOpen(self.breaker.name().to_string()));
        }

        let envelope = current.envelope;
        match self
            .sender
            .send(current.recipient, &envelope.body, envelope.tenant_id)
            .await
        {
            Ok(provider_id) => {
                self.breaker.record_success();
                Ok(provider_id)
            }
            Err(e) => {
                self.breaker.record_failure();
                Err(e.into())
            }
        }
    }

    /// Returns whether the entry was persisted.
    async fn store_dead_letter(&self, entry: &DeadLetterEntry) -> bool {
        match self.dead_letters.put(entry).await {
            Ok(()) => {
                warn!(
                    dead_letter_id = %entry.id,
                    attempts = entry.attempts,
                    reason = %entry.reason,
                    "delivery dead-lettered"
                );
                true
            }
            Err(e) => {
                error!(
                    dead_letter_id = %entry.id,
                    error = %e,
                    "failed to persist dead letter; message lost"
                );
                false
            }
        }
    }

    /// Deliver to every recipient concurrently with the default policy.
    pub async fn deliver_many(
        &self,
        envelope: &Envelope,
        recipients: &[Recipient],
    ) -> BroadcastResult {
        self.deliver_many_with(envelope, recipients, &self.policy).await
    }

    /// Fan out one delivery per recipient and wait for all of them. One
    /// recipient's failure never aborts the others.
    pub async fn deliver_many_with(
        &self,
        envelope: &Envelope,
        recipients: &[Recipient],
        policy: &RetryPolicy,
    ) -> BroadcastResult {
        let results = join_all(
            recipients
                .iter()
                .map(|recipient| self.deliver_with(envelope, recipient, policy)),
        )
        .await;

        let (successful, failed): (Vec<_>, Vec<_>) = results.into_iter().partition(|r| r.success);
        let dead_letter_count = failed.iter().filter(|r| r.dead_lettered).count();
        let lost = failed.len() - dead_letter_count;
        if lost > 0 {
            error!(
                message_id = %envelope.message_id,
                lost,
                "failed deliveries could not be dead-lettered"
            );
        }

        info!(
            message_id = %envelope.message_id,
            tenant_id = %envelope.tenant_id,
            successful = successful.len(),
            failed = failed.len(),
            dead_letter_count,
            "broadcast finished"
        );

        BroadcastResult {
            successful,
            failed,
            dead_letter_count,
        }
    }

    /// Most recently enqueued first.
    pub async fn list_dead_letters(
        &self,
        limit: usize,
    ) -> Result<Vec<DeadLetterEntry>, DeliveryError> {
        self.dead_letters.list_recent(limit).await
    }

    /// Longest waiting first.
    pub async fn oldest_dead_letters(
        &self,
        limit: usize,
    ) -> Result<Vec<DeadLetterEntry>, DeliveryError> {
        self.dead_letters.list_oldest(limit).await
    }

    /// Dead letters belonging to one logical message, one per failed recipient.
    pub async fn dead_letters_for(
        &self,
        message_id: MessageId,
    ) -> Result<Vec<DeadLetterEntry>, DeliveryError> {
        self.dead_letters.list_for_message(message_id).await
    }

    /// Re-deliver a dead letter with the default policy.
    pub async fn replay(&self, entry_id: &DeadLetterId) -> Result<DeliveryResult, DeliveryError> {
        self.replay_with(entry_id, &self.policy).await
    }

    /// Re-deliver a dead letter with `policy`.
    ///
    /// The entry is removed only if delivery succeeds. A failed replay is
    /// folded into the existing entry, which keeps its enqueue time and so
    /// its original expiry.
    #[instrument(skip_all, fields(dead_letter_id = %entry_id))]
    pub async fn replay_with(
        &self,
        entry_id: &DeadLetterId,
        policy: &RetryPolicy,
    ) -> Result<DeliveryResult, DeliveryError> {
        let mut entry = self
            .dead_letters
            .get(entry_id)
            .await?
            .ok_or_else(|| DeliveryError::NotFound(entry_id.clone()))?;

        match self.attempt_all(&entry.envelope(), &entry.recipient, policy).await {
            Ok((attempt, provider_id)) => {
                if let Err(e) = self.dead_letters.remove(entry_id).await {
                    // Delivered but still listed; a later replay would resend.
                    warn!(error = %e, "failed to remove replayed dead letter");
                } else {
                    info!("dead letter replayed");
                }
                Ok(DeliveryResult::delivered(&entry.recipient, attempt, provider_id))
            }
            Err(last_error) => {
                let attempts = policy.attempts();
                entry.record_failed_replay(&last_error, attempts, self.clock.now());
                let still_held = match self.dead_letters.put(&entry).await {
                    Ok(()) => true,
                    Err(DeliveryError::Expired(_)) => {
                        warn!(replays = entry.replays, "dead letter retention elapsed; dropping");
                        if let Err(e) = self.dead_letters.remove(entry_id).await {
                            warn!(error = %e, "failed to drop expired dead letter");
                        }
                        false
                    }
                    Err(e) => {
                        // The previous version of the entry is still stored.
                        warn!(error = %e, "failed to record replay failure");
                        true
                    }
                };
                Ok(DeliveryResult::failed(&entry.recipient, attempts, last_error, still_held))
            }
        }
    }

    /// Drop a dead letter without delivering it.
    pub async fn discard_dead_letter(
        &self,
        entry_id: &DeadLetterId,
    ) -> Result<bool, DeliveryError> {
        let removed = self.dead_letters.remove(entry_id).await?;
        if removed {
            info!(dead_letter_id = %entry_id, "dead letter discarded");
        }
        Ok(removed)
    }
}
