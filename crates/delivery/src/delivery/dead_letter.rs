//! Dead-letter queue for deliveries that exhausted their retries.
//!
//! Entries live in the shared store under `dlq:{message_id}:{recipient}` and
//! expire `retention` after they were first enqueued. Rewriting an entry
//! (after a failed replay) keeps its original enqueue time, so a delivery
//! that never recovers still ages out. An ordered index scored by enqueue
//! time serves the age-ordered listings.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use herald_core::{MessageId, SharedClock, SystemClock, TenantId};

use super::envelope::{Envelope, Recipient};
use crate::error::DeliveryError;
use crate::store::{DEFAULT_STORE_TIMEOUT, IndexOrder, SharedStore, with_timeout};

/// How long a dead letter stays replayable.
pub const DEFAULT_DEAD_LETTER_RETENTION: Duration = Duration::from_secs(24 * 60 * 60);

const KEY_PREFIX: &str = "dlq:";
const INDEX_KEY: &str = "dlq-index";
const PAGE_SIZE: usize = 100;

/// Identity of one failed per-recipient delivery.
///
/// A broadcast shares one `MessageId` across recipients, so the recipient is
/// part of the id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeadLetterId(String);

impl DeadLetterId {
    pub fn for_delivery(message_id: MessageId, recipient: &Recipient) -> Self {
        Self(format!("{message_id}:{recipient}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn storage_key(&self) -> String {
        format!("{KEY_PREFIX}{}", self.0)
    }
}

impl From<String> for DeadLetterId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for DeadLetterId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl core::fmt::Display for DeadLetterId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A delivery that failed every attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    pub id: DeadLetterId,
    pub message_id: MessageId,
    pub tenant_id: TenantId,
    pub recipient: Recipient,
    pub body: String,
    /// Last error observed.
    pub reason: String,
    /// Attempts across the original delivery and every replay.
    pub attempts: u32,
    pub enqueued_at: DateTime<Utc>,
    #[serde(default)]
    pub replays: u32,
    #[serde(default)]
    pub last_replayed_at: Option<DateTime<Utc>>,
}

impl DeadLetterEntry {
    pub fn new(
        envelope: &Envelope,
        recipient: &Recipient,
        reason: impl Into<String>,
        attempts: u32,
        enqueued_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: DeadLetterId::for_delivery(envelope.message_id, recipient),
            message_id: envelope.message_id,
            tenant_id: envelope.tenant_id,
            recipient: recipient.clone(),
            body: envelope.body.clone(),
            reason: reason.into(),
            attempts,
            enqueued_at,
            replays: 0,
            last_replayed_at: None,
        }
    }

    /// Fold a failed replay into the entry. `enqueued_at` is left alone.
    pub fn record_failed_replay(
        &mut self,
        reason: impl Into<String>,
        attempts: u32,
        at: DateTime<Utc>,
    ) {
        self.reason = reason.into();
        self.attempts = self.attempts.saturating_add(attempts);
        self.replays = self.replays.saturating_add(1);
        self.last_replayed_at = Some(at);
    }

    /// Rebuild the envelope this entry was created from.
    pub fn envelope(&self) -> Envelope {
        Envelope {
            message_id: self.message_id,
            tenant_id: self.tenant_id,
            body: self.body.clone(),
        }
    }
}

/// Persistence for dead letters.
#[async_trait]
pub trait DeadLetterStore: Send + Sync {
    /// Insert or overwrite. Fails with [`DeliveryError::Expired`] if the
    /// entry is already past retention.
    async fn put(&self, entry: &DeadLetterEntry) -> Result<(), DeliveryError>;

    async fn get(&self, id: &DeadLetterId) -> Result<Option<DeadLetterEntry>, DeliveryError>;

    /// Most recently enqueued first, at most `limit` entries.
    async fn list_recent(&self, limit: usize) -> Result<Vec<DeadLetterEntry>, DeliveryError>;

    /// Longest waiting first, at most `limit` entries.
    async fn list_oldest(&self, limit: usize) -> Result<Vec<DeadLetterEntry>, DeliveryError>;

    /// Every entry of one message, oldest first.
    async fn list_for_message(
        &self,
        message_id: MessageId,
    ) -> Result<Vec<DeadLetterEntry>, DeliveryError>;

    /// Returns `true` if an entry was removed.
    async fn remove(&self, id: &DeadLetterId) -> Result<bool, DeliveryError>;
}

#[async_trait]
impl<D> DeadLetterStore for Arc<D>
where
    D: DeadLetterStore + ?Sized,
{
    async fn put(&self, entry: &DeadLetterEntry) -> Result<(), DeliveryError> {
        (**self).put(entry).await
    }

    async fn get(&self, id: &DeadLetterId) -> Result<Option<DeadLetterEntry>, DeliveryError> {
        (**self).get(id).await
    }

    async fn list_recent(&self, limit: usize) -> Result<Vec<DeadLetterEntry>, DeliveryError> {
        (**self).list_recent(limit).await
    }

    async fn list_oldest(&self, limit: usize) -> Result<Vec<DeadLetterEntry>, DeliveryError> {
        (**self).list_oldest(limit).await
    }

    async fn list_for_message(
        &self,
        message_id: MessageId,
    ) -> Result<Vec<DeadLetterEntry>, DeliveryError> {
        (**self).list_for_message(message_id).await
    }

    async fn remove(&self, id: &DeadLetterId) -> Result<bool, DeliveryError> {
        (**self).remove(id).await
    }
}

/// Dead-letter store over any [`SharedStore`], one JSON value per entry
/// plus an index of ids scored by enqueue time in milliseconds.
#[derive(Debug, Clone)]
pub struct SharedStoreDeadLetters<S> {
    store: S,
    retention: Duration,
    store_timeout: Duration,
    clock: SharedClock,
}

impl<S: SharedStore> SharedStoreDeadLetters<S> {
    pub fn new(store: S) -> Self {
        Self {
            store,
            retention: DEFAULT_DEAD_LETTER_RETENTION,
            store_timeout: DEFAULT_STORE_TIMEOUT,
            clock: SystemClock::shared(),
        }
    }

    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = retention;
        self
    }

    pub fn with_store_timeout(mut self, timeout: Duration) -> Self {
        self.store_timeout = timeout;
        self
    }

    /// Clock used to compute how much retention an entry has left.
    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    pub fn retention(&self) -> Duration {
        self.retention
    }

    fn retention_chrono(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.retention).unwrap_or(chrono::Duration::MAX)
    }

    /// Retention left for an entry enqueued at `enqueued_at`, if any.
    fn remaining_retention(&self, enqueued_at: DateTime<Utc>) -> Option<Duration> {
        let age = (self.clock.now() - enqueued_at).max(chrono::Duration::zero());
        (self.retention_chrono() - age)
            .to_std()
            .ok()
            .filter(|left| !left.is_zero())
    }

    fn decode(id: &str, raw: &str) -> Result<DeadLetterEntry, DeliveryError> {
        serde_json::from_str(raw).map_err(|e| DeliveryError::Corrupt {
            id: id.to_string(),
            reason: e.to_string(),
        })
    }

    async fn load(&self, id: &DeadLetterId) -> Result<Option<DeadLetterEntry>, DeliveryError> {
        let raw = with_timeout(self.store_timeout, self.store.get(&id.storage_key())).await?;
        raw.map(|json| Self::decode(id.as_str(), &json)).transpose()
    }

    /// Walk the index in `order` until `limit` live entries are collected.
    /// Ids whose entry has expired are dropped from the index on the way.
    async fn list_ordered(
        &self,
        order: IndexOrder,
        limit: usize,
    ) -> Result<Vec<DeadLetterEntry>, DeliveryError> {
        let mut entries = Vec::new();
        let mut offset = 0;

        while entries.len() < limit {
            let page = with_timeout(
                self.store_timeout,
                self.store.index_range(INDEX_KEY, order, offset, PAGE_SIZE),
            )
            .await?;
            if page.is_empty() {
                break;
            }

            let mut pruned = 0;
            for member in &page {
                let id = DeadLetterId::from(member.as_str());
                match self.load(&id).await {
                    Ok(Some(entry)) => entries.push(entry),
                    Ok(None) => {
                        with_timeout(self.store_timeout, self.store.index_remove(INDEX_KEY, member))
                            .await?;
                        pruned += 1;
                    }
                    Err(DeliveryError::Corrupt { id, reason }) => {
                        warn!(
                            dead_letter_id = %id,
                            reason = %reason,
                            "skipping unreadable dead letter"
                        );
                    }
                    Err(e) => return Err(e),
                }
                if entries.len() == limit {
                    break;
                }
            }
            offset += page.len() - pruned;
        }

        Ok(entries)
    }
}

#[async_trait]
impl<S: SharedStore> DeadLetterStore for SharedStoreDeadLetters<S> {
    async fn put(&self, entry: &DeadLetterEntry) -> Result<(), DeliveryError> {
        let Some(ttl) = self.remaining_retention(entry.enqueued_at) else {
            return Err(DeliveryError::Expired(entry.id.clone()));
        };
        let json = serde_json::to_string(entry).map_err(|e| DeliveryError::Corrupt {
            id: entry.id.to_string(),
            reason: e.to_string(),
        })?;

        let horizon = self
            .clock
            .now()
            .checked_sub_signed(self.retention_chrono())
            .map_or(i64::MIN, |at| at.timestamp_millis());
        let trimmed = with_timeout(
            self.store_timeout,
            self.store.index_trim_below(INDEX_KEY, horizon),
        )
        .await?;
        if trimmed > 0 {
            debug!(trimmed, "expired dead letters dropped from index");
        }

        // Index first: a dangling id is pruned on read, an unindexed entry
        // would never be listed.
        with_timeout(
            self.store_timeout,
            self.store.index_insert(
                INDEX_KEY,
                entry.id.as_str(),
                entry.enqueued_at.timestamp_millis(),
            ),
        )
        .await?;
        with_timeout(
            self.store_timeout,
            self.store.set_with_ttl(&entry.id.storage_key(), &json, ttl),
        )
        .await?;
        Ok(())
    }

    async fn get(&self, id: &DeadLetterId) -> Result<Option<DeadLetterEntry>, DeliveryError> {
        self.load(id).await
    }

    async fn list_recent(&self, limit: usize) -> Result<Vec<DeadLetterEntry>, DeliveryError> {
        self.list_ordered(IndexOrder::Descending, limit).await
    }

    async fn list_oldest(&self, limit: usize) -> Result<Vec<DeadLetterEntry>, DeliveryError> {
        self.list_ordered(IndexOrder::Ascending, limit).await
    }

    async fn list_for_message(
        &self,
        message_id: MessageId,
    ) -> Result<Vec<DeadLetterEntry>, DeliveryError> {
        let prefix = format!("{message_id}:");
        let ids = with_timeout(
            self.store_timeout,
            self.store.index_range(INDEX_KEY, IndexOrder::Ascending, 0, usize::MAX),
        )
        .await?;

        let mut entries = Vec::new();
        for id in ids.iter().filter(|id| id.starts_with(&prefix)) {
            if let Some(entry) = self.load(&DeadLetterId::from(id.as_str())).await? {
                entries.push(entry);
            }
        }
        Ok(entries)
    }

    async fn remove(&self, id: &DeadLetterId) -> Result<bool, DeliveryError> {
        let removed =
            with_timeout(self.store_timeout, self.store.delete(&id.storage_key())).await?;
        with_timeout(self.store_timeout, self.store.index_remove(INDEX_KEY, id.as_str())).await?;
        Ok(removed)
    }
}
