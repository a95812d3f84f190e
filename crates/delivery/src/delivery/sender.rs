//! Upstream carrier contract.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use herald_core::TenantId;

use super::envelope::Recipient;

/// Identifier the carrier assigns to an accepted message.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProviderMessageId(pub String);

impl core::fmt::Display for ProviderMessageId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SendError {
    #[error("carrier rejected message: {0}")]
    Rejected(String),
    #[error("carrier unavailable: {0}")]
    Unavailable(String),
    #[error("carrier call timed out")]
    Timeout,
}

/// The single upstream call the delivery pipeline protects.
#[async_trait]
pub trait MessageSender: Send + Sync {
    async fn send(
        &self,
        to: &Recipient,
        body: &str,
        tenant_id: TenantId,
    ) -> Result<ProviderMessageId, SendError>;
}

#[async_trait]
impl<S> MessageSender for Arc<S>
where
    S: MessageSender + ?Sized,
{
    async fn send(
        &self,
        to: &Recipient,
        body: &str,
        tenant_id: TenantId,
    ) -> Result<ProviderMessageId, SendError> {
        (**self).send(to, body, tenant_id).await
    }
}

/// A call observed by [`ScriptedSender`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentMessage {
    pub to: Recipient,
    pub body: String,
    pub tenant_id: TenantId,
}

/// Scripted sender for tests/dev.
///
/// Succeeds by default. Can fail the next N calls, fail every call, or fail
/// specific recipients, optionally after a simulated carrier latency. Every
/// call is recorded, including failed ones.
#[derive(Debug, Default)]
pub struct ScriptedSender {
    fail_next: AtomicU32,
    always_fail: AtomicBool,
    latency_ms: AtomicU64,
    failing_recipients: Mutex<HashSet<Recipient>>,
    calls: Mutex<Vec<SentMessage>>,
}

impl ScriptedSender {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_first(n: u32) -> Self {
        let sender = Self::new();
        sender.fail_next.store(n, Ordering::SeqCst);
        sender
    }

    pub fn always_failing() -> Self {
        let sender = Self::new();
        sender.set_failing(true);
        sender
    }

    pub fn set_failing(&self, failing: bool) {
        self.always_fail.store(failing, Ordering::SeqCst);
    }

    /// Delay every call by `latency` (on the tokio clock).
    pub fn set_latency(&self, latency: Duration) {
        let ms = u64::try_from(latency.as_millis()).unwrap_or(u64::MAX);
        self.latency_ms.store(ms, Ordering::SeqCst);
    }

    pub fn fail_recipient(&self, recipient: Recipient) {
        self.failing_recipients
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(recipient);
    }

    pub fn calls(&self) -> Vec<SentMessage> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    fn should_fail(&self, to: &Recipient) -> bool {
        if self.always_fail.load(Ordering::SeqCst) {
            return true;
        }
        if self
            .failing_recipients
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(to)
        {
            return true;
        }
        self.fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl MessageSender for ScriptedSender {
    async fn send(
        &self,
        to: &Recipient,
        body: &str,
        tenant_id: TenantId,
    ) -> Result<ProviderMessageId, SendError> {
        let latency = self.latency_ms.load(Ordering::SeqCst);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }

        let call_number = {
            let mut calls = self.calls.lock().unwrap_or_else(PoisonError::into_inner);
            calls.push(SentMessage {
                to: to.clone(),
                body: body.to_string(),
                tenant_id,
            });
            calls.len()
        };

        if self.should_fail(to) {
            return Err(SendError::Unavailable(format!("scripted failure #{call_number}")));
        }
        Ok(ProviderMessageId(format!("scripted-{call_number}")))
    }
}
