//! Inbound send requests: rate limit per actor, then deliver.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{info, instrument};

use herald_core::{MessageId, TenantId, UserId};

use crate::delivery::{
    DeadLetterStore, DeliveryPipeline, DeliveryResult, Envelope, MessageSender, Recipient,
};
use crate::rate_limiter::{RateLimitPolicy, RateLimiter};
use crate::store::SharedStore;

/// "Send this message to these recipients" on behalf of an actor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendRequest {
    pub actor: UserId,
    pub envelope: Envelope,
    pub recipients: Vec<Recipient>,
}

impl SendRequest {
    pub fn new(actor: UserId, envelope: Envelope, recipients: Vec<Recipient>) -> Self {
        Self {
            actor,
            envelope,
            recipients,
        }
    }

    /// Rate-limit subject: the actor within its tenant.
    pub fn subject(&self) -> String {
        format!("{}:{}", self.envelope.tenant_id, self.actor)
    }
}

/// What happened to every recipient of one request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SendReport {
    pub message_id: MessageId,
    pub tenant_id: TenantId,
    pub successful: Vec<DeliveryResult>,
    pub failed: Vec<DeliveryResult>,
    /// Recipients never attempted because the actor was over its limit.
    pub rate_limited: Vec<Recipient>,
    pub dead_letter_count: usize,
}

impl SendReport {
    pub fn is_complete_success(&self) -> bool {
        self.failed.is_empty() && self.rate_limited.is_empty()
    }
}

/// Something that can carry out a [`SendRequest`].
#[async_trait]
pub trait Dispatch: Send + Sync {
    async fn dispatch(&self, request: &SendRequest) -> SendReport;
}

/// Rate limiter in front of a delivery pipeline.
pub struct OutboundDispatcher<L, S, D> {
    limiter: RateLimiter<L>,
    pipeline: DeliveryPipeline<S, D>,
    policy: RateLimitPolicy,
}

impl<L, S, D> OutboundDispatcher<L, S, D>
where
    L: SharedStore,
    S: MessageSender,
    D: DeadLetterStore,
{
    pub fn new(limiter: RateLimiter<L>, pipeline: DeliveryPipeline<S, D>) -> Self {
        Self {
            limiter,
            pipeline,
            policy: RateLimitPolicy::sms_send(),
        }
    }

    pub fn with_rate_policy(mut self, policy: RateLimitPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn limiter(&self) -> &RateLimiter<L> {
        &self.limiter
    }

    pub fn pipeline(&self) -> &DeliveryPipeline<S, D> {
        &self.pipeline
    }

    pub fn rate_policy(&self) -> &RateLimitPolicy {
        &self.policy
    }

    /// Admit recipients one token each, in order, then deliver the admitted
    /// ones concurrently.
    #[instrument(
        name = "dispatch",
        skip_all,
        fields(
            message_id = %request.envelope.message_id,
            tenant_id = %request.envelope.tenant_id,
            actor = %request.actor,
            recipients = request.recipients.len(),
        )
    )]
    pub async fn send(&self, request: &SendRequest) -> SendReport {
        let subject = request.subject();
        let mut admitted = Vec::with_capacity(request.recipients.len());
        let mut rate_limited = Vec::new();

        for recipient in &request.recipients {
            if self.limiter.admit(&subject, 1, &self.policy).await {
                admitted.push(recipient.clone());
            } else {
                rate_limited.push(recipient.clone());
            }
        }

        if !rate_limited.is_empty() {
            info!(rate_limited = rate_limited.len(), "recipients rejected by rate limit");
        }

        let outcome = self.pipeline.deliver_many(&request.envelope, &admitted).await;

        SendReport {
            message_id: request.envelope.message_id,
            tenant_id: request.envelope.tenant_id,
            successful: outcome.successful,
            failed: outcome.failed,
            rate_limited,
            dead_letter_count: outcome.dead_letter_count,
        }
    }
}

#[async_trait]
impl<L, S, D> Dispatch for OutboundDispatcher<L, S, D>
where
    L: SharedStore,
    S: MessageSender,
    D: DeadLetterStore,
{
    async fn dispatch(&self, request: &SendRequest) -> SendReport {
        self.send(request).await
    }
}
