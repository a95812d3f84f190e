//! Development sender that logs instead of calling a carrier.

use async_trait::async_trait;
use tracing::info;
use uuid::Uuid;

use herald_core::TenantId;
use herald_delivery::{MessageSender, ProviderMessageId, Recipient, SendError};

/// Accepts every message and logs it; for local runs without carrier
/// credentials.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingSender;

#[async_trait]
impl MessageSender for LoggingSender {
    async fn send(
        &self,
        to: &Recipient,
        body: &str,
        tenant_id: TenantId,
    ) -> Result<ProviderMessageId, SendError> {
        let provider_id = ProviderMessageId(format!("dev-{}", Uuid::new_v4()));
        info!(
            tenant_id = %tenant_id,
            to = %to,
            body_len = body.len(),
            provider_id = %provider_id,
            "message accepted by logging sender"
        );
        Ok(provider_id)
    }
}
