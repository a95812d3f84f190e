//! Message, recipient and per-attempt types.

use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use herald_core::{DomainError, DomainResult, MessageId, TenantId};

/// Destination address (a phone number in E.164 form for SMS/MMS).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Recipient(String);

impl Recipient {
    /// Trims whitespace and rejects empty addresses.
    pub fn new(address: impl AsRef<str>) -> DomainResult<Self> {
        let address = address.as_ref().trim();
        if address.is_empty() {
            return Err(DomainError::validation("recipient address is empty"));
        }
        if address.chars().any(char::is_whitespace) {
            return Err(DomainError::validation(format!(
                "recipient address contains whitespace: {address:?}"
            )));
        }
        Ok(Self(address.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for Recipient {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl core::fmt::Display for Recipient {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

/// One logical outbound message, shared by all of its recipients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub message_id: MessageId,
    pub tenant_id: TenantId,
    pub body: String,
}

impl Envelope {
    pub fn new(tenant_id: TenantId, body: impl Into<String>) -> Self {
        Self {
            message_id: MessageId::new(),
            tenant_id,
            body: body.into(),
        }
    }

    pub fn with_message_id(mut self, message_id: MessageId) -> Self {
        self.message_id = message_id;
        self
    }
}

/// A single iteration of the retry loop. Never persisted.
#[derive(Debug, Clone, Copy)]
pub struct DeliveryAttempt<'a> {
    pub envelope: &'a Envelope,
    pub recipient: &'a Recipient,
    /// 1-based.
    pub attempt: u32,
    /// Wait before the next attempt if this one fails.
    pub backoff: Duration,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recipient_is_trimmed_and_validated() {
        assert_eq!(Recipient::new(" +15550100 ").unwrap().as_str(), "+15550100");
        assert!(Recipient::new("   ").is_err());
        assert!("+1 555 0100".parse::<Recipient>().is_err());
    }
}
