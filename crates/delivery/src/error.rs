use crate::delivery::DeadLetterId;
use crate::store::StoreError;

/// Delivery pipeline error.
///
/// Only operator-facing operations (dead-letter listing, replay, discard)
/// return errors; `deliver` itself always produces a `DeliveryResult`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DeliveryError {
    #[error("dead letter not found: {0}")]
    NotFound(DeadLetterId),

    /// The entry's retention window has already elapsed.
    #[error("dead letter expired: {0}")]
    Expired(DeadLetterId),

    #[error("corrupt dead letter {id}: {reason}")]
    Corrupt { id: String, reason: String },

    #[error(transparent)]
    Store(#[from] StoreError),
}
