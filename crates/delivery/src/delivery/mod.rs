//! Message delivery: sender contract, retry pipeline and dead letters.

pub mod dead_letter;
pub mod envelope;
pub mod pipeline;
pub mod sender;

pub use dead_letter::{
    DEFAULT_DEAD_LETTER_RETENTION, DeadLetterEntry, DeadLetterId, DeadLetterStore,
    SharedStoreDeadLetters,
};
pub use envelope::{DeliveryAttempt, Envelope, Recipient};
pub use pipeline::{BroadcastResult, DeliveryPipeline, DeliveryResult, RetryPolicy};
pub use sender::{MessageSender, ProviderMessageId, ScriptedSender, SendError, SentMessage};
