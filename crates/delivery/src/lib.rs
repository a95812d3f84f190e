//! `herald-delivery`: reliability primitives for outbound messaging.
//!
//! - [`rate_limiter`]: per-subject token buckets in the shared store
//! - [`circuit_breaker`]: per-upstream failure gating
//! - [`delivery`]: retrying delivery pipeline with dead letters and replay
//! - [`job_lock`]: cluster-wide lock for scheduled jobs
//! - [`dispatch`]: rate limit then deliver, for one send request
//!
//! All shared state lives behind the [`store::SharedStore`] contract; no
//! primitive is a global. Each is constructed with its store and clock and
//! injected where needed.

pub mod circuit_breaker;
pub mod config;
pub mod delivery;
pub mod dispatch;
pub mod error;
pub mod job_lock;
pub mod rate_limiter;
pub mod store;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState, CircuitStats};
pub use config::ReliabilityConfig;
pub use delivery::{
    BroadcastResult, DeadLetterEntry, DeadLetterId, DeadLetterStore, DeliveryPipeline,
    DeliveryResult, Envelope, MessageSender, ProviderMessageId, Recipient, RetryPolicy,
    ScriptedSender, SendError, SharedStoreDeadLetters,
};
pub use dispatch::{Dispatch, OutboundDispatcher, SendReport, SendRequest};
pub use error::DeliveryError;
pub use job_lock::{DEFAULT_LOCK_TTL, DistributedJobLock, LockToken};
pub use rate_limiter::{RateLimitPolicy, RateLimitStatus, RateLimiter};
pub use store::{InMemorySharedStore, IndexOrder, SharedStore, StoreError};
