//! `herald-core`: shared building blocks for the messaging platform.
//!
//! Identifiers, the domain error model and the clock abstraction. No IO lives
//! here; everything that talks to a store or a carrier is in `herald-delivery`
//! or `herald-infra`.

pub mod clock;
pub mod error;
pub mod id;

pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use error::{DomainError, DomainResult};
pub use id::{MessageId, TenantId, UserId};
