//! Infrastructure layer: configuration, Redis adapters, background jobs.

pub mod config;
pub mod jobs;
pub mod sender;

/// Redis adapters (shared store, violation trail).
#[cfg(feature = "redis")]
pub mod redis;

pub use config::{AppConfig, ConfigError, DeadLetterSweepConfig};
pub use sender::LoggingSender;
