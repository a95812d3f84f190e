//! Background execution: broadcast worker pool and recurring maintenance.
//!
//! ## Components
//!
//! - `BroadcastExecutor`: bounded queue + concurrency-limited dispatch of
//!   send requests, with completion tickets and stats
//! - `RecurringJobRunner`: interval loops, one cluster-wide run per tick
//!   under the job lock
//! - `DeadLetterReplaySweep`: recovery job replaying dead letters

pub mod broadcast;
pub mod dead_letter_sweep;
pub mod recurring;

pub use broadcast::{
    BroadcastError, BroadcastExecutor, BroadcastExecutorConfig, BroadcastStats, BroadcastTicket,
};
pub use dead_letter_sweep::{
    DEAD_LETTER_SWEEP_JOB, DEFAULT_SWEEP_BUDGET, DeadLetterReplaySweep, SweepSummary,
};
pub use recurring::{
    JobRunStats, JobSchedule, RecurringJob, RecurringJobRunner, RecurringJobRunnerHandle,
    TickOutcome,
};
