//! Interval-driven maintenance jobs, one cluster-wide run per tick.
//!
//! Every registered job gets its own loop. Each tick tries the job's
//! [`DistributedJobLock`]; if another process holds it the tick is skipped.
//! Job failures (errors and panics) are logged and counted and never stop
//! the loop.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use herald_delivery::{DEFAULT_LOCK_TTL, DistributedJobLock, SharedStore};

/// A named unit of periodic maintenance work.
#[async_trait]
pub trait RecurringJob: Send + Sync {
    /// Lock name; must be identical across processes.
    fn name(&self) -> &str;

    async fn run(&self) -> anyhow::Result<()>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobSchedule {
    pub interval: Duration,
    /// Should exceed the job's worst-case run time.
    pub lock_ttl: Duration,
}

impl JobSchedule {
    pub fn every(interval: Duration) -> Self {
        Self {
            interval,
            lock_ttl: DEFAULT_LOCK_TTL,
        }
    }

    pub fn with_lock_ttl(mut self, ttl: Duration) -> Self {
        self.lock_ttl = ttl;
        self
    }
}

/// Result of a single tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    Completed,
    Failed(String),
    /// Lock held elsewhere or not confirmable.
    Skipped,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct JobRunStats {
    pub runs: u64,
    pub skipped: u64,
    pub failed: u64,
    pub last_run_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl JobRunStats {
    fn record(&mut self, outcome: &TickOutcome) {
        match outcome {
            TickOutcome::Completed => {
                self.runs += 1;
                self.last_run_at = Some(Utc::now());
            }
            TickOutcome::Failed(e) => {
                self.runs += 1;
                self.failed += 1;
                self.last_run_at = Some(Utc::now());
                self.last_error = Some(e.clone());
            }
            TickOutcome::Skipped => self.skipped += 1,
        }
    }
}

type SharedJobStats = Arc<Mutex<HashMap<String, JobRunStats>>>;

pub struct RecurringJobRunner<S> {
    lock: Arc<DistributedJobLock<S>>,
    jobs: Vec<(Arc<dyn RecurringJob>, JobSchedule)>,
}

impl<S: SharedStore + 'static> RecurringJobRunner<S> {
    pub fn new(lock: Arc<DistributedJobLock<S>>) -> Self {
        Self {
            lock,
            jobs: Vec::new(),
        }
    }

    pub fn register(&mut self, job: Arc<dyn RecurringJob>, schedule: JobSchedule) {
        self.jobs.push((job, schedule));
    }

    pub fn with_job(mut self, job: Arc<dyn RecurringJob>, schedule: JobSchedule) -> Self {
        self.register(job, schedule);
        self
    }

    /// Run `job` once under its lock.
    pub async fn run_once(&self, job: &dyn RecurringJob, schedule: &JobSchedule) -> TickOutcome {
        tick(&self.lock, job, schedule).await
    }

    /// Start one loop per job; the first tick fires immediately.
    pub fn spawn(self) -> RecurringJobRunnerHandle {
        let (shutdown, shutdown_rx) = watch::channel(false);
        let stats = SharedJobStats::default();

        let joins = self
            .jobs
            .into_iter()
            .map(|(job, schedule)| {
                tokio::spawn(job_loop(
                    self.lock.clone(),
                    job,
                    schedule,
                    shutdown_rx.clone(),
                    stats.clone(),
                ))
            })
            .collect();

        RecurringJobRunnerHandle {
            shutdown,
            joins,
            stats,
        }
    }
}

/// Handle for the running jobs (stats + shutdown).
#[derive(Debug)]
pub struct RecurringJobRunnerHandle {
    shutdown: watch::Sender<bool>,
    joins: Vec<JoinHandle<()>>,
    stats: SharedJobStats,
}

impl RecurringJobRunnerHandle {
    /// Per-job statistics keyed by job name.
    pub fn stats(&self) -> HashMap<String, JobRunStats> {
        self.stats
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn stats_for(&self, job: &str) -> Option<JobRunStats> {
        self.stats
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(job)
            .cloned()
    }

    /// Stop scheduling new ticks and wait for in-flight runs.
    pub async fn shutdown(self) {
        // Receivers may already be gone if every loop exited.
        let _ = self.shutdown.send(true);
        for join in self.joins {
            if let Err(e) = join.await {
                error!(error = %e, "recurring job loop failed");
            }
        }
    }
}

async fn tick<S: SharedStore>(
    lock: &DistributedJobLock<S>,
    job: &dyn RecurringJob,
    schedule: &JobSchedule,
) -> TickOutcome {
    let name = job.name();
    let guarded = lock.with_lock(name, schedule.lock_ttl, || job.run());

    match AssertUnwindSafe(guarded).catch_unwind().await {
        Ok(Some(Ok(()))) => {
            debug!(job = name, "recurring job completed");
            TickOutcome::Completed
        }
        Ok(Some(Err(e))) => {
            warn!(job = name, error = %e, "recurring job failed");
            TickOutcome::Failed(e.to_string())
        }
        Ok(None) => {
            debug!(job = name, "recurring job skipped; lock not acquired");
            TickOutcome::Skipped
        }
        Err(_) => {
            error!(job = name, "recurring job panicked");
            TickOutcome::Failed("job panicked".to_string())
        }
    }
}

async fn job_loop<S: SharedStore>(
    lock: Arc<DistributedJobLock<S>>,
    job: Arc<dyn RecurringJob>,
    schedule: JobSchedule,
    mut shutdown: watch::Receiver<bool>,
    stats: SharedJobStats,
) {
    let name = job.name().to_string();
    info!(job = %name, interval_secs = schedule.interval.as_secs(), "recurring job started");

    let mut interval = tokio::time::interval(schedule.interval);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = shutdown.changed() => break,
        }
        if *shutdown.borrow() {
            break;
        }

        let outcome = tick(&lock, job.as_ref(), &schedule).await;
        stats
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(name.clone())
            .or_default()
            .record(&outcome);
    }

    info!(job = %name, "recurring job stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    use herald_delivery::InMemorySharedStore;

    struct CountingJob {
        runs: AtomicU32,
        fail: bool,
    }

    impl CountingJob {
        fn new(fail: bool) -> Arc<Self> {
            Arc::new(Self {
                runs: AtomicU32::new(0),
                fail,
            })
        }
    }

    #[async_trait]
    impl RecurringJob for CountingJob {
        fn name(&self) -> &str {
            "counting"
        }

        async fn run(&self) -> anyhow::Result<()> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                anyhow::bail!("sweep failed");
            }
            Ok(())
        }
    }

    struct PanickingJob;

    #[async_trait]
    impl RecurringJob for PanickingJob {
        fn name(&self) -> &str {
            "panicking"
        }

        async fn run(&self) -> anyhow::Result<()> {
            panic!("job blew up");
        }
    }

    type TestLock = DistributedJobLock<Arc<InMemorySharedStore>>;

    fn runner() -> (RecurringJobRunner<Arc<InMemorySharedStore>>, Arc<TestLock>) {
        let lock = Arc::new(DistributedJobLock::new(InMemorySharedStore::arc()));
        (RecurringJobRunner::new(lock.clone()), lock)
    }

    #[tokio::test]
    async fn skips_when_another_process_holds_the_lock() {
        let (runner, lock) = runner();
        let job = CountingJob::new(false);
        let schedule = JobSchedule::every(Duration::from_secs(60));

        let _held = lock.acquire("counting", DEFAULT_LOCK_TTL).await.unwrap();
        assert_eq!(runner.run_once(job.as_ref(), &schedule).await, TickOutcome::Skipped);
        assert_eq!(job.runs.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn failures_and_panics_release_the_lock() {
        let (runner, lock) = runner();
        let schedule = JobSchedule::every(Duration::from_secs(60));

        let failing = CountingJob::new(true);
        assert!(matches!(
            runner.run_once(failing.as_ref(), &schedule).await,
            TickOutcome::Failed(_)
        ));
        assert!(lock.acquire("counting", DEFAULT_LOCK_TTL).await.is_some());

        assert!(matches!(
            runner.run_once(&PanickingJob, &schedule).await,
            TickOutcome::Failed(_)
        ));
        assert!(lock.acquire("panicking", DEFAULT_LOCK_TTL).await.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn runs_on_every_interval_until_shutdown() {
        let (runner, _) = runner();
        let job = CountingJob::new(false);
        let handle = runner
            .with_job(job.clone(), JobSchedule::every(Duration::from_secs(10)))
            .spawn();

        // Ticks at 0s, 10s, 20s.
        tokio::time::sleep(Duration::from_secs(25)).await;
        handle.shutdown().await;

        assert_eq!(job.runs.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn stats_track_runs_and_failures() {
        let (runner, _) = runner();
        let job = CountingJob::new(true);
        let handle = runner
            .with_job(job.clone(), JobSchedule::every(Duration::from_secs(10)))
            .spawn();

        tokio::time::sleep(Duration::from_secs(15)).await;
        let stats = handle.stats_for("counting").unwrap();
        handle.shutdown().await;

        assert_eq!(stats.runs, 2);
        assert_eq!(stats.failed, 2);
        assert_eq!(stats.skipped, 0);
        assert_eq!(stats.last_error.as_deref(), Some("sweep failed"));
    }
}
