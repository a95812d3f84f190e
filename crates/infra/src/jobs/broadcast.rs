//! Bounded worker pool for broadcast sends.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::{Semaphore, mpsc, oneshot};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info};

use herald_core::MessageId;
use herald_delivery::{Dispatch, SendReport, SendRequest};

/// Broadcast executor configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BroadcastExecutorConfig {
    /// Name for logging
    pub name: String,
    /// Maximum broadcasts dispatched at once
    pub max_concurrent: usize,
    /// Submitted broadcasts waiting for a slot
    pub queue_capacity: usize,
}

impl Default for BroadcastExecutorConfig {
    fn default() -> Self {
        Self {
            name: "broadcast-executor".to_string(),
            max_concurrent: 4,
            queue_capacity: 256,
        }
    }
}

impl BroadcastExecutorConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_max_concurrent(mut self, max: usize) -> Self {
        self.max_concurrent = max.max(1);
        self
    }

    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity.max(1);
        self
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BroadcastError {
    #[error("broadcast executor is shut down")]
    Closed,
    #[error("broadcast queue is full")]
    QueueFull,
    #[error("broadcast {0} ended without a report")]
    Dropped(MessageId),
}

/// Executor runtime statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BroadcastStats {
    pub broadcasts_processed: u64,
    /// Every recipient delivered.
    pub broadcasts_succeeded: u64,
    /// At least one recipient failed or was rate limited.
    pub broadcasts_failed: u64,
    pub recipients_delivered: u64,
    pub recipients_failed: u64,
    pub recipients_rate_limited: u64,
    pub dead_lettered: u64,
    pub current_running: usize,
    pub uptime_secs: u64,
}

impl BroadcastStats {
    fn record(&mut self, report: &SendReport) {
        self.broadcasts_processed += 1;
        if report.is_complete_success() {
            self.broadcasts_succeeded += 1;
        } else {
            self.broadcasts_failed += 1;
        }
        self.recipients_delivered += report.successful.len() as u64;
        self.recipients_failed += report.failed.len() as u64;
        self.recipients_rate_limited += report.rate_limited.len() as u64;
        self.dead_lettered += report.dead_letter_count as u64;
    }
}

/// Completion handle for one submitted broadcast.
#[derive(Debug)]
pub struct BroadcastTicket {
    message_id: MessageId,
    report: oneshot::Receiver<SendReport>,
}

impl BroadcastTicket {
    pub fn message_id(&self) -> MessageId {
        self.message_id
    }

    /// Wait for the broadcast to finish.
    pub async fn wait(self) -> Result<SendReport, BroadcastError> {
        self.report
            .await
            .map_err(|_| BroadcastError::Dropped(self.message_id))
    }
}

struct Queued {
    request: SendRequest,
    reply: oneshot::Sender<SendReport>,
}

type SharedStats = Arc<Mutex<BroadcastStats>>;

fn lock_stats(stats: &SharedStats) -> std::sync::MutexGuard<'_, BroadcastStats> {
    stats.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Decrements `current_running` however the task ends.
struct RunningGuard(SharedStats);

impl RunningGuard {
    fn enter(stats: SharedStats) -> Self {
        lock_stats(&stats).current_running += 1;
        Self(stats)
    }
}

impl Drop for RunningGuard {
    fn drop(&mut self) {
        let mut s = lock_stats(&self.0);
        s.current_running = s.current_running.saturating_sub(1);
    }
}

/// Runs broadcasts as background tasks.
///
/// Submissions queue in a bounded channel; at most `max_concurrent`
/// dispatches run at once. Each submission returns a [`BroadcastTicket`]
/// resolving to the [`SendReport`].
#[derive(Debug)]
pub struct BroadcastExecutor {
    name: String,
    queue: mpsc::Sender<Queued>,
    join: JoinHandle<()>,
    stats: SharedStats,
    started: Instant,
}

impl BroadcastExecutor {
    /// Spawn the executor on the current tokio runtime.
    pub fn spawn(dispatcher: Arc<dyn Dispatch>, config: BroadcastExecutorConfig) -> Self {
        let (queue, rx) = mpsc::channel(config.queue_capacity.max(1));
        let stats = SharedStats::default();
        let join = tokio::spawn(executor_loop(
            config.name.clone(),
            dispatcher,
            rx,
            config.max_concurrent.max(1),
            stats.clone(),
        ));

        Self {
            name: config.name,
            queue,
            join,
            stats,
            started: Instant::now(),
        }
    }

    /// Queue a broadcast, waiting for queue space.
    pub async fn submit(&self, request: SendRequest) -> Result<BroadcastTicket, BroadcastError> {
        let (queued, ticket) = Self::ticket(request);
        self.queue
            .send(queued)
            .await
            .map_err(|_| BroadcastError::Closed)?;
        Ok(ticket)
    }

    /// Queue a broadcast without waiting; fails when the queue is full.
    pub fn try_submit(&self, request: SendRequest) -> Result<BroadcastTicket, BroadcastError> {
        let (queued, ticket) = Self::ticket(request);
        self.queue.try_send(queued).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => BroadcastError::QueueFull,
            mpsc::error::TrySendError::Closed(_) => BroadcastError::Closed,
        })?;
        Ok(ticket)
    }

    fn ticket(request: SendRequest) -> (Queued, BroadcastTicket) {
        let (reply, report) = oneshot::channel();
        let ticket = BroadcastTicket {
            message_id: request.envelope.message_id,
            report,
        };
        (Queued { request, reply }, ticket)
    }

    /// Get current executor statistics.
    pub fn stats(&self) -> BroadcastStats {
        let mut stats = lock_stats(&self.stats).clone();
        stats.uptime_secs = self.started.elapsed().as_secs();
        stats
    }

    /// Stop accepting broadcasts, finish everything already queued, and wait.
    pub async fn shutdown(self) {
        drop(self.queue);
        if let Err(e) = self.join.await {
            error!(executor = %self.name, error = %e, "broadcast executor task failed");
        }
    }
}

async fn executor_loop(
    name: String,
    dispatcher: Arc<dyn Dispatch>,
    mut queue: mpsc::Receiver<Queued>,
    max_concurrent: usize,
    stats: SharedStats,
) {
    info!(executor = %name, max_concurrent, "broadcast executor started");
    let slots = Arc::new(Semaphore::new(max_concurrent));
    let mut running = JoinSet::new();

    while let Some(Queued { request, reply }) = queue.recv().await {
        let Ok(permit) = slots.clone().acquire_owned().await else {
            break;
        };
        while let Some(finished) = running.try_join_next() {
            log_join_failure(&name, finished);
        }

        let dispatcher = dispatcher.clone();
        let stats = stats.clone();
        let executor = name.clone();
        running.spawn(async move {
            let _permit = permit;
            let running_guard = RunningGuard::enter(stats.clone());
            let message_id = request.envelope.message_id;
            debug!(executor = %executor, message_id = %message_id, "broadcast started");

            let started = Instant::now();
            let report = dispatcher.dispatch(&request).await;
            lock_stats(&stats).record(&report);

            debug!(
                executor = %executor,
                message_id = %message_id,
                elapsed_ms = elapsed_ms(started.elapsed()),
                delivered = report.successful.len(),
                failed = report.failed.len(),
                rate_limited = report.rate_limited.len(),
                "broadcast finished"
            );
            drop(running_guard);
            // Submitter may have dropped its ticket.
            let _ = reply.send(report);
        });
    }

    while let Some(finished) = running.join_next().await {
        log_join_failure(&name, finished);
    }
    info!(executor = %name, "broadcast executor stopped");
}

fn log_join_failure(executor: &str, result: Result<(), tokio::task::JoinError>) {
    if let Err(e) = result {
        error!(executor, error = %e, "broadcast task panicked");
    }
}

fn elapsed_ms(elapsed: Duration) -> u64 {
    u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use herald_core::{ManualClock, TenantId, UserId};
    use herald_delivery::{
        CircuitBreaker, CircuitBreakerConfig, DeliveryPipeline, Envelope, InMemorySharedStore,
        OutboundDispatcher, RateLimitPolicy, RateLimiter, Recipient, ScriptedSender,
        SharedStoreDeadLetters,
    };

    /// Reports every recipient delivered after a short delay, tracking peak
    /// concurrency.
    #[derive(Default)]
    struct SlowDispatch {
        in_flight: AtomicUsize,
        peak: AtomicUsize,
    }

    #[async_trait]
    impl Dispatch for SlowDispatch {
        async fn dispatch(&self, request: &SendRequest) -> SendReport {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            SendReport {
                message_id: request.envelope.message_id,
                tenant_id: request.envelope.tenant_id,
                successful: Vec::new(),
                failed: Vec::new(),
                rate_limited: Vec::new(),
                dead_letter_count: 0,
            }
        }
    }

    fn request(recipients: usize) -> SendRequest {
        SendRequest::new(
            UserId::new(),
            Envelope::new(TenantId::new(), "hello"),
            (0..recipients)
                .map(|i| Recipient::new(format!("+1555{i:07}")).unwrap())
                .collect(),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn never_exceeds_max_concurrent() {
        let dispatch = Arc::new(SlowDispatch::default());
        let executor = BroadcastExecutor::spawn(
            dispatch.clone(),
            BroadcastExecutorConfig::default().with_max_concurrent(2),
        );

        let mut tickets = Vec::new();
        for _ in 0..6 {
            tickets.push(executor.submit(request(1)).await.unwrap());
        }
        for ticket in tickets {
            ticket.wait().await.unwrap();
        }

        assert!(dispatch.peak.load(Ordering::SeqCst) <= 2);
        let stats = executor.stats();
        assert_eq!(stats.broadcasts_processed, 6);
        assert_eq!(stats.current_running, 0);
        executor.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_drains_queued_broadcasts() {
        let dispatch = Arc::new(SlowDispatch::default());
        let executor = BroadcastExecutor::spawn(
            dispatch.clone(),
            BroadcastExecutorConfig::default().with_max_concurrent(1),
        );

        let tickets: Vec<_> = (0..3)
            .map(|_| executor.try_submit(request(1)).unwrap())
            .collect();
        executor.shutdown().await;

        for ticket in tickets {
            assert!(ticket.wait().await.is_ok());
        }
    }

    #[tokio::test(start_paused = true)]
    async fn try_submit_reports_full_queue() {
        let dispatch = Arc::new(SlowDispatch::default());
        let executor = BroadcastExecutor::spawn(
            dispatch,
            BroadcastExecutorConfig::default()
                .with_max_concurrent(1)
                .with_queue_capacity(1),
        );

        let mut outcomes = Vec::new();
        for _ in 0..4 {
            outcomes.push(executor.try_submit(request(1)));
        }
        assert!(
            outcomes
                .iter()
                .any(|o| matches!(o, Err(BroadcastError::QueueFull)))
        );
        executor.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn reports_flow_through_the_real_dispatcher() {
        let clock = ManualClock::starting_now();
        let store = Arc::new(InMemorySharedStore::with_clock(clock.clone()));
        let sender = Arc::new(ScriptedSender::new());
        let pipeline = DeliveryPipeline::new(
            sender.clone(),
            SharedStoreDeadLetters::new(store.clone()),
            Arc::new(CircuitBreaker::new(
                "sms-carrier",
                CircuitBreakerConfig::default(),
                clock.clone(),
            )),
            clock.clone(),
        );
        let dispatcher = OutboundDispatcher::new(RateLimiter::new(store, clock), pipeline)
            .with_rate_policy(RateLimitPolicy::new("sms_send", 3, Duration::from_secs(3600)));
        let executor =
            BroadcastExecutor::spawn(Arc::new(dispatcher), BroadcastExecutorConfig::default());

        let report = executor.submit(request(5)).await.unwrap().wait().await.unwrap();

        assert_eq!(report.successful.len(), 3);
        assert_eq!(report.rate_limited.len(), 2);
        assert_eq!(sender.call_count(), 3);

        let stats = executor.stats();
        assert_eq!(stats.broadcasts_failed, 1);
        assert_eq!(stats.recipients_delivered, 3);
        assert_eq!(stats.recipients_rate_limited, 2);
        executor.shutdown().await;
    }
}
