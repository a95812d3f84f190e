//! Maintenance worker: runs recurring delivery jobs under the cluster lock.
//!
//! Every replica runs the same schedule; the job lock makes sure each tick
//! executes on one replica only.

use std::future::Future;
use std::sync::Arc;

use tracing::info;

use herald_core::SystemClock;
use herald_delivery::{
    CircuitBreaker, DeliveryPipeline, DistributedJobLock, InMemorySharedStore, SharedStore,
    SharedStoreDeadLetters,
};
use herald_infra::jobs::{DeadLetterReplaySweep, JobSchedule, RecurringJobRunner};
use herald_infra::{AppConfig, LoggingSender};

/// Connect to the configured store and run until `shutdown` resolves.
pub async fn run<F>(config: AppConfig, shutdown: F) -> anyhow::Result<()>
where
    F: Future<Output = ()>,
{
    match config.redis_url.clone() {
        Some(url) => run_with_redis(url, config, shutdown).await,
        None => {
            info!("no redis url configured; using in-memory store");
            run_with_store(InMemorySharedStore::arc(), config, shutdown).await
        }
    }
}

#[cfg(feature = "redis")]
async fn run_with_redis<F>(url: String, config: AppConfig, shutdown: F) -> anyhow::Result<()>
where
    F: Future<Output = ()>,
{
    let store = herald_infra::redis::RedisSharedStore::connect(&url).await?;
    info!("connected to redis");
    run_with_store(store, config, shutdown).await
}

#[cfg(not(feature = "redis"))]
async fn run_with_redis<F>(_url: String, _config: AppConfig, _shutdown: F) -> anyhow::Result<()>
where
    F: Future<Output = ()>,
{
    anyhow::bail!(
        "{} is set but herald-worker was built without the `redis` feature",
        herald_infra::config::REDIS_URL
    )
}

/// Wire the maintenance jobs over `store` and run until `shutdown` resolves.
pub async fn run_with_store<S, F>(store: S, config: AppConfig, shutdown: F) -> anyhow::Result<()>
where
    S: SharedStore + Clone + 'static,
    F: Future<Output = ()>,
{
    let reliability = &config.reliability;
    let clock = SystemClock::shared();

    let dead_letters = SharedStoreDeadLetters::new(store.clone())
        .with_retention(reliability.dead_letter_retention)
        .with_store_timeout(reliability.store_timeout)
        .with_clock(clock.clone());
    let breaker = Arc::new(CircuitBreaker::new(
        "sms-carrier",
        reliability.breaker.clone(),
        clock.clone(),
    ));
    let pipeline = Arc::new(
        DeliveryPipeline::new(LoggingSender, dead_letters, breaker, clock)
            .with_policy(reliability.retry.clone()),
    );

    let lock = Arc::new(
        DistributedJobLock::new(store).with_store_timeout(reliability.store_timeout),
    );
    // Half the lock TTL leaves room for the replay in flight at the deadline.
    let sweep = Arc::new(
        DeadLetterReplaySweep::new(pipeline, config.dead_letter_sweep.batch)
            .with_time_budget(reliability.lock_ttl / 2),
    );
    let schedule =
        JobSchedule::every(config.dead_letter_sweep.interval).with_lock_ttl(reliability.lock_ttl);
    let handle = RecurringJobRunner::new(lock).with_job(sweep, schedule).spawn();

    info!(
        sweep_interval_secs = config.dead_letter_sweep.interval.as_secs(),
        sweep_batch = config.dead_letter_sweep.batch,
        "worker started"
    );
    shutdown.await;

    info!(stats = ?handle.stats(), "worker shutting down");
    handle.shutdown().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use chrono::Utc;
    use herald_core::TenantId;
    use herald_delivery::{DeadLetterEntry, DeadLetterStore, Envelope, Recipient};

    #[tokio::test(start_paused = true)]
    async fn sweep_replays_dead_letters_until_shutdown() {
        let store = InMemorySharedStore::arc();
        let dead_letters = SharedStoreDeadLetters::new(store.clone());
        let envelope = Envelope::new(TenantId::new(), "queued while carrier was down");
        let entry = DeadLetterEntry::new(
            &envelope,
            &Recipient::new("+15550001").unwrap(),
            "carrier unavailable",
            3,
            Utc::now(),
        );
        dead_letters.put(&entry).await.unwrap();

        run_with_store(store, AppConfig::default(), tokio::time::sleep(Duration::from_secs(1)))
            .await
            .unwrap();

        assert!(dead_letters.get(&entry.id).await.unwrap().is_none());
    }

    #[cfg(not(feature = "redis"))]
    #[tokio::test]
    async fn redis_url_without_feature_is_an_error() {
        let config = AppConfig {
            redis_url: Some("redis://localhost:6379".to_string()),
            ..AppConfig::default()
        };
        assert!(run(config, async {}).await.is_err());
    }
}
