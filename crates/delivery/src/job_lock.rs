//! Cluster-wide mutual exclusion for scheduled jobs.
//!
//! A lock is a store key `lock:{job}` holding a random token, written with
//! set-if-absent and an expiry so a crashed holder cannot block the job
//! forever. Release is compare-and-delete: a holder whose lock already
//! expired and was taken over cannot remove the new holder's key.
//!
//! Any store failure or timeout during acquisition is treated as "not
//! acquired"; the job is skipped rather than risk running twice.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::time::Duration;

use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::store::{DEFAULT_STORE_TIMEOUT, SharedStore, with_timeout};

/// Default lock lifetime.
pub const DEFAULT_LOCK_TTL: Duration = Duration::from_secs(30);

const KEY_PREFIX: &str = "lock:";

/// Proof of holding a job lock.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LockToken(String);

impl LockToken {
    fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl core::fmt::Display for LockToken {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone)]
pub struct DistributedJobLock<S> {
    store: S,
    store_timeout: Duration,
}

impl<S: SharedStore> DistributedJobLock<S> {
    pub fn new(store: S) -> Self {
        Self {
            store,
            store_timeout: DEFAULT_STORE_TIMEOUT,
        }
    }

    pub fn with_store_timeout(mut self, timeout: Duration) -> Self {
        self.store_timeout = timeout;
        self
    }

    fn key(job: &str) -> String {
        format!("{KEY_PREFIX}{job}")
    }

    /// Try to take the lock for `job`. `None` if another holder has it or the
    /// store could not confirm.
    pub async fn acquire(&self, job: &str, ttl: Duration) -> Option<LockToken> {
        let token = LockToken::generate();
        let key = Self::key(job);
        match with_timeout(
            self.store_timeout,
            self.store.set_if_absent_with_ttl(&key, token.as_str(), ttl),
        )
        .await
        {
            Ok(true) => {
                debug!(job, "job lock acquired");
                Some(token)
            }
            Ok(false) => {
                debug!(job, "job lock held elsewhere");
                None
            }
            Err(e) => {
                warn!(job, error = %e, "job lock unavailable, not acquiring");
                None
            }
        }
    }

    /// Release `job` if `token` still owns it. Returns `true` if the key was
    /// deleted.
    pub async fn release(&self, job: &str, token: &LockToken) -> bool {
        let key = Self::key(job);
        match with_timeout(
            self.store_timeout,
            self.store.delete_if_equals(&key, token.as_str()),
        )
        .await
        {
            Ok(true) => {
                debug!(job, "job lock released");
                true
            }
            Ok(false) => {
                warn!(job, "job lock was no longer ours at release");
                false
            }
            Err(e) => {
                // The TTL reclaims it.
                warn!(job, error = %e, "failed to release job lock");
                false
            }
        }
    }

    /// Run `f` while holding the lock for `job`.
    ///
    /// Returns `None` without invoking `f` if the lock was not acquired. The
    /// lock is released whether `f` returns normally, returns an error value
    /// or panics; a panic is resumed after release.
    pub async fn with_lock<F, Fut, T>(&self, job: &str, ttl: Duration, f: F) -> Option<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let token = self.acquire(job, ttl).await?;
        // `f` itself may panic before yielding a future.
        let outcome = AssertUnwindSafe(async move { f().await }).catch_unwind().await;
        self.release(job, &token).await;
        match outcome {
            Ok(value) => Some(value),
            Err(panic) => std::panic::resume_unwind(panic),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemorySharedStore;
    use herald_core::ManualClock;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    async fn explode() -> u32 {
        panic!("job blew up")
    }

    fn explode_before_start() -> std::future::Ready<u32> {
        panic!("job failed to start")
    }

    fn lock() -> (DistributedJobLock<Arc<InMemorySharedStore>>, Arc<InMemorySharedStore>) {
        let store = InMemorySharedStore::arc();
        (DistributedJobLock::new(store.clone()), store)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_acquires_yield_one_token() {
        let (lock, _) = lock();
        let lock = Arc::new(lock);

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let lock = lock.clone();
                tokio::spawn(async move { lock.acquire("nightly-report", DEFAULT_LOCK_TTL).await })
            })
            .collect();

        let mut acquired = 0;
        for handle in handles {
            if handle.await.unwrap().is_some() {
                acquired += 1;
            }
        }
        assert_eq!(acquired, 1);
    }

    #[tokio::test]
    async fn release_then_reacquire() {
        let (lock, _) = lock();
        let token = lock.acquire("job", DEFAULT_LOCK_TTL).await.unwrap();
        assert!(lock.acquire("job", DEFAULT_LOCK_TTL).await.is_none());

        assert!(lock.release("job", &token).await);
        assert!(lock.acquire("job", DEFAULT_LOCK_TTL).await.is_some());
    }

    #[tokio::test]
    async fn stale_token_cannot_release_new_holder() {
        let clock = ManualClock::starting_now();
        let store = Arc::new(InMemorySharedStore::with_clock(clock.clone()));
        let lock = DistributedJobLock::new(store.clone());

        let stale = lock.acquire("job", Duration::from_secs(1)).await.unwrap();
        clock.advance(Duration::from_secs(2));
        let current = lock.acquire("job", DEFAULT_LOCK_TTL).await.unwrap();

        assert!(!lock.release("job", &stale).await);
        assert_eq!(store.get("lock:job").await.unwrap().as_deref(), Some(current.as_str()));
    }

    #[tokio::test]
    async fn with_lock_skips_when_held() {
        let (lock, _) = lock();
        let _held = lock.acquire("job", DEFAULT_LOCK_TTL).await.unwrap();
        let ran = AtomicU32::new(0);

        let result = lock
            .with_lock("job", DEFAULT_LOCK_TTL, || async {
                ran.fetch_add(1, Ordering::SeqCst);
            })
            .await;

        assert!(result.is_none());
        assert_eq!(ran.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn with_lock_releases_after_error_value() {
        let (lock, store) = lock();

        let result = lock
            .with_lock("job", DEFAULT_LOCK_TTL, || async { Err::<(), _>("boom") })
            .await;

        assert_eq!(result, Some(Err("boom")));
        assert!(!store.exists("lock:job").await.unwrap());
    }

    #[tokio::test]
    async fn with_lock_releases_after_panic() {
        let (lock, store) = lock();
        let lock = Arc::new(lock);

        let task_lock = lock.clone();
        let joined = tokio::spawn(async move {
            task_lock
                .with_lock("job", DEFAULT_LOCK_TTL, explode)
                .await
        })
        .await;

        assert!(joined.unwrap_err().is_panic());
        assert!(!store.exists("lock:job").await.unwrap());
        assert!(lock.acquire("job", DEFAULT_LOCK_TTL).await.is_some());
    }

    #[tokio::test]
    async fn with_lock_releases_when_closure_panics_before_its_future() {
        let (lock, store) = lock();
        let lock = Arc::new(lock);

        let task_lock = lock.clone();
        let joined = tokio::spawn(async move {
            task_lock
                .with_lock("job", DEFAULT_LOCK_TTL, explode_before_start)
                .await
        })
        .await;

        assert!(joined.unwrap_err().is_panic());
        assert!(!store.exists("lock:job").await.unwrap());
    }

    #[tokio::test]
    async fn store_outage_fails_closed() {
        let (lock, store) = lock();
        store.simulate_outage(true);

        let ran = AtomicU32::new(0);
        let result = lock
            .with_lock("job", DEFAULT_LOCK_TTL, || async {
                ran.fetch_add(1, Ordering::SeqCst);
            })
            .await;

        assert!(result.is_none());
        assert_eq!(ran.load(Ordering::SeqCst), 0);
    }
}
