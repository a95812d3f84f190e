//! Shared key-value store contract.
//!
//! The rate limiter, the dead-letter store and the job lock all keep their
//! state in a networked key-value store that is assumed to be occasionally
//! unavailable. This module defines that contract, the timeout wrapper every
//! caller goes through, and an in-memory implementation for tests/dev.
//!
//! Besides plain keys the store keeps ordered indexes: sets of members sorted
//! by an integer score (a Redis sorted set). The dead-letter store uses one
//! to list entries by age without scanning the keyspace.

use std::collections::{BTreeSet, HashMap};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use herald_core::{SharedClock, SystemClock};

/// Recommended upper bound for a single store round-trip.
pub const DEFAULT_STORE_TIMEOUT: Duration = Duration::from_secs(2);

/// Shared store error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("store call timed out after {0:?}")]
    Timeout(Duration),
    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Direction of an ordered-index read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexOrder {
    /// Lowest score first.
    Ascending,
    /// Highest score first.
    Descending,
}

/// Networked key-value store with expiry and the two atomic primitives the
/// job lock depends on.
///
/// Every plain write takes a TTL. Ordered indexes have no TTL; their owners
/// trim them by score.
#[async_trait]
pub trait SharedStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError>;

    /// Returns whether a key was removed.
    async fn delete(&self, key: &str) -> Result<bool, StoreError>;

    async fn exists(&self, key: &str) -> Result<bool, StoreError>;

    /// Atomically set `key` only if it does not exist. Returns whether the
    /// value was written.
    async fn set_if_absent_with_ttl(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError>;

    /// Atomically delete `key` only if its current value equals `expected`.
    async fn delete_if_equals(&self, key: &str, expected: &str) -> Result<bool, StoreError>;

    /// Atomically replace the value of `key` if it currently equals
    /// `expected` (`None` = key absent). Returns whether the swap happened.
    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&str>,
        new: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError>;

    async fn list_keys_by_prefix(&self, prefix: &str) -> Result<Vec<String>, StoreError>;

    /// Add `member` to the index at `key`, or move it to `score` if present.
    async fn index_insert(&self, key: &str, member: &str, score: i64) -> Result<(), StoreError>;

    /// Returns whether `member` was present.
    async fn index_remove(&self, key: &str, member: &str) -> Result<bool, StoreError>;

    /// Up to `limit` members in `order`, after skipping `offset`. Equal
    /// scores are ordered by member.
    async fn index_range(
        &self,
        key: &str,
        order: IndexOrder,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<String>, StoreError>;

    /// Drop every member scored below `min_score`; returns how many went.
    async fn index_trim_below(&self, key: &str, min_score: i64) -> Result<usize, StoreError>;
}

#[async_trait]
impl<S> SharedStore for Arc<S>
where
    S: SharedStore + ?Sized,
{
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        (**self).get(key).await
    }

    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError> {
        (**self).set_with_ttl(key, value, ttl).await
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        (**self).delete(key).await
    }

    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        (**self).exists(key).await
    }

    async fn set_if_absent_with_ttl(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        (**self).set_if_absent_with_ttl(key, value, ttl).await
    }

    async fn delete_if_equals(&self, key: &str, expected: &str) -> Result<bool, StoreError> {
        (**self).delete_if_equals(key, expected).await
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&str>,
        new: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        (**self).compare_and_swap(key, expected, new, ttl).await
    }

    async fn list_keys_by_prefix(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        (**self).list_keys_by_prefix(prefix).await
    }

    async fn index_insert(&self, key: &str, member: &str, score: i64) -> Result<(), StoreError> {
        (**self).index_insert(key, member, score).await
    }

    async fn index_remove(&self, key: &str, member: &str) -> Result<bool, StoreError> {
        (**self).index_remove(key, member).await
    }

    async fn index_range(
        &self,
        key: &str,
        order: IndexOrder,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<String>, StoreError> {
        (**self).index_range(key, order, offset, limit).await
    }

    async fn index_trim_below(&self, key: &str, min_score: i64) -> Result<usize, StoreError> {
        (**self).index_trim_below(key, min_score).await
    }
}

/// Bound a store call by `limit`, mapping elapsed deadlines to
/// [`StoreError::Timeout`].
pub async fn with_timeout<T, F>(limit: Duration, call: F) -> Result<T, StoreError>
where
    F: Future<Output = Result<T, StoreError>>,
{
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(StoreError::Timeout(limit)),
    }
}

#[derive(Debug, Clone)]
struct StoredValue {
    value: String,
    expires_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct OrderedIndex {
    scores: HashMap<String, i64>,
    ordered: BTreeSet<(i64, String)>,
}

impl OrderedIndex {
    fn insert(&mut self, member: &str, score: i64) {
        if let Some(previous) = self.scores.insert(member.to_string(), score) {
            self.ordered.remove(&(previous, member.to_string()));
        }
        self.ordered.insert((score, member.to_string()));
    }

    fn remove(&mut self, member: &str) -> bool {
        match self.scores.remove(member) {
            Some(score) => self.ordered.remove(&(score, member.to_string())),
            None => false,
        }
    }

    fn trim_below(&mut self, min_score: i64) -> usize {
        let keep = self.ordered.split_off(&(min_score, String::new()));
        let dropped = std::mem::replace(&mut self.ordered, keep);
        for (_, member) in &dropped {
            self.scores.remove(member);
        }
        dropped.len()
    }
}

/// In-memory shared store for tests/dev.
///
/// Expiry follows the injected clock, so a `ManualClock` makes TTL behaviour
/// deterministic. `simulate_outage(true)` makes every call fail with
/// [`StoreError::Unavailable`].
#[derive(Debug)]
pub struct InMemorySharedStore {
    entries: RwLock<HashMap<String, StoredValue>>,
    indexes: RwLock<HashMap<String, OrderedIndex>>,
    clock: SharedClock,
    outage: AtomicBool,
}

impl InMemorySharedStore {
    pub fn new() -> Self {
        Self::with_clock(SystemClock::shared())
    }

    pub fn with_clock(clock: SharedClock) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            indexes: RwLock::new(HashMap::new()),
            clock,
            outage: AtomicBool::new(false),
        }
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    pub fn simulate_outage(&self, down: bool) {
        self.outage.store(down, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.outage.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("simulated outage".to_string()));
        }
        Ok(())
    }

    fn expiry(&self, ttl: Duration) -> DateTime<Utc> {
        self.clock.now() + chrono::Duration::from_std(ttl).unwrap_or_default()
    }

    fn live_value(&self, map: &HashMap<String, StoredValue>, key: &str) -> Option<String> {
        let now = self.clock.now();
        map.get(key)
            .filter(|v| v.expires_at > now)
            .map(|v| v.value.clone())
    }
}

impl Default for InMemorySharedStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SharedStore for InMemorySharedStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.check_available()?;
        let map = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        Ok(self.live_value(&map, key))
    }

    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError> {
        self.check_available()?;
        let expires_at = self.expiry(ttl);
        let mut map = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        map.insert(
            key.to_string(),
            StoredValue {
                value: value.to_string(),
                expires_at,
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        self.check_available()?;
        let mut map = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let was_live = self.live_value(&map, key).is_some();
        map.remove(key);
        Ok(was_live)
    }

    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        Ok(self.get(key).await?.is_some())
    }

    async fn set_if_absent_with_ttl(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        self.compare_and_swap(key, None, value, ttl).await
    }

    async fn delete_if_equals(&self, key: &str, expected: &str) -> Result<bool, StoreError> {
        self.check_available()?;
        let mut map = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        if self.live_value(&map, key).as_deref() == Some(expected) {
            map.remove(key);
            return Ok(true);
        }
        Ok(false)
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&str>,
        new: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        self.check_available()?;
        let expires_at = self.expiry(ttl);
        let mut map = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        if self.live_value(&map, key).as_deref() != expected {
            return Ok(false);
        }
        map.insert(
            key.to_string(),
            StoredValue {
                value: new.to_string(),
                expires_at,
            },
        );
        Ok(true)
    }

    async fn list_keys_by_prefix(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        self.check_available()?;
        let now = self.clock.now();
        let mut map = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        map.retain(|_, v| v.expires_at > now);
        let mut keys: Vec<String> = map
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn index_insert(&self, key: &str, member: &str, score: i64) -> Result<(), StoreError> {
        self.check_available()?;
        let mut indexes = self.indexes.write().unwrap_or_else(PoisonError::into_inner);
        indexes.entry(key.to_string()).or_default().insert(member, score);
        Ok(())
    }

    async fn index_remove(&self, key: &str, member: &str) -> Result<bool, StoreError> {
        self.check_available()?;
        let mut indexes = self.indexes.write().unwrap_or_else(PoisonError::into_inner);
        let Some(index) = indexes.get_mut(key) else {
            return Ok(false);
        };
        let removed = index.remove(member);
        if index.scores.is_empty() {
            indexes.remove(key);
        }
        Ok(removed)
    }

    async fn index_range(
        &self,
        key: &str,
        order: IndexOrder,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<String>, StoreError> {
        self.check_available()?;
        let indexes = self.indexes.read().unwrap_or_else(PoisonError::into_inner);
        let Some(index) = indexes.get(key) else {
            return Ok(Vec::new());
        };
        let members = index.ordered.iter().map(|(_, member)| member.clone());
        Ok(match order {
            IndexOrder::Ascending => members.skip(offset).take(limit).collect(),
            IndexOrder::Descending => members.rev().skip(offset).take(limit).collect(),
        })
    }

    async fn index_trim_below(&self, key: &str, min_score: i64) -> Result<usize, StoreError> {
        self.check_available()?;
        let mut indexes = self.indexes.write().unwrap_or_else(PoisonError::into_inner);
        let Some(index) = indexes.get_mut(key) else {
            return Ok(0);
        };
        let dropped = index.trim_below(min_score);
        if index.scores.is_empty() {
            indexes.remove(key);
        }
        Ok(dropped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use herald_core::ManualClock;

    fn store_with_clock() -> (InMemorySharedStore, Arc<ManualClock>) {
        let clock = ManualClock::starting_now();
        (InMemorySharedStore::with_clock(clock.clone()), clock)
    }

    #[tokio::test]
    async fn values_expire_after_ttl() {
        let (store, clock) = store_with_clock();
        store
            .set_with_ttl("k", "v", Duration::from_secs(10))
            .await
            .unwrap();
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("v"));

        clock.advance(Duration::from_secs(10));
        assert!(store.get("k").await.unwrap().is_none());
        assert!(!store.exists("k").await.unwrap());
    }

    #[tokio::test]
    async fn set_if_absent_only_writes_once() {
        let (store, clock) = store_with_clock();
        let ttl = Duration::from_secs(5);

        assert!(store.set_if_absent_with_ttl("lock", "a", ttl).await.unwrap());
        assert!(!store.set_if_absent_with_ttl("lock", "b", ttl).await.unwrap());
        assert_eq!(store.get("lock").await.unwrap().as_deref(), Some("a"));

        // An expired key counts as absent.
        clock.advance(ttl);
        assert!(store.set_if_absent_with_ttl("lock", "b", ttl).await.unwrap());
    }

    #[tokio::test]
    async fn delete_if_equals_checks_value() {
        let (store, _clock) = store_with_clock();
        store
            .set_with_ttl("lock", "token-1", Duration::from_secs(5))
            .await
            .unwrap();

        assert!(!store.delete_if_equals("lock", "token-2").await.unwrap());
        assert!(store.exists("lock").await.unwrap());
        assert!(store.delete_if_equals("lock", "token-1").await.unwrap());
        assert!(!store.exists("lock").await.unwrap());
    }

    #[tokio::test]
    async fn compare_and_swap_rejects_stale_expectation() {
        let (store, _clock) = store_with_clock();
        let ttl = Duration::from_secs(5);

        assert!(store.compare_and_swap("b", None, "1", ttl).await.unwrap());
        assert!(!store.compare_and_swap("b", None, "2", ttl).await.unwrap());
        assert!(!store.compare_and_swap("b", Some("0"), "2", ttl).await.unwrap());
        assert!(store.compare_and_swap("b", Some("1"), "2", ttl).await.unwrap());
        assert_eq!(store.get("b").await.unwrap().as_deref(), Some("2"));
    }

    #[tokio::test]
    async fn lists_live_keys_by_prefix() {
        let (store, clock) = store_with_clock();
        store.set_with_ttl("dlq:a", "1", Duration::from_secs(1)).await.unwrap();
        store.set_with_ttl("dlq:b", "2", Duration::from_secs(60)).await.unwrap();
        store.set_with_ttl("lock:x", "3", Duration::from_secs(60)).await.unwrap();

        assert_eq!(
            store.list_keys_by_prefix("dlq:").await.unwrap(),
            vec!["dlq:a".to_string(), "dlq:b".to_string()]
        );

        clock.advance(Duration::from_secs(2));
        assert_eq!(
            store.list_keys_by_prefix("dlq:").await.unwrap(),
            vec!["dlq:b".to_string()]
        );
    }

    #[tokio::test]
    async fn index_orders_by_score_then_member() {
        let store = InMemorySharedStore::new();
        store.index_insert("idx", "c", 30).await.unwrap();
        store.index_insert("idx", "a", 10).await.unwrap();
        store.index_insert("idx", "b", 10).await.unwrap();

        let asc = store.index_range("idx", IndexOrder::Ascending, 0, 10).await.unwrap();
        assert_eq!(asc, vec!["a", "b", "c"]);
        let desc = store.index_range("idx", IndexOrder::Descending, 1, 1).await.unwrap();
        assert_eq!(desc, vec!["b"]);

        // Re-inserting moves the member instead of duplicating it.
        store.index_insert("idx", "a", 40).await.unwrap();
        let asc = store.index_range("idx", IndexOrder::Ascending, 0, usize::MAX).await.unwrap();
        assert_eq!(asc, vec!["b", "c", "a"]);
    }

    #[tokio::test]
    async fn index_trim_and_remove() {
        let store = InMemorySharedStore::new();
        for (member, score) in [("a", 1), ("b", 2), ("c", 3)] {
            store.index_insert("idx", member, score).await.unwrap();
        }

        assert_eq!(store.index_trim_below("idx", 3).await.unwrap(), 2);
        assert!(store.index_remove("idx", "c").await.unwrap());
        assert!(!store.index_remove("idx", "c").await.unwrap());
        assert!(
            store
                .index_range("idx", IndexOrder::Ascending, 0, 10)
                .await
                .unwrap()
                .is_empty()
        );
    }

    #[tokio::test]
    async fn outage_fails_every_call() {
        let store = InMemorySharedStore::new();
        store.simulate_outage(true);
        assert!(matches!(
            store.get("k").await,
            Err(StoreError::Unavailable(_))
        ));
        store.simulate_outage(false);
        assert!(store.get("k").await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn with_timeout_maps_elapsed_deadline() {
        let slow = async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok::<_, StoreError>(())
        };
        let err = with_timeout(Duration::from_secs(2), slow).await.unwrap_err();
        assert_eq!(err, StoreError::Timeout(Duration::from_secs(2)));
    }
}
