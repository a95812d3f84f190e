//! `SharedStore` over Redis.
//!
//! - Plain writes: `SET key value PX ttl`
//! - Set-if-absent: `SET key value NX PX ttl`
//! - Compare-and-delete and compare-and-swap: Lua scripts, atomic on the server
//! - Prefix listing: cursor `SCAN MATCH prefix*`
//! - Ordered indexes: sorted sets (`ZADD`, `ZREM`, `ZRANGE`/`ZREVRANGE`,
//!   `ZREMRANGEBYSCORE`)

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::Script;
use tracing::instrument;

use herald_delivery::{IndexOrder, SharedStore, StoreError};

use super::{escape_glob, store_error, ttl_millis};

const SCAN_BATCH: usize = 200;

const COMPARE_AND_DELETE: &str = r"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('DEL', KEYS[1])
end
return 0
";

// ARGV: has_expected ('1' or '0'), expected, new value, ttl ms.
const COMPARE_AND_SWAP: &str = r"
local current = redis.call('GET', KEYS[1])
if ARGV[1] == '1' then
    if current ~= ARGV[2] then
        return 0
    end
elseif current then
    return 0
end
redis.call('SET', KEYS[1], ARGV[3], 'PX', ARGV[4])
return 1
";

#[derive(Clone)]
pub struct RedisSharedStore {
    conn: ConnectionManager,
    compare_and_delete: Script,
    compare_and_swap: Script,
}

impl core::fmt::Debug for RedisSharedStore {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("RedisSharedStore").finish_non_exhaustive()
    }
}

impl RedisSharedStore {
    /// Connect to `redis_url` (e.g. `redis://localhost:6379`).
    pub async fn connect(redis_url: impl AsRef<str>) -> Result<Self, StoreError> {
        let client = redis::Client::open(redis_url.as_ref()).map_err(store_error)?;
        let conn = ConnectionManager::new(client).await.map_err(store_error)?;
        Ok(Self::from_connection(conn))
    }

    pub fn from_connection(conn: ConnectionManager) -> Self {
        Self {
            conn,
            compare_and_delete: Script::new(COMPARE_AND_DELETE),
            compare_and_swap: Script::new(COMPARE_AND_SWAP),
        }
    }

    /// Clone of the managed connection, for sibling adapters.
    pub fn connection(&self) -> ConnectionManager {
        self.conn.clone()
    }
}

#[async_trait]
impl SharedStore for RedisSharedStore {
    #[instrument(level = "trace", skip(self), err)]
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut conn = self.conn.clone();
        redis::cmd("GET")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(store_error)
    }

    #[instrument(level = "trace", skip(self, value), err)]
    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("PX")
            .arg(ttl_millis(ttl))
            .query_async(&mut conn)
            .await
            .map_err(store_error)
    }

    #[instrument(level = "trace", skip(self), err)]
    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        let removed: u64 = redis::cmd("DEL")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(store_error)?;
        Ok(removed > 0)
    }

    #[instrument(level = "trace", skip(self), err)]
    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        let count: u64 = redis::cmd("EXISTS")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(store_error)?;
        Ok(count > 0)
    }

    #[instrument(level = "trace", skip(self, value), err)]
    async fn set_if_absent_with_ttl(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(ttl_millis(ttl))
            .query_async(&mut conn)
            .await
            .map_err(store_error)?;
        Ok(reply.is_some())
    }

    #[instrument(level = "trace", skip(self, expected), err)]
    async fn delete_if_equals(&self, key: &str, expected: &str) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        let removed: u64 = self
            .compare_and_delete
            .key(key)
            .arg(expected)
            .invoke_async(&mut conn)
            .await
            .map_err(store_error)?;
        Ok(removed > 0)
    }

    #[instrument(level = "trace", skip(self, expected, new), err)]
    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&str>,
        new: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        let (has_expected, expected) = match expected {
            Some(value) => ("1", value),
            None => ("0", ""),
        };
        let swapped: u64 = self
            .compare_and_swap
            .key(key)
            .arg(has_expected)
            .arg(expected)
            .arg(new)
            .arg(ttl_millis(ttl))
            .invoke_async(&mut conn)
            .await
            .map_err(store_error)?;
        Ok(swapped == 1)
    }

    #[instrument(level = "trace", skip(self), err)]
    async fn list_keys_by_prefix(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let mut conn = self.conn.clone();
        let pattern = format!("{}*", escape_glob(prefix));
        let mut cursor: u64 = 0;
        let mut keys = Vec::new();

        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(SCAN_BATCH)
                .query_async(&mut conn)
                .await
                .map_err(store_error)?;
            keys.extend(batch);
            if next == 0 {
                break;
            }
            cursor = next;
        }

        // SCAN may return a key more than once.
        keys.sort();
        keys.dedup();
        Ok(keys)
    }

    #[instrument(level = "trace", skip(self), err)]
    async fn index_insert(&self, key: &str, member: &str, score: i64) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let _: u64 = redis::cmd("ZADD")
            .arg(key)
            .arg(score)
            .arg(member)
            .query_async(&mut conn)
            .await
            .map_err(store_error)?;
        Ok(())
    }

    #[instrument(level = "trace", skip(self), err)]
    async fn index_remove(&self, key: &str, member: &str) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        let removed: u64 = redis::cmd("ZREM")
            .arg(key)
            .arg(member)
            .query_async(&mut conn)
            .await
            .map_err(store_error)?;
        Ok(removed > 0)
    }

    #[instrument(level = "trace", skip(self), err)]
    async fn index_range(
        &self,
        key: &str,
        order: IndexOrder,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<String>, StoreError> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let command = match order {
            IndexOrder::Ascending => "ZRANGE",
            IndexOrder::Descending => "ZREVRANGE",
        };
        let mut conn = self.conn.clone();
        redis::cmd(command)
            .arg(key)
            .arg(rank(offset))
            .arg(stop_rank(offset, limit))
            .query_async(&mut conn)
            .await
            .map_err(store_error)
    }

    #[instrument(level = "trace", skip(self), err)]
    async fn index_trim_below(&self, key: &str, min_score: i64) -> Result<usize, StoreError> {
        let mut conn = self.conn.clone();
        let removed: u64 = redis::cmd("ZREMRANGEBYSCORE")
            .arg(key)
            .arg("-inf")
            .arg(format!("({min_score}"))
            .query_async(&mut conn)
            .await
            .map_err(store_error)?;
        Ok(usize::try_from(removed).unwrap_or(usize::MAX))
    }
}

fn rank(offset: usize) -> i64 {
    i64::try_from(offset).unwrap_or(i64::MAX)
}

/// Inclusive stop rank; `-1` (the last member) when the range is unbounded.
fn stop_rank(offset: usize, limit: usize) -> i64 {
    offset
        .checked_add(limit - 1)
        .and_then(|stop| i64::try_from(stop).ok())
        .unwrap_or(-1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stop_rank_is_inclusive_and_saturates_to_last() {
        assert_eq!(stop_rank(0, 1), 0);
        assert_eq!(stop_rank(10, 5), 14);
        assert_eq!(stop_rank(0, usize::MAX), -1);
    }
}
