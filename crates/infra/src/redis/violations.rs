//! Rate-limit violations as one capped Redis list per subject.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use tracing::{instrument, warn};

use herald_delivery::StoreError;
use herald_delivery::rate_limiter::violations::{
    MAX_VIOLATIONS_PER_SUBJECT, VIOLATION_WINDOW, Violation, ViolationSink,
};

use super::{store_error, ttl_millis};

const KEY_PREFIX: &str = "violations:";

/// `LPUSH` newest first, `LTRIM` to the per-subject cap, `PEXPIRE` to the
/// violation window. The list disappears once a subject stays quiet for a
/// whole window.
#[derive(Clone)]
pub struct RedisViolationSink {
    conn: ConnectionManager,
}

impl core::fmt::Debug for RedisViolationSink {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("RedisViolationSink").finish_non_exhaustive()
    }
}

impl RedisViolationSink {
    pub fn new(conn: ConnectionManager) -> Self {
        Self { conn }
    }

    fn key(subject: &str) -> String {
        format!("{KEY_PREFIX}{subject}")
    }
}

#[async_trait]
impl ViolationSink for RedisViolationSink {
    #[instrument(level = "trace", skip(self, violation), fields(subject = %violation.subject), err)]
    async fn record(&self, violation: &Violation) -> Result<(), StoreError> {
        let json = serde_json::to_string(violation)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        let key = Self::key(&violation.subject);
        let mut conn = self.conn.clone();

        redis::pipe()
            .atomic()
            .cmd("LPUSH")
            .arg(&key)
            .arg(json)
            .ignore()
            .cmd("LTRIM")
            .arg(&key)
            .arg(0)
            .arg(MAX_VIOLATIONS_PER_SUBJECT as i64 - 1)
            .ignore()
            .cmd("PEXPIRE")
            .arg(&key)
            .arg(ttl_millis(VIOLATION_WINDOW))
            .ignore()
            .query_async(&mut conn)
            .await
            .map_err(store_error)
    }

    #[instrument(level = "trace", skip(self), err)]
    async fn recent(
        &self,
        subject: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<Violation>, StoreError> {
        let mut conn = self.conn.clone();
        let raw: Vec<String> = redis::cmd("LRANGE")
            .arg(Self::key(subject))
            .arg(0)
            .arg(-1)
            .query_async(&mut conn)
            .await
            .map_err(store_error)?;

        let mut violations: Vec<Violation> = raw
            .iter()
            .filter_map(|json| match serde_json::from_str::<Violation>(json) {
                Ok(v) => Some(v),
                Err(e) => {
                    warn!(subject, error = %e, "skipping unreadable violation");
                    None
                }
            })
            .filter(|v| v.occurred_at > since)
            .collect();
        violations.reverse();
        Ok(violations)
    }
}
