//! Redis adapters for the shared store contract.
//!
//! Enabled with the `redis` feature. Both adapters share one
//! [`redis::aio::ConnectionManager`], which reconnects on its own; callers
//! still bound every call with `with_timeout`.

mod store;
mod violations;

pub use store::RedisSharedStore;
pub use violations::RedisViolationSink;

use herald_delivery::StoreError;

pub(crate) fn store_error(e: redis::RedisError) -> StoreError {
    StoreError::Unavailable(e.to_string())
}

/// Escape glob metacharacters so a key prefix matches literally in `SCAN MATCH`.
pub(crate) fn escape_glob(prefix: &str) -> String {
    let mut escaped = String::with_capacity(prefix.len());
    for c in prefix.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

/// Milliseconds for `PX`/`PEXPIRE`, which reject zero.
pub(crate) fn ttl_millis(ttl: std::time::Duration) -> u64 {
    u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn glob_metacharacters_are_escaped() {
        assert_eq!(escape_glob("dlq:"), "dlq:");
        assert_eq!(escape_glob("a*b?[c]"), "a\\*b\\?\\[c\\]");
    }

    #[test]
    fn ttl_is_never_zero() {
        assert_eq!(ttl_millis(Duration::ZERO), 1);
        assert_eq!(ttl_millis(Duration::from_secs(2)), 2000);
    }
}
