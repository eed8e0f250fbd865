//! Shared KV store adapter.
//!
//! All distributed state (rate counters, history rings, cached responses)
//! flows through the [`KvStore`] capability trait. The production backend is
//! an external store reached over the network ([`RedisKv`]); an in-process
//! backend ([`MemoryKv`]) backs tests and single-node runs.
//!
//! Return values are normalized: `set` reports success as a boolean rather
//! than the raw protocol acknowledgement string, and `ttl` reports key state
//! through [`KeyTtl`] instead of sentinel integers.

mod memory;
mod redis;

pub use memory::MemoryKv;
pub use redis::RedisKv;

use async_trait::async_trait;
use std::time::Duration;

use crate::error::KvResult;

/// Remaining lifetime of a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyTtl {
    /// Key exists and expires after this many seconds.
    Seconds(u64),
    /// Key does not exist.
    Absent,
    /// Key exists and has no expiry.
    NoExpiry,
}

/// One queued command in a pipelined batch.
#[derive(Debug, Clone)]
pub enum KvCommand {
    Incr(String),
    Decr(String),
    Expire(String, Duration),
    Rpush(String, String),
    Ltrim(String, i64, i64),
    Hset(String, String, String),
    Hdel(String, String),
}

/// Result of one pipelined command, in submission order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KvValue {
    Int(i64),
    Bool(bool),
}

impl KvValue {
    pub fn as_int(self) -> Option<i64> {
        match self {
            KvValue::Int(n) => Some(n),
            KvValue::Bool(_) => None,
        }
    }
}

/// Capability interface over the shared KV store.
///
/// Operations are logically synchronous for callers; implementations must
/// not block the executor. Failures surface as `KvError::Unavailable`
/// (connection or timeout) or `KvError::TypeError` (wrong type at key).
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> KvResult<Option<String>>;

    /// Set `key` to `value`, optionally with an expiry. Returns `true` on
    /// success (normalized from the protocol-level acknowledgement).
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> KvResult<bool>;

    /// Delete a key; `true` if it existed.
    async fn del(&self, key: &str) -> KvResult<bool>;

    /// Atomic increment; an absent key is created at 1.
    async fn incr(&self, key: &str) -> KvResult<i64>;

    /// Atomic decrement; an absent key is created at -1.
    async fn decr(&self, key: &str) -> KvResult<i64>;

    /// Set an expiry on an existing key; `false` if the key is absent.
    async fn expire(&self, key: &str, ttl: Duration) -> KvResult<bool>;

    async fn ttl(&self, key: &str) -> KvResult<KeyTtl>;

    async fn hset(&self, key: &str, field: &str, value: &str) -> KvResult<bool>;

    async fn hget(&self, key: &str, field: &str) -> KvResult<Option<String>>;

    async fn hdel(&self, key: &str, field: &str) -> KvResult<bool>;

    async fn hlen(&self, key: &str) -> KvResult<u64>;

    async fn lpush(&self, key: &str, value: &str) -> KvResult<i64>;

    async fn rpush(&self, key: &str, value: &str) -> KvResult<i64>;

    /// Inclusive range over a list; negative indices count from the end.
    async fn lrange(&self, key: &str, start: i64, stop: i64) -> KvResult<Vec<String>>;

    async fn ltrim(&self, key: &str, start: i64, stop: i64) -> KvResult<bool>;

    /// Pattern scan over the keyspace. Admin surfaces only; not for the
    /// request path.
    async fn keys(&self, pattern: &str) -> KvResult<Vec<String>>;

    /// Execute a batch atomically, preserving command order in the results.
    async fn exec(&self, commands: Vec<KvCommand>) -> KvResult<Vec<KvValue>>;
}

/// Resolve inclusive list-range indices against a list of `len` elements.
///
/// Mirrors the store's range semantics: negative indices count from the end,
/// out-of-bounds indices clamp, and an inverted range is empty.
pub(crate) fn resolve_range(len: usize, start: i64, stop: i64) -> Option<(usize, usize)> {
    let len = len as i64;
    if len == 0 {
        return None;
    }

    let mut start = if start < 0 { len + start } else { start };
    let mut stop = if stop < 0 { len + stop } else { stop };

    if start < 0 {
        start = 0;
    }
    if stop >= len {
        stop = len - 1;
    }
    if start > stop || start >= len || stop < 0 {
        return None;
    }

    Some((start as usize, stop as usize))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_range_full() {
        assert_eq!(resolve_range(5, 0, -1), Some((0, 4)));
    }

    #[test]
    fn test_resolve_range_negative_window() {
        assert_eq!(resolve_range(5, -3, -1), Some((2, 4)));
        assert_eq!(resolve_range(5, -10, -1), Some((0, 4)));
    }

    #[test]
    fn test_resolve_range_clamps_stop() {
        assert_eq!(resolve_range(3, 0, 99), Some((0, 2)));
    }

    #[test]
    fn test_resolve_range_empty_cases() {
        assert_eq!(resolve_range(0, 0, -1), None);
        assert_eq!(resolve_range(5, 3, 1), None);
        assert_eq!(resolve_range(5, 7, 9), None);
    }
}
