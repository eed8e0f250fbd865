//! In-process KV backend.
//!
//! Backs tests and single-node deployments. TTLs are enforced lazily on
//! access, which is sufficient for counter semantics: an expired key reads
//! as absent and the next increment recreates it.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;

use super::{KeyTtl, KvCommand, KvStore, KvValue, resolve_range};
use crate::error::{KvError, KvResult};

#[derive(Debug, Clone)]
enum Value {
    Text(String),
    List(Vec<String>),
    Hash(HashMap<String, String>),
}

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

impl Entry {
    fn expired(&self) -> bool {
        self.expires_at.is_some_and(|at| at <= Instant::now())
    }
}

/// Process-local [`KvStore`] implementation.
#[derive(Default)]
pub struct MemoryKv {
    entries: Mutex<HashMap<String, Entry>>,
    offline: AtomicBool,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate a store outage. Subsequent operations fail with
    /// `kv_unavailable` until cleared; used by failure-policy tests.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    fn check_online(&self) -> KvResult<()> {
        if self.offline.load(Ordering::SeqCst) {
            Err(KvError::unavailable("simulated outage"))
        } else {
            Ok(())
        }
    }

    /// Run `f` against the live (non-expired) entry map.
    fn with_entries<T>(&self, f: impl FnOnce(&mut HashMap<String, Entry>) -> T) -> T {
        let mut entries = self.entries.lock();
        entries.retain(|_, entry| !entry.expired());
        f(&mut entries)
    }

    fn incr_by(&self, key: &str, delta: i64) -> KvResult<i64> {
        self.with_entries(|entries| match entries.get_mut(key) {
            Some(entry) => match &mut entry.value {
                Value::Text(text) => {
                    let current: i64 = text.parse().map_err(|_| KvError::TypeError {
                        key: key.to_string(),
                    })?;
                    let next = current + delta;
                    *text = next.to_string();
                    Ok(next)
                }
                _ => Err(KvError::TypeError {
                    key: key.to_string(),
                }),
            },
            None => {
                entries.insert(
                    key.to_string(),
                    Entry {
                        value: Value::Text(delta.to_string()),
                        expires_at: None,
                    },
                );
                Ok(delta)
            }
        })
    }

    fn apply(&self, command: &KvCommand) -> KvResult<KvValue> {
        match command {
            KvCommand::Incr(key) => self.incr_by(key, 1).map(KvValue::Int),
            KvCommand::Decr(key) => self.incr_by(key, -1).map(KvValue::Int),
            KvCommand::Expire(key, ttl) => self.expire_sync(key, *ttl).map(KvValue::Bool),
            KvCommand::Rpush(key, value) => self.push_sync(key, value, false).map(KvValue::Int),
            KvCommand::Ltrim(key, start, stop) => {
                self.ltrim_sync(key, *start, *stop).map(KvValue::Bool)
            }
            KvCommand::Hset(key, field, value) => {
                self.hset_sync(key, field, value).map(KvValue::Bool)
            }
            KvCommand::Hdel(key, field) => self.hdel_sync(key, field).map(KvValue::Bool),
        }
    }

    fn expire_sync(&self, key: &str, ttl: Duration) -> KvResult<bool> {
        self.with_entries(|entries| match entries.get_mut(key) {
            Some(entry) => {
                entry.expires_at = Some(Instant::now() + ttl);
                Ok(true)
            }
            None => Ok(false),
        })
    }

    fn push_sync(&self, key: &str, value: &str, front: bool) -> KvResult<i64> {
        self.with_entries(|entries| {
            let entry = entries.entry(key.to_string()).or_insert_with(|| Entry {
                value: Value::List(Vec::new()),
                expires_at: None,
            });
            match &mut entry.value {
                Value::List(items) => {
                    if front {
                        items.insert(0, value.to_string());
                    } else {
                        items.push(value.to_string());
                    }
                    Ok(items.len() as i64)
                }
                _ => Err(KvError::TypeError {
                    key: key.to_string(),
                }),
            }
        })
    }

    fn ltrim_sync(&self, key: &str, start: i64, stop: i64) -> KvResult<bool> {
        self.with_entries(|entries| match entries.get_mut(key) {
            Some(entry) => match &mut entry.value {
                Value::List(items) => {
                    match resolve_range(items.len(), start, stop) {
                        Some((lo, hi)) => {
                            *items = items[lo..=hi].to_vec();
                        }
                        None => items.clear(),
                    }
                    Ok(true)
                }
                _ => Err(KvError::TypeError {
                    key: key.to_string(),
                }),
            },
            None => Ok(true),
        })
    }

    fn hset_sync(&self, key: &str, field: &str, value: &str) -> KvResult<bool> {
        self.with_entries(|entries| {
            let entry = entries.entry(key.to_string()).or_insert_with(|| Entry {
                value: Value::Hash(HashMap::new()),
                expires_at: None,
            });
            match &mut entry.value {
                Value::Hash(map) => Ok(map.insert(field.to_string(), value.to_string()).is_none()),
                _ => Err(KvError::TypeError {
                    key: key.to_string(),
                }),
            }
        })
    }

    fn hdel_sync(&self, key: &str, field: &str) -> KvResult<bool> {
        self.with_entries(|entries| match entries.get_mut(key) {
            Some(entry) => match &mut entry.value {
                Value::Hash(map) => Ok(map.remove(field).is_some()),
                _ => Err(KvError::TypeError {
                    key: key.to_string(),
                }),
            },
            None => Ok(false),
        })
    }
}

/// Match a key against a scan pattern supporting `*` wildcards.
fn glob_match(pattern: &str, key: &str) -> bool {
    let parts: Vec<&str> = pattern.split('*').collect();
    if parts.len() == 1 {
        return pattern == key;
    }

    let mut rest = key;
    for (i, part) in parts.iter().enumerate() {
        if part.is_empty() {
            continue;
        }
        if i == 0 {
            match rest.strip_prefix(part) {
                Some(r) => rest = r,
                None => return false,
            }
        } else if i == parts.len() - 1 {
            return rest.ends_with(part);
        } else {
            match rest.find(part) {
                Some(pos) => rest = &rest[pos + part.len()..],
                None => return false,
            }
        }
    }

    true
}

#[async_trait]
impl KvStore for MemoryKv {
    async fn get(&self, key: &str) -> KvResult<Option<String>> {
        self.check_online()?;
        self.with_entries(|entries| match entries.get(key) {
            Some(entry) => match &entry.value {
                Value::Text(text) => Ok(Some(text.clone())),
                _ => Err(KvError::TypeError {
                    key: key.to_string(),
                }),
            },
            None => Ok(None),
        })
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> KvResult<bool> {
        self.check_online()?;
        self.with_entries(|entries| {
            entries.insert(
                key.to_string(),
                Entry {
                    value: Value::Text(value.to_string()),
                    expires_at: ttl.map(|t| Instant::now() + t),
                },
            );
            Ok(true)
        })
    }

    async fn del(&self, key: &str) -> KvResult<bool> {
        self.check_online()?;
        self.with_entries(|entries| Ok(entries.remove(key).is_some()))
    }

    async fn incr(&self, key: &str) -> KvResult<i64> {
        self.check_online()?;
        self.incr_by(key, 1)
    }

    async fn decr(&self, key: &str) -> KvResult<i64> {
        self.check_online()?;
        self.incr_by(key, -1)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> KvResult<bool> {
        self.check_online()?;
        self.expire_sync(key, ttl)
    }

    async fn ttl(&self, key: &str) -> KvResult<KeyTtl> {
        self.check_online()?;
        self.with_entries(|entries| match entries.get(key) {
            Some(entry) => match entry.expires_at {
                Some(at) => Ok(KeyTtl::Seconds(
                    at.saturating_duration_since(Instant::now()).as_secs(),
                )),
                None => Ok(KeyTtl::NoExpiry),
            },
            None => Ok(KeyTtl::Absent),
        })
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> KvResult<bool> {
        self.check_online()?;
        self.hset_sync(key, field, value)
    }

    async fn hget(&self, key: &str, field: &str) -> KvResult<Option<String>> {
        self.check_online()?;
        self.with_entries(|entries| match entries.get(key) {
            Some(entry) => match &entry.value {
                Value::Hash(map) => Ok(map.get(field).cloned()),
                _ => Err(KvError::TypeError {
                    key: key.to_string(),
                }),
            },
            None => Ok(None),
        })
    }

    async fn hdel(&self, key: &str, field: &str) -> KvResult<bool> {
        self.check_online()?;
        self.hdel_sync(key, field)
    }

    async fn hlen(&self, key: &str) -> KvResult<u64> {
        self.check_online()?;
        self.with_entries(|entries| match entries.get(key) {
            Some(entry) => match &entry.value {
                Value::Hash(map) => Ok(map.len() as u64),
                _ => Err(KvError::TypeError {
                    key: key.to_string(),
                }),
            },
            None => Ok(0),
        })
    }

    async fn lpush(&self, key: &str, value: &str) -> KvResult<i64> {
        self.check_online()?;
        self.push_sync(key, value, true)
    }

    async fn rpush(&self, key: &str, value: &str) -> KvResult<i64> {
        self.check_online()?;
        self.push_sync(key, value, false)
    }

    async fn lrange(&self, key: &str, start: i64, stop: i64) -> KvResult<Vec<String>> {
        self.check_online()?;
        self.with_entries(|entries| match entries.get(key) {
            Some(entry) => match &entry.value {
                Value::List(items) => Ok(match resolve_range(items.len(), start, stop) {
                    Some((lo, hi)) => items[lo..=hi].to_vec(),
                    None => Vec::new(),
                }),
                _ => Err(KvError::TypeError {
                    key: key.to_string(),
                }),
            },
            None => Ok(Vec::new()),
        })
    }

    async fn ltrim(&self, key: &str, start: i64, stop: i64) -> KvResult<bool> {
        self.check_online()?;
        self.ltrim_sync(key, start, stop)
    }

    async fn keys(&self, pattern: &str) -> KvResult<Vec<String>> {
        self.check_online()?;
        self.with_entries(|entries| {
            let mut matched: Vec<String> = entries
                .keys()
                .filter(|key| glob_match(pattern, key))
                .cloned()
                .collect();
            matched.sort();
            Ok(matched)
        })
    }

    async fn exec(&self, commands: Vec<KvCommand>) -> KvResult<Vec<KvValue>> {
        self.check_online()?;
        let mut results = Vec::with_capacity(commands.len());
        for command in &commands {
            results.push(self.apply(command)?);
        }
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_incr_creates_at_one() {
        let kv = MemoryKv::new();
        assert_eq!(kv.incr("counter").await.unwrap(), 1);
        assert_eq!(kv.incr("counter").await.unwrap(), 2);
        assert_eq!(kv.decr("counter").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_set_returns_bool() {
        let kv = MemoryKv::new();
        assert!(kv.set("k", "v", None).await.unwrap());
        assert_eq!(kv.get("k").await.unwrap(), Some("v".to_string()));
    }

    #[tokio::test]
    async fn test_ttl_states() {
        let kv = MemoryKv::new();
        assert_eq!(kv.ttl("missing").await.unwrap(), KeyTtl::Absent);

        kv.set("forever", "v", None).await.unwrap();
        assert_eq!(kv.ttl("forever").await.unwrap(), KeyTtl::NoExpiry);

        kv.set("bounded", "v", Some(Duration::from_secs(60)))
            .await
            .unwrap();
        assert!(matches!(
            kv.ttl("bounded").await.unwrap(),
            KeyTtl::Seconds(n) if n <= 60
        ));
    }

    #[tokio::test]
    async fn test_expired_key_reads_absent() {
        let kv = MemoryKv::new();
        kv.set("gone", "v", Some(Duration::from_millis(5)))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(kv.get("gone").await.unwrap(), None);
        // The next increment recreates the counter from scratch.
        assert_eq!(kv.incr("gone").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_expire_absent_key_is_false() {
        let kv = MemoryKv::new();
        assert!(!kv.expire("missing", Duration::from_secs(1)).await.unwrap());
    }

    #[tokio::test]
    async fn test_type_error_on_wrong_kind() {
        let kv = MemoryKv::new();
        kv.rpush("list", "a").await.unwrap();
        assert!(matches!(
            kv.incr("list").await,
            Err(KvError::TypeError { .. })
        ));
        assert!(matches!(
            kv.get("list").await,
            Err(KvError::TypeError { .. })
        ));
    }

    #[tokio::test]
    async fn test_lrange_negative_indices() {
        let kv = MemoryKv::new();
        for v in ["a", "b", "c", "d", "e"] {
            kv.rpush("list", v).await.unwrap();
        }

        assert_eq!(
            kv.lrange("list", 0, -1).await.unwrap(),
            vec!["a", "b", "c", "d", "e"]
        );
        assert_eq!(kv.lrange("list", -2, -1).await.unwrap(), vec!["d", "e"]);
        assert_eq!(kv.lrange("list", 1, 2).await.unwrap(), vec!["b", "c"]);
    }

    #[tokio::test]
    async fn test_ltrim_bounds_list() {
        let kv = MemoryKv::new();
        for v in ["a", "b", "c", "d", "e"] {
            kv.rpush("list", v).await.unwrap();
        }
        kv.ltrim("list", -3, -1).await.unwrap();
        assert_eq!(kv.lrange("list", 0, -1).await.unwrap(), vec!["c", "d", "e"]);
    }

    #[tokio::test]
    async fn test_exec_preserves_order() {
        let kv = MemoryKv::new();
        let results = kv
            .exec(vec![
                KvCommand::Incr("a".to_string()),
                KvCommand::Incr("a".to_string()),
                KvCommand::Expire("a".to_string(), Duration::from_secs(60)),
                KvCommand::Incr("b".to_string()),
            ])
            .await
            .unwrap();

        assert_eq!(
            results,
            vec![
                KvValue::Int(1),
                KvValue::Int(2),
                KvValue::Bool(true),
                KvValue::Int(1),
            ]
        );
    }

    #[tokio::test]
    async fn test_offline_simulates_outage() {
        let kv = MemoryKv::new();
        kv.set_offline(true);
        assert!(matches!(
            kv.incr("k").await,
            Err(KvError::Unavailable { .. })
        ));
        kv.set_offline(false);
        assert_eq!(kv.incr("k").await.unwrap(), 1);
    }

    #[test]
    fn test_glob_match() {
        assert!(glob_match("rl:*", "rl:user:u1:sec"));
        assert!(glob_match("rl:user:*:conn", "rl:user:u1:conn"));
        assert!(glob_match("exact", "exact"));
        assert!(!glob_match("rl:*", "hist:k1"));
        assert!(!glob_match("exact", "exactly"));
    }

    #[tokio::test]
    async fn test_keys_pattern_scan() {
        let kv = MemoryKv::new();
        kv.set("rl:user:u1:sec", "1", None).await.unwrap();
        kv.set("rl:user:u1:min", "1", None).await.unwrap();
        kv.set("hist:k1", "x", None).await.unwrap();

        let keys = kv.keys("rl:user:u1:*").await.unwrap();
        assert_eq!(keys, vec!["rl:user:u1:min", "rl:user:u1:sec"]);
    }

    #[tokio::test]
    async fn test_hash_operations() {
        let kv = MemoryKv::new();
        assert!(kv.hset("h", "f1", "v1").await.unwrap());
        assert!(!kv.hset("h", "f1", "v2").await.unwrap());
        assert_eq!(kv.hget("h", "f1").await.unwrap(), Some("v2".to_string()));
        assert_eq!(kv.hlen("h").await.unwrap(), 1);
        assert!(kv.hdel("h", "f1").await.unwrap());
        assert!(!kv.hdel("h", "f1").await.unwrap());
    }
}
