//! Redis-backed KV store.
//!
//! Uses a multiplexed connection manager; all commands run through it
//! without client-side locking. Pipelined batches are issued as MULTI/EXEC
//! so the returned results line up with command order.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, IntoConnectionInfo, RedisError};
use std::time::Duration;
use tracing::info;

use super::{KeyTtl, KvCommand, KvStore, KvValue};
use crate::config::KvConfig;
use crate::error::{KvError, KvResult, ServiceError};

pub struct RedisKv {
    conn: ConnectionManager,
}

impl RedisKv {
    /// Connect to the configured store endpoint.
    pub async fn connect(config: &KvConfig) -> Result<Self, ServiceError> {
        let mut info =
            config
                .url
                .as_str()
                .into_connection_info()
                .map_err(|e| ServiceError::Config {
                    message: format!("invalid kv url: {}", e),
                })?;
        if let Some(password) = &config.password {
            info.redis.password = Some(password.clone());
        }

        let client = redis::Client::open(info).map_err(|e| ServiceError::Config {
            message: format!("invalid kv configuration: {}", e),
        })?;

        let connect = client.get_connection_manager();
        let conn = tokio::time::timeout(Duration::from_secs(config.connect_timeout_secs), connect)
            .await
            .map_err(|_| KvError::unavailable("connect timeout"))?
            .map_err(|e| KvError::unavailable(e.to_string()))?;

        info!(url = %config.url, "Connected to KV store");
        Ok(Self { conn })
    }

    fn map_err(key: &str, err: RedisError) -> KvError {
        if err.kind() == redis::ErrorKind::TypeError {
            KvError::TypeError {
                key: key.to_string(),
            }
        } else {
            KvError::Unavailable {
                message: err.to_string(),
            }
        }
    }

    fn convert(command: &KvCommand, value: &redis::Value) -> KvResult<KvValue> {
        let key = match command {
            KvCommand::Incr(k)
            | KvCommand::Decr(k)
            | KvCommand::Expire(k, _)
            | KvCommand::Rpush(k, _)
            | KvCommand::Ltrim(k, _, _)
            | KvCommand::Hset(k, _, _)
            | KvCommand::Hdel(k, _) => k.as_str(),
        };

        match command {
            KvCommand::Incr(_) | KvCommand::Decr(_) | KvCommand::Rpush(_, _) => {
                let n: i64 =
                    redis::from_redis_value(value).map_err(|e| Self::map_err(key, e))?;
                Ok(KvValue::Int(n))
            }
            KvCommand::Expire(_, _) | KvCommand::Hset(_, _, _) | KvCommand::Hdel(_, _) => {
                let n: i64 =
                    redis::from_redis_value(value).map_err(|e| Self::map_err(key, e))?;
                Ok(KvValue::Bool(n > 0))
            }
            KvCommand::Ltrim(_, _, _) => {
                redis::from_redis_value::<()>(value).map_err(|e| Self::map_err(key, e))?;
                Ok(KvValue::Bool(true))
            }
        }
    }
}

#[async_trait]
impl KvStore for RedisKv {
    async fn get(&self, key: &str) -> KvResult<Option<String>> {
        let mut conn = self.conn.clone();
        conn.get(key).await.map_err(|e| Self::map_err(key, e))
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> KvResult<bool> {
        let mut conn = self.conn.clone();
        match ttl {
            Some(ttl) => conn
                .set_ex::<_, _, ()>(key, value, ttl.as_secs())
                .await
                .map_err(|e| Self::map_err(key, e))?,
            None => conn
                .set::<_, _, ()>(key, value)
                .await
                .map_err(|e| Self::map_err(key, e))?,
        }
        // Normalized from the protocol "OK" acknowledgement.
        Ok(true)
    }

    async fn del(&self, key: &str) -> KvResult<bool> {
        let mut conn = self.conn.clone();
        let removed: i64 = conn.del(key).await.map_err(|e| Self::map_err(key, e))?;
        Ok(removed > 0)
    }

    async fn incr(&self, key: &str) -> KvResult<i64> {
        let mut conn = self.conn.clone();
        conn.incr(key, 1i64)
            .await
            .map_err(|e| Self::map_err(key, e))
    }

    async fn decr(&self, key: &str) -> KvResult<i64> {
        let mut conn = self.conn.clone();
        conn.decr(key, 1i64)
            .await
            .map_err(|e| Self::map_err(key, e))
    }

    async fn expire(&self, key: &str, ttl: Duration) -> KvResult<bool> {
        let mut conn = self.conn.clone();
        conn.expire(key, ttl.as_secs() as i64)
            .await
            .map_err(|e| Self::map_err(key, e))
    }

    async fn ttl(&self, key: &str) -> KvResult<KeyTtl> {
        let mut conn = self.conn.clone();
        let raw: i64 = conn.ttl(key).await.map_err(|e| Self::map_err(key, e))?;
        Ok(match raw {
            -2 => KeyTtl::Absent,
            -1 => KeyTtl::NoExpiry,
            n => KeyTtl::Seconds(n.max(0) as u64),
        })
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> KvResult<bool> {
        let mut conn = self.conn.clone();
        let added: i64 = conn
            .hset(key, field, value)
            .await
            .map_err(|e| Self::map_err(key, e))?;
        Ok(added > 0)
    }

    async fn hget(&self, key: &str, field: &str) -> KvResult<Option<String>> {
        let mut conn = self.conn.clone();
        conn.hget(key, field)
            .await
            .map_err(|e| Self::map_err(key, e))
    }

    async fn hdel(&self, key: &str, field: &str) -> KvResult<bool> {
        let mut conn = self.conn.clone();
        let removed: i64 = conn
            .hdel(key, field)
            .await
            .map_err(|e| Self::map_err(key, e))?;
        Ok(removed > 0)
    }

    async fn hlen(&self, key: &str) -> KvResult<u64> {
        let mut conn = self.conn.clone();
        let len: i64 = conn.hlen(key).await.map_err(|e| Self::map_err(key, e))?;
        Ok(len.max(0) as u64)
    }

    async fn lpush(&self, key: &str, value: &str) -> KvResult<i64> {
        let mut conn = self.conn.clone();
        conn.lpush(key, value)
            .await
            .map_err(|e| Self::map_err(key, e))
    }

    async fn rpush(&self, key: &str, value: &str) -> KvResult<i64> {
        let mut conn = self.conn.clone();
        conn.rpush(key, value)
            .await
            .map_err(|e| Self::map_err(key, e))
    }

    async fn lrange(&self, key: &str, start: i64, stop: i64) -> KvResult<Vec<String>> {
        let mut conn = self.conn.clone();
        conn.lrange(key, start as isize, stop as isize)
            .await
            .map_err(|e| Self::map_err(key, e))
    }

    async fn ltrim(&self, key: &str, start: i64, stop: i64) -> KvResult<bool> {
        let mut conn = self.conn.clone();
        conn.ltrim::<_, ()>(key, start as isize, stop as isize)
            .await
            .map_err(|e| Self::map_err(key, e))?;
        Ok(true)
    }

    async fn keys(&self, pattern: &str) -> KvResult<Vec<String>> {
        let mut conn = self.conn.clone();
        conn.keys(pattern)
            .await
            .map_err(|e| Self::map_err(pattern, e))
    }

    async fn exec(&self, commands: Vec<KvCommand>) -> KvResult<Vec<KvValue>> {
        let mut pipe = redis::pipe();
        pipe.atomic();

        for command in &commands {
            match command {
                KvCommand::Incr(key) => {
                    pipe.cmd("INCR").arg(key);
                }
                KvCommand::Decr(key) => {
                    pipe.cmd("DECR").arg(key);
                }
                KvCommand::Expire(key, ttl) => {
                    pipe.cmd("EXPIRE").arg(key).arg(ttl.as_secs());
                }
                KvCommand::Rpush(key, value) => {
                    pipe.cmd("RPUSH").arg(key).arg(value);
                }
                KvCommand::Ltrim(key, start, stop) => {
                    pipe.cmd("LTRIM").arg(key).arg(start).arg(stop);
                }
                KvCommand::Hset(key, field, value) => {
                    pipe.cmd("HSET").arg(key).arg(field).arg(value);
                }
                KvCommand::Hdel(key, field) => {
                    pipe.cmd("HDEL").arg(key).arg(field);
                }
            }
        }

        let mut conn = self.conn.clone();
        let raw: Vec<redis::Value> = pipe
            .query_async(&mut conn)
            .await
            .map_err(|e| Self::map_err("pipeline", e))?;

        commands
            .iter()
            .zip(raw.iter())
            .map(|(command, value)| Self::convert(command, value))
            .collect()
    }
}
