//! Distributed rate limiter.
//!
//! Counts connections and messages per (user, ip) against the shared KV
//! store, so no coordination beyond atomic increments is required across
//! processes. Message windows are fixed: counters keep their value once a
//! denial occurs and expire at the window boundary.
//!
//! Failure policy is asymmetric on purpose: a KV outage fails OPEN for
//! message admission (drop nothing user-visible) and CLOSED for connection
//! admission (an extra connection is costlier than a dropped message).

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::RateLimitConfig;
use crate::error::{ErrorKind, KvError, KvResult};
use crate::kv::{KvCommand, KvStore};
use crate::telemetry::Metrics;

/// Identifier axis along which the limiter counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    Client,
    User,
    Ip,
}

impl Scope {
    fn as_str(self) -> &'static str {
        match self {
            Scope::Client => "client",
            Scope::User => "user",
            Scope::Ip => "ip",
        }
    }
}

/// Time window over which a message limit applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Window {
    Second,
    Minute,
    Hour,
    Day,
}

impl Window {
    const ALL: [Window; 4] = [Window::Second, Window::Minute, Window::Hour, Window::Day];

    fn suffix(self) -> &'static str {
        match self {
            Window::Second => "sec",
            Window::Minute => "min",
            Window::Hour => "hour",
            Window::Day => "day",
        }
    }

    fn ttl(self) -> Duration {
        match self {
            Window::Second => Duration::from_secs(1),
            Window::Minute => Duration::from_secs(60),
            Window::Hour => Duration::from_secs(3600),
            Window::Day => Duration::from_secs(86_400),
        }
    }

    fn limit(self, config: &RateLimitConfig) -> i64 {
        match self {
            Window::Second => config.messages_per_second as i64,
            Window::Minute => config.messages_per_minute as i64,
            Window::Hour => config.messages_per_hour as i64,
            Window::Day => config.messages_per_day as i64,
        }
    }
}

/// Outcome of an admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Allowed,
    Denied(ErrorKind),
}

impl Admission {
    pub fn is_allowed(self) -> bool {
        matches!(self, Admission::Allowed)
    }
}

/// Live counter values for one identifier, for admin listings.
#[derive(Debug, Clone, Copy, Default, serde::Serialize)]
pub struct WindowCounters {
    pub second: i64,
    pub minute: i64,
    pub hour: i64,
    pub day: i64,
    pub connections: i64,
}

fn rl_key(scope: Scope, identifier: &str, window: &str) -> String {
    format!("rl:{}:{}:{}", scope.as_str(), identifier, window)
}

pub struct RateLimiter {
    kv: Arc<dyn KvStore>,
    config: RateLimitConfig,
    metrics: Arc<Metrics>,
}

impl RateLimiter {
    pub fn new(kv: Arc<dyn KvStore>, config: RateLimitConfig, metrics: Arc<Metrics>) -> Self {
        Self {
            kv,
            config,
            metrics,
        }
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Admit or reject a new connection for (ip, user).
    ///
    /// Both conn-count keys are incremented in one batch; on overflow they
    /// are decremented back. Conn keys carry no TTL: only disconnects bring
    /// them down, which is what keeps two connect-disconnect cycles
    /// idempotent.
    pub async fn admit_connection(&self, ip: &str, user_id: &str) -> Admission {
        let ip_key = rl_key(Scope::Ip, ip, "conn");
        let user_key = rl_key(Scope::User, user_id, "conn");

        let results = match self
            .kv
            .exec(vec![
                KvCommand::Incr(ip_key.clone()),
                KvCommand::Incr(user_key.clone()),
            ])
            .await
        {
            Ok(results) => results,
            Err(e) => {
                // Fail closed: admitting an unaccounted connection is the
                // costlier mistake.
                self.note_kv_error(&e);
                self.metrics.rl_connections_denied.inc();
                warn!(error = %e, "Connection admission failed closed");
                return Admission::Denied(ErrorKind::ConnectionLimitExceeded);
            }
        };

        let ip_count = results.first().and_then(|v| v.as_int()).unwrap_or(i64::MAX);
        let user_count = results.get(1).and_then(|v| v.as_int()).unwrap_or(i64::MAX);

        if ip_count > self.config.max_connections_per_ip as i64
            || user_count > self.config.max_connections_per_user as i64
        {
            if let Err(e) = self
                .kv
                .exec(vec![KvCommand::Decr(ip_key), KvCommand::Decr(user_key)])
                .await
            {
                // Surface the original rejection; reconciliation relies on
                // disconnect decrements for the recorded excess.
                self.note_kv_error(&e);
                warn!(error = %e, ip = %ip, user_id = %user_id, "Connection rollback failed");
            }

            self.metrics.rl_connections_denied.inc();
            debug!(
                ip = %ip,
                user_id = %user_id,
                ip_count,
                user_count,
                "Connection limit exceeded"
            );
            return Admission::Denied(ErrorKind::ConnectionLimitExceeded);
        }

        Admission::Allowed
    }

    /// Decrement conn-count keys on disconnect.
    pub async fn release_connection(&self, ip: &str, user_id: &str) {
        let commands = vec![
            KvCommand::Decr(rl_key(Scope::Ip, ip, "conn")),
            KvCommand::Decr(rl_key(Scope::User, user_id, "conn")),
        ];
        if let Err(e) = self.kv.exec(commands).await {
            self.note_kv_error(&e);
            warn!(error = %e, ip = %ip, user_id = %user_id, "Connection release failed");
        }
    }

    /// Admit or reject one message for a user.
    ///
    /// `system_bypass` is true only for `system` envelopes from admin
    /// principals; the bypass is unconditional and audited.
    pub async fn admit_message(&self, user_id: &str, system_bypass: bool) -> Admission {
        if system_bypass {
            self.metrics.rl_system_bypass.inc();
            return Admission::Allowed;
        }

        let mut commands = Vec::with_capacity(Window::ALL.len() * 2);
        for window in Window::ALL {
            let key = rl_key(Scope::User, user_id, window.suffix());
            commands.push(KvCommand::Incr(key.clone()));
            // Best-effort: a false reply means the key vanished between the
            // incr and the expire; the next incr recreates it.
            commands.push(KvCommand::Expire(key, window.ttl()));
        }

        let results = match self.kv.exec(commands).await {
            Ok(results) => results,
            Err(e) => {
                // Fail open so a store outage is not a user-visible outage.
                self.note_kv_error(&e);
                warn!(error = %e, user_id = %user_id, "Message admission failed open");
                return Admission::Allowed;
            }
        };

        for (i, window) in Window::ALL.iter().enumerate() {
            let count = results
                .get(i * 2)
                .and_then(|v| v.as_int())
                .unwrap_or_default();
            if count > window.limit(&self.config) {
                self.metrics.rl_messages_denied.inc();
                debug!(
                    user_id = %user_id,
                    window = window.suffix(),
                    count,
                    "Message rate limit exceeded"
                );
                return Admission::Denied(ErrorKind::RateLimitExceeded);
            }
        }

        Admission::Allowed
    }

    /// Read current counters for one identifier.
    pub async fn counters(&self, scope: Scope, identifier: &str) -> KvResult<WindowCounters> {
        Ok(WindowCounters {
            second: self.read_counter(scope, identifier, "sec").await?,
            minute: self.read_counter(scope, identifier, "min").await?,
            hour: self.read_counter(scope, identifier, "hour").await?,
            day: self.read_counter(scope, identifier, "day").await?,
            connections: self.read_counter(scope, identifier, "conn").await?,
        })
    }

    async fn read_counter(&self, scope: Scope, identifier: &str, window: &str) -> KvResult<i64> {
        let value = self.kv.get(&rl_key(scope, identifier, window)).await?;
        Ok(value.and_then(|v| v.parse().ok()).unwrap_or(0))
    }

    /// Clear windowed counters, for one user or globally.
    ///
    /// Conn-count keys are left untouched: they mirror live connections and
    /// are decremented only by disconnects.
    pub async fn reset(&self, user_id: Option<&str>) -> KvResult<u64> {
        let targets: Vec<String> = match user_id {
            Some(id) => Window::ALL
                .iter()
                .map(|w| rl_key(Scope::User, id, w.suffix()))
                .collect(),
            None => self
                .kv
                .keys("rl:*")
                .await?
                .into_iter()
                .filter(|key| !key.ends_with(":conn"))
                .collect(),
        };

        let mut removed = 0;
        for key in targets {
            if self.kv.del(&key).await? {
                removed += 1;
            }
        }
        Ok(removed)
    }

    fn note_kv_error(&self, error: &KvError) {
        if matches!(error, KvError::Unavailable { .. }) {
            self.metrics.kv_unavailable.inc();
        }
    }
}
