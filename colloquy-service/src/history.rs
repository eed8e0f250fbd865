//! Conversation history ring.
//!
//! A length-bounded, ordered record of recent chat messages per
//! conversation, kept in the shared KV store for cross-process visibility.
//! Append order at the store is the authoritative order for a conversation.
//! A local read-through cache holds the most recent window so reads degrade
//! gracefully during a store outage.

use dashmap::DashMap;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::HistoryConfig;
use crate::error::{KvError, ServiceResult};
use crate::kv::{KvCommand, KvStore, resolve_range};
use crate::telemetry::Metrics;
use crate::websocket::ChatMessage;

fn hist_key(conversation_id: &str) -> String {
    format!("hist:{}", conversation_id)
}

pub struct HistoryBuffer {
    kv: Arc<dyn KvStore>,
    cache: DashMap<String, VecDeque<ChatMessage>>,
    max_length: usize,
    retention: Option<Duration>,
    metrics: Arc<Metrics>,
}

impl HistoryBuffer {
    pub fn new(kv: Arc<dyn KvStore>, config: &HistoryConfig, metrics: Arc<Metrics>) -> Self {
        Self {
            kv,
            cache: DashMap::new(),
            max_length: config.max_length,
            retention: config.retention_secs.map(Duration::from_secs),
            metrics,
        }
    }

    pub fn max_length(&self) -> usize {
        self.max_length
    }

    /// Append a message and trim to the configured bound, as one pipelined
    /// batch. The local cache is updated even when the store is down so a
    /// later read has something to serve.
    pub async fn append(&self, conversation_id: &str, message: &ChatMessage) -> ServiceResult<()> {
        let key = hist_key(conversation_id);
        let json = serde_json::to_string(message).map_err(|e| {
            crate::error::ServiceError::Internal {
                message: format!("history serialization failed: {}", e),
            }
        })?;

        let mut commands = vec![
            KvCommand::Rpush(key.clone(), json),
            KvCommand::Ltrim(key.clone(), -(self.max_length as i64), -1),
        ];
        if let Some(retention) = self.retention {
            commands.push(KvCommand::Expire(key, retention));
        }

        let result = self.kv.exec(commands).await;

        let mut window = self.cache.entry(conversation_id.to_string()).or_default();
        window.push_back(message.clone());
        while window.len() > self.max_length {
            window.pop_front();
        }
        drop(window);

        match result {
            Ok(_) => Ok(()),
            Err(KvError::Unavailable { message: reason }) => {
                self.metrics.kv_unavailable.inc();
                warn!(
                    conversation_id = %conversation_id,
                    error = %reason,
                    "History append served by local cache only"
                );
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Inclusive, 0-indexed range from the oldest entry; negative indices
    /// count from the end. Reads fall back to the local window when the
    /// store is unavailable.
    pub async fn range(
        &self,
        conversation_id: &str,
        start: i64,
        stop: i64,
    ) -> ServiceResult<Vec<ChatMessage>> {
        match self.kv.lrange(&hist_key(conversation_id), start, stop).await {
            Ok(raw) => {
                let mut messages = Vec::with_capacity(raw.len());
                for item in raw {
                    match serde_json::from_str::<ChatMessage>(&item) {
                        Ok(message) => messages.push(message),
                        Err(e) => {
                            warn!(
                                conversation_id = %conversation_id,
                                error = %e,
                                "Skipping undecodable history entry"
                            );
                        }
                    }
                }
                Ok(messages)
            }
            Err(KvError::Unavailable { message }) => {
                self.metrics.kv_unavailable.inc();
                debug!(
                    conversation_id = %conversation_id,
                    error = %message,
                    "History range served from local cache"
                );
                Ok(self.cached_range(conversation_id, start, stop))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Find a message by id within the current window. Linear scan; only
    /// valid for the most recent `max_length` entries.
    pub async fn get(&self, conversation_id: &str, id: &str) -> ServiceResult<Option<ChatMessage>> {
        let window = self.range(conversation_id, 0, -1).await?;
        Ok(window.into_iter().find(|message| message.id == id))
    }

    fn cached_range(&self, conversation_id: &str, start: i64, stop: i64) -> Vec<ChatMessage> {
        let Some(window) = self.cache.get(conversation_id) else {
            return Vec::new();
        };
        match resolve_range(window.len(), start, stop) {
            Some((lo, hi)) => window.iter().skip(lo).take(hi - lo + 1).cloned().collect(),
            None => Vec::new(),
        }
    }
}
