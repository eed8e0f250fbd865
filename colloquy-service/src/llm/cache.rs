//! Content-addressed response cache.
//!
//! Maps a fingerprint of (model, system prompt, formatted messages,
//! sampling parameters) to a full prior response in the KV store. The cache
//! is authoritative only for deterministic sampling (temperature 0); any
//! other parameter set disables both reads and writes.

use serde::Serialize;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use super::ProviderMessage;
use crate::config::LlmConfig;
use crate::kv::KvStore;

#[derive(Serialize)]
struct FingerprintInput<'a> {
    model: &'a str,
    system: &'a Option<String>,
    messages: &'a [ProviderMessage],
    temperature: f32,
    max_tokens: u32,
}

/// Compute the cache fingerprint for a formatted request.
pub fn fingerprint(
    model: &str,
    system: &Option<String>,
    messages: &[ProviderMessage],
    temperature: f32,
    max_tokens: u32,
) -> String {
    let input = FingerprintInput {
        model,
        system,
        messages,
        temperature,
        max_tokens,
    };
    let mut hasher = Sha256::new();
    // Struct field order is fixed, so the serialization is canonical.
    hasher.update(serde_json::to_vec(&input).unwrap_or_default());
    format!("{:x}", hasher.finalize())
}

pub struct ResponseCache {
    kv: Arc<dyn KvStore>,
    ttl: Duration,
    enabled: bool,
}

impl ResponseCache {
    pub fn new(kv: Arc<dyn KvStore>, config: &LlmConfig) -> Self {
        Self {
            kv,
            ttl: Duration::from_secs(config.cache_ttl_secs),
            enabled: config.cache_enabled && config.deterministic(),
        }
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    fn key(fingerprint: &str) -> String {
        format!("llmcache:{}", fingerprint)
    }

    /// Look up a prior response. Misses and store failures both read as
    /// absent; the caller falls through to the provider either way.
    pub async fn get(&self, fingerprint: &str) -> Option<String> {
        if !self.enabled {
            return None;
        }

        match self.kv.get(&Self::key(fingerprint)).await {
            Ok(hit) => hit,
            Err(e) => {
                debug!(error = %e, "Response cache read failed");
                None
            }
        }
    }

    /// Store a completed response, best effort.
    pub async fn put(&self, fingerprint: &str, content: &str) {
        if !self.enabled || content.is_empty() {
            return;
        }

        if let Err(e) = self
            .kv
            .set(&Self::key(fingerprint), content, Some(self.ttl))
            .await
        {
            warn!(error = %e, "Response cache write failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::MemoryKv;

    fn deterministic_config() -> LlmConfig {
        LlmConfig {
            temperature: 0.0,
            cache_enabled: true,
            ..Default::default()
        }
    }

    #[test]
    fn test_fingerprint_is_stable() {
        let messages = vec![ProviderMessage::user("hi")];
        let a = fingerprint("model-a", &None, &messages, 0.0, 1024);
        let b = fingerprint("model-a", &None, &messages, 0.0, 1024);
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn test_fingerprint_varies_by_input() {
        let messages = vec![ProviderMessage::user("hi")];
        let base = fingerprint("model-a", &None, &messages, 0.0, 1024);

        assert_ne!(base, fingerprint("model-b", &None, &messages, 0.0, 1024));
        assert_ne!(
            base,
            fingerprint(
                "model-a",
                &Some("system".to_string()),
                &messages,
                0.0,
                1024
            )
        );
        assert_ne!(
            base,
            fingerprint(
                "model-a",
                &None,
                &[ProviderMessage::user("bye")],
                0.0,
                1024
            )
        );
        assert_ne!(base, fingerprint("model-a", &None, &messages, 0.7, 1024));
    }

    #[tokio::test]
    async fn test_put_then_get_roundtrip() {
        let cache = ResponseCache::new(Arc::new(MemoryKv::new()), &deterministic_config());
        cache.put("abc", "full response").await;
        assert_eq!(cache.get("abc").await, Some("full response".to_string()));
        assert_eq!(cache.get("missing").await, None);
    }

    #[tokio::test]
    async fn test_nondeterministic_sampling_disables_cache() {
        let config = LlmConfig {
            temperature: 0.7,
            cache_enabled: true,
            ..Default::default()
        };
        let cache = ResponseCache::new(Arc::new(MemoryKv::new()), &config);

        assert!(!cache.enabled());
        cache.put("abc", "full response").await;
        assert_eq!(cache.get("abc").await, None);
    }

    #[tokio::test]
    async fn test_cache_flag_disables_cache() {
        let config = LlmConfig {
            cache_enabled: false,
            ..deterministic_config()
        };
        let cache = ResponseCache::new(Arc::new(MemoryKv::new()), &config);
        assert!(!cache.enabled());
    }

    #[tokio::test]
    async fn test_store_outage_reads_as_miss() {
        let kv = Arc::new(MemoryKv::new());
        let cache = ResponseCache::new(kv.clone(), &deterministic_config());
        cache.put("abc", "response").await;

        kv.set_offline(true);
        assert_eq!(cache.get("abc").await, None);
    }
}
