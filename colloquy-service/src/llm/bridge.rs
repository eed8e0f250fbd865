//! Streaming bridge between the session layer and the provider.
//!
//! Each accepted user message becomes one bridge stream: a bounded channel
//! of `chat_chunk` envelopes sharing the inbound message id, sequences
//! 0..=N with exactly one final chunk. Upstream failure is reported as an
//! `error` envelope followed by a final chunk so the session can release
//! the request id either way. Cancellation is cooperative through a oneshot
//! signal; dropping the provider receiver closes the upstream handle.

use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use super::{Provider, ProviderEvent, ResponseCache, cache, format_messages};
use crate::config::LlmConfig;
use crate::telemetry::Metrics;
use crate::websocket::{ChatChunk, ChatMessage, Envelope};

pub struct StreamBridge {
    provider: Arc<dyn Provider>,
    cache: Arc<ResponseCache>,
    config: LlmConfig,
    metrics: Arc<Metrics>,
}

impl StreamBridge {
    pub fn new(
        provider: Arc<dyn Provider>,
        cache: Arc<ResponseCache>,
        config: LlmConfig,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            provider,
            cache,
            config,
            metrics,
        }
    }

    /// Open a response stream for one accepted user message.
    ///
    /// `context` is the conversation's recent history including the new
    /// message; chunks on the returned channel share `prompt_id`.
    pub fn stream_response(
        &self,
        prompt_id: String,
        context: Vec<ChatMessage>,
        cancel: oneshot::Receiver<()>,
    ) -> mpsc::Receiver<Envelope> {
        let (tx, rx) = mpsc::channel(100);

        let provider = self.provider.clone();
        let cache = self.cache.clone();
        let config = self.config.clone();
        let metrics = self.metrics.clone();

        tokio::spawn(async move {
            run(provider, cache, config, metrics, prompt_id, context, cancel, tx).await;
        });

        rx
    }
}

#[allow(clippy::too_many_arguments)]
async fn run(
    provider: Arc<dyn Provider>,
    cache: Arc<ResponseCache>,
    config: LlmConfig,
    metrics: Arc<Metrics>,
    prompt_id: String,
    context: Vec<ChatMessage>,
    mut cancel: oneshot::Receiver<()>,
    tx: mpsc::Sender<Envelope>,
) {
    let (messages, system) = format_messages(&context);
    let fingerprint = cache::fingerprint(
        &config.model,
        &system,
        &messages,
        config.temperature,
        config.max_tokens,
    );

    metrics.llm_requests.inc();

    if let Some(content) = cache.get(&fingerprint).await {
        metrics.llm_cache_hits.inc();
        debug!(prompt_id = %prompt_id, "Serving response from cache");
        let mut chunk = ChatChunk::terminal(&prompt_id, 0);
        chunk.delta = content;
        let _ = tx.send(Envelope::ChatChunk(chunk)).await;
        return;
    }
    if cache.enabled() {
        metrics.llm_cache_misses.inc();
    }

    let started = Instant::now();
    let mut events = match provider.stream(messages, system).await {
        Ok(events) => events,
        Err(e) => {
            metrics.llm_upstream_errors.inc();
            let _ = tx.send(Envelope::error(e.kind(), e.to_string())).await;
            let _ = tx
                .send(Envelope::ChatChunk(ChatChunk::terminal(&prompt_id, 0)))
                .await;
            return;
        }
    };

    let mut sequence: u64 = 0;
    let mut accumulated = String::new();
    let mut saw_delta = false;
    let mut cancel_open = true;

    loop {
        tokio::select! {
            result = &mut cancel, if cancel_open => {
                cancel_open = false;
                if result.is_ok() {
                    metrics.llm_cancelled.inc();
                    debug!(prompt_id = %prompt_id, sequence, "Stream cancelled");
                    let _ = tx
                        .send(Envelope::ChatChunk(ChatChunk::cancelled(&prompt_id, sequence)))
                        .await;
                    // Dropping `events` closes the provider handle.
                    return;
                }
                // Sender dropped without firing; keep streaming.
            }
            event = events.recv() => match event {
                Some(ProviderEvent::Delta(text)) => {
                    if !saw_delta {
                        saw_delta = true;
                        metrics
                            .llm_first_chunk_ms
                            .observe(started.elapsed().as_millis() as u64);
                    }
                    accumulated.push_str(&text);
                    let chunk = ChatChunk::delta(&prompt_id, sequence, text);
                    sequence += 1;
                    if tx.send(Envelope::ChatChunk(chunk)).await.is_err() {
                        return;
                    }
                }
                Some(ProviderEvent::Done) | None => {
                    metrics
                        .llm_stream_ms
                        .observe(started.elapsed().as_millis() as u64);
                    let _ = tx
                        .send(Envelope::ChatChunk(ChatChunk::terminal(&prompt_id, sequence)))
                        .await;
                    cache.put(&fingerprint, &accumulated).await;
                    return;
                }
                Some(ProviderEvent::Error(e)) => {
                    metrics.llm_upstream_errors.inc();
                    let _ = tx.send(Envelope::error(e.kind(), e.to_string())).await;
                    let _ = tx
                        .send(Envelope::ChatChunk(ChatChunk::terminal(&prompt_id, sequence)))
                        .await;
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ErrorKind, ProviderError};
    use crate::kv::MemoryKv;
    use crate::llm::ProviderMessage;
    use crate::websocket::{MetaValue, Role};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct ScriptedProvider {
        events: Mutex<Vec<ProviderEvent>>,
        hang_after: bool,
        calls: AtomicUsize,
    }

    impl ScriptedProvider {
        fn new(events: Vec<ProviderEvent>) -> Self {
            Self {
                events: Mutex::new(events),
                hang_after: false,
                calls: AtomicUsize::new(0),
            }
        }

        fn hanging(events: Vec<ProviderEvent>) -> Self {
            Self {
                hang_after: true,
                ..Self::new(events)
            }
        }
    }

    #[async_trait]
    impl Provider for ScriptedProvider {
        async fn stream(
            &self,
            _messages: Vec<ProviderMessage>,
            _system: Option<String>,
        ) -> Result<mpsc::Receiver<ProviderEvent>, ProviderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let events = self.events.lock().clone();
            let hang = self.hang_after;
            let (tx, rx) = mpsc::channel(16);
            tokio::spawn(async move {
                for event in events {
                    if tx.send(event).await.is_err() {
                        return;
                    }
                }
                if hang {
                    tokio::time::sleep(Duration::from_secs(60)).await;
                }
            });
            Ok(rx)
        }
    }

    struct ThrottledProvider;

    #[async_trait]
    impl Provider for ThrottledProvider {
        async fn stream(
            &self,
            _messages: Vec<ProviderMessage>,
            _system: Option<String>,
        ) -> Result<mpsc::Receiver<ProviderEvent>, ProviderError> {
            Err(ProviderError::Throttled {
                retry_after_secs: Some(5),
            })
        }
    }

    fn bridge_with(
        provider: Arc<dyn Provider>,
        config: LlmConfig,
    ) -> (StreamBridge, Arc<ResponseCache>) {
        let cache = Arc::new(ResponseCache::new(Arc::new(MemoryKv::new()), &config));
        let bridge = StreamBridge::new(provider, cache.clone(), config, Arc::new(Metrics::new()));
        (bridge, cache)
    }

    fn context() -> Vec<ChatMessage> {
        vec![ChatMessage::new(Role::User, "hi", "k-1")]
    }

    async fn collect(mut rx: mpsc::Receiver<Envelope>) -> Vec<Envelope> {
        let mut envelopes = Vec::new();
        while let Some(envelope) = rx.recv().await {
            envelopes.push(envelope);
        }
        envelopes
    }

    #[tokio::test]
    async fn test_chunks_are_sequenced_with_single_final() {
        let provider = Arc::new(ScriptedProvider::new(vec![
            ProviderEvent::Delta("Hel".to_string()),
            ProviderEvent::Delta("lo".to_string()),
            ProviderEvent::Done,
        ]));
        let (bridge, _cache) = bridge_with(provider, LlmConfig::default());

        let (_cancel_tx, cancel_rx) = oneshot::channel();
        let rx = bridge.stream_response("m-1".to_string(), context(), cancel_rx);
        let envelopes = collect(rx).await;

        assert_eq!(envelopes.len(), 3);
        let chunks: Vec<&ChatChunk> = envelopes
            .iter()
            .map(|e| match e {
                Envelope::ChatChunk(c) => c,
                other => panic!("unexpected envelope: {:?}", other),
            })
            .collect();

        assert_eq!(chunks[0].sequence, 0);
        assert_eq!(chunks[0].delta, "Hel");
        assert!(!chunks[0].is_final);
        assert_eq!(chunks[1].sequence, 1);
        assert_eq!(chunks[2].sequence, 2);
        assert!(chunks[2].is_final);
        assert!(chunks[2].delta.is_empty());
        assert!(chunks.iter().all(|c| c.id == "m-1"));
        assert_eq!(chunks.iter().filter(|c| c.is_final).count(), 1);
    }

    #[tokio::test]
    async fn test_upstream_error_sends_error_then_final() {
        let provider = Arc::new(ScriptedProvider::new(vec![
            ProviderEvent::Delta("partial".to_string()),
            ProviderEvent::Error(ProviderError::Unavailable {
                message: "reset by peer".to_string(),
            }),
        ]));
        let (bridge, _cache) = bridge_with(provider, LlmConfig::default());

        let (_cancel_tx, cancel_rx) = oneshot::channel();
        let rx = bridge.stream_response("m-2".to_string(), context(), cancel_rx);
        let envelopes = collect(rx).await;

        assert_eq!(envelopes.len(), 3);
        assert!(matches!(
            &envelopes[1],
            Envelope::Error { code: 5011, kind: ErrorKind::UpstreamUnavailable, .. }
        ));
        assert!(matches!(
            &envelopes[2],
            Envelope::ChatChunk(chunk) if chunk.is_final
        ));
    }

    #[tokio::test]
    async fn test_throttled_open_maps_to_5012() {
        let (bridge, _cache) = bridge_with(Arc::new(ThrottledProvider), LlmConfig::default());

        let (_cancel_tx, cancel_rx) = oneshot::channel();
        let rx = bridge.stream_response("m-3".to_string(), context(), cancel_rx);
        let envelopes = collect(rx).await;

        assert_eq!(envelopes.len(), 2);
        assert!(matches!(
            &envelopes[0],
            Envelope::Error { code: 5012, kind: ErrorKind::UpstreamThrottled, .. }
        ));
        assert!(matches!(
            &envelopes[1],
            Envelope::ChatChunk(chunk) if chunk.is_final && chunk.sequence == 0
        ));
    }

    #[tokio::test]
    async fn test_cancellation_emits_single_marked_final() {
        let provider = Arc::new(ScriptedProvider::hanging(vec![ProviderEvent::Delta(
            "first".to_string(),
        )]));
        let (bridge, _cache) = bridge_with(provider, LlmConfig::default());

        let (cancel_tx, cancel_rx) = oneshot::channel();
        let mut rx = bridge.stream_response("m-7".to_string(), context(), cancel_rx);

        let first = rx.recv().await.unwrap();
        assert!(matches!(
            &first,
            Envelope::ChatChunk(chunk) if chunk.sequence == 0 && !chunk.is_final
        ));

        cancel_tx.send(()).unwrap();

        let last = rx.recv().await.unwrap();
        match last {
            Envelope::ChatChunk(chunk) => {
                assert!(chunk.is_final);
                assert!(chunk.sequence >= 1);
                assert_eq!(chunk.metadata.get("cancelled"), Some(&MetaValue::Bool(true)));
            }
            other => panic!("unexpected envelope: {:?}", other),
        }

        // No further chunks for this id.
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_cache_hit_is_single_final_chunk() {
        let provider = Arc::new(ScriptedProvider::new(vec![]));
        let calls = &provider.calls;
        let config = LlmConfig::default();
        let (bridge, cache) = bridge_with(provider.clone(), config.clone());

        let ctx = context();
        let (messages, system) = format_messages(&ctx);
        let print = cache::fingerprint(
            &config.model,
            &system,
            &messages,
            config.temperature,
            config.max_tokens,
        );
        cache.put(&print, "cached answer").await;

        let (_cancel_tx, cancel_rx) = oneshot::channel();
        let rx = bridge.stream_response("m-4".to_string(), ctx, cancel_rx);
        let envelopes = collect(rx).await;

        assert_eq!(envelopes.len(), 1);
        assert!(matches!(
            &envelopes[0],
            Envelope::ChatChunk(chunk)
                if chunk.is_final && chunk.sequence == 0 && chunk.delta == "cached answer"
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_normal_completion_populates_cache() {
        let provider = Arc::new(ScriptedProvider::new(vec![
            ProviderEvent::Delta("a".to_string()),
            ProviderEvent::Delta("b".to_string()),
            ProviderEvent::Done,
        ]));
        let config = LlmConfig::default();
        let (bridge, cache) = bridge_with(provider, config.clone());

        let ctx = context();
        let (_cancel_tx, cancel_rx) = oneshot::channel();
        let rx = bridge.stream_response("m-5".to_string(), ctx.clone(), cancel_rx);
        collect(rx).await;

        let (messages, system) = format_messages(&ctx);
        let print = cache::fingerprint(
            &config.model,
            &system,
            &messages,
            config.temperature,
            config.max_tokens,
        );
        assert_eq!(cache.get(&print).await, Some("ab".to_string()));
    }
}
