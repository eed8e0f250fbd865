//! Service coordinator.
//!
//! Owns the collaborators every session needs. Constructed once in main
//! with explicit dependencies (no ambient singletons) and shared as an
//! `Arc` by the router and each connection handler.

use std::sync::Arc;
use tracing::info;

use crate::auth::AuthValidator;
use crate::config::AppConfig;
use crate::error::ServiceResult;
use crate::history::HistoryBuffer;
use crate::kv::KvStore;
use crate::limiter::RateLimiter;
use crate::llm::{Provider, ResponseCache, StreamBridge};
use crate::registry::ConnectionRegistry;
use crate::repo::{MessageRepository, UserRepository};
use crate::telemetry::Metrics;

pub struct ChatService {
    pub config: AppConfig,
    pub kv: Arc<dyn KvStore>,
    pub limiter: Arc<RateLimiter>,
    pub registry: Arc<ConnectionRegistry>,
    pub history: Arc<HistoryBuffer>,
    pub auth: Arc<AuthValidator>,
    pub bridge: Arc<StreamBridge>,
    pub messages: Arc<dyn MessageRepository>,
    pub metrics: Arc<Metrics>,
}

impl ChatService {
    /// Wire up the service from its collaborators.
    pub fn new(
        config: AppConfig,
        kv: Arc<dyn KvStore>,
        users: Arc<dyn UserRepository>,
        messages: Arc<dyn MessageRepository>,
        provider: Arc<dyn Provider>,
    ) -> ServiceResult<Arc<Self>> {
        let metrics = Arc::new(Metrics::new());

        let limiter = Arc::new(RateLimiter::new(
            kv.clone(),
            config.rate_limit.clone(),
            metrics.clone(),
        ));
        let registry = Arc::new(ConnectionRegistry::new(metrics.clone()));
        let history = Arc::new(HistoryBuffer::new(kv.clone(), &config.history, metrics.clone()));
        let auth = Arc::new(AuthValidator::new(&config.auth, users)?);
        let cache = Arc::new(ResponseCache::new(kv.clone(), &config.llm));
        let bridge = Arc::new(StreamBridge::new(
            provider,
            cache,
            config.llm.clone(),
            metrics.clone(),
        ));

        info!(
            model = %config.llm.model,
            history_max = config.history.max_length,
            "Chat service initialized"
        );

        Ok(Arc::new(Self {
            config,
            kv,
            limiter,
            registry,
            history,
            auth,
            bridge,
            messages,
            metrics,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AuthConfig;
    use crate::kv::MemoryKv;
    use crate::llm::HttpProvider;
    use crate::repo::{MemoryUserRepository, NullMessageRepository};

    fn test_config() -> AppConfig {
        serde_json::from_str(r#"{ "auth": { "token_secret": "s" } }"#).unwrap()
    }

    #[tokio::test]
    async fn test_service_wires_up() {
        let config = test_config();
        let provider = Arc::new(HttpProvider::new(config.llm.clone()).unwrap());
        let service = ChatService::new(
            config,
            Arc::new(MemoryKv::new()),
            Arc::new(MemoryUserRepository::new()),
            Arc::new(NullMessageRepository::new()),
            provider,
        )
        .unwrap();

        assert!(service.registry.is_empty());
        assert_eq!(service.metrics.ws_connections_opened.get(), 0);
    }

    #[tokio::test]
    async fn test_missing_secret_is_config_error() {
        let config = AppConfig {
            auth: AuthConfig {
                token_secret: String::new(),
                token_algorithm: "HS256".to_string(),
            },
            ..test_config()
        };
        let provider = Arc::new(HttpProvider::new(config.llm.clone()).unwrap());
        let result = ChatService::new(
            config,
            Arc::new(MemoryKv::new()),
            Arc::new(MemoryUserRepository::new()),
            Arc::new(NullMessageRepository::new()),
            provider,
        );
        assert!(result.is_err());
    }
}
