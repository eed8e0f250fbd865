//! Service configuration.
//!
//! Loaded once at startup from an optional `config` file plus environment
//! variables with the `COLLOQUY` prefix (`__` separator), e.g.
//! `COLLOQUY__RATE_LIMIT__MESSAGES_PER_SECOND=5`.

use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_server")]
    pub server: ServerConfig,

    #[serde(default = "default_auth")]
    pub auth: AuthConfig,

    #[serde(default)]
    pub rate_limit: RateLimitConfig,

    #[serde(default)]
    pub history: HistoryConfig,

    #[serde(default)]
    pub llm: LlmConfig,

    #[serde(default)]
    pub kv: KvConfig,

    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

/// HTTP/WebSocket server configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// PEM certificate chain; TLS is enabled when both paths are set.
    #[serde(default)]
    pub tls_cert: Option<PathBuf>,

    #[serde(default)]
    pub tls_key: Option<PathBuf>,

    /// Per-connection outgoing queue bound. Overflow marks the connection
    /// unresponsive rather than dropping envelopes.
    #[serde(default = "default_outgoing_queue")]
    pub outgoing_queue_size: usize,
}

/// Bearer token validation configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AuthConfig {
    pub token_secret: String,

    #[serde(default = "default_token_algorithm")]
    pub token_algorithm: String,
}

/// Rate limiter windows and concurrency caps
#[derive(Debug, Clone, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default = "default_max_connections_per_ip")]
    pub max_connections_per_ip: u32,

    #[serde(default = "default_max_connections_per_user")]
    pub max_connections_per_user: u32,

    #[serde(default = "default_messages_per_second")]
    pub messages_per_second: u32,

    #[serde(default = "default_messages_per_minute")]
    pub messages_per_minute: u32,

    #[serde(default = "default_messages_per_hour")]
    pub messages_per_hour: u32,

    #[serde(default = "default_messages_per_day")]
    pub messages_per_day: u32,

    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,

    #[serde(default = "default_message_timeout_secs")]
    pub message_timeout_secs: u64,
}

impl RateLimitConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn message_timeout(&self) -> Duration {
        Duration::from_secs(self.message_timeout_secs)
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_connections_per_ip: default_max_connections_per_ip(),
            max_connections_per_user: default_max_connections_per_user(),
            messages_per_second: default_messages_per_second(),
            messages_per_minute: default_messages_per_minute(),
            messages_per_hour: default_messages_per_hour(),
            messages_per_day: default_messages_per_day(),
            connect_timeout_secs: default_connect_timeout_secs(),
            message_timeout_secs: default_message_timeout_secs(),
        }
    }
}

/// Conversation history ring configuration
#[derive(Debug, Clone, Deserialize)]
pub struct HistoryConfig {
    #[serde(default = "default_history_max_length")]
    pub max_length: usize,

    /// Conversation joined when the upgrade request names none.
    #[serde(default = "default_conversation")]
    pub default_conversation: String,

    /// Optional per-conversation retention; entries older than this are
    /// expired by the KV store alongside the list key.
    #[serde(default)]
    pub retention_secs: Option<u64>,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            max_length: default_history_max_length(),
            default_conversation: default_conversation(),
            retention_secs: None,
        }
    }
}

/// Upstream LLM provider configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LlmConfig {
    #[serde(default = "default_llm_endpoint")]
    pub endpoint: String,

    #[serde(default)]
    pub api_key: String,

    #[serde(default = "default_llm_api_version")]
    pub api_version: String,

    #[serde(default = "default_llm_model")]
    pub model: String,

    #[serde(default = "default_llm_temperature")]
    pub temperature: f32,

    #[serde(default = "default_llm_max_tokens")]
    pub max_tokens: u32,

    #[serde(default = "default_true")]
    pub cache_enabled: bool,

    #[serde(default = "default_llm_cache_ttl_secs")]
    pub cache_ttl_secs: u64,

    #[serde(default = "default_llm_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl LlmConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// The response cache is authoritative only for deterministic sampling.
    pub fn deterministic(&self) -> bool {
        self.temperature == 0.0
    }
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            endpoint: default_llm_endpoint(),
            api_key: String::new(),
            api_version: default_llm_api_version(),
            model: default_llm_model(),
            temperature: default_llm_temperature(),
            max_tokens: default_llm_max_tokens(),
            cache_enabled: true,
            cache_ttl_secs: default_llm_cache_ttl_secs(),
            request_timeout_secs: default_llm_request_timeout_secs(),
        }
    }
}

/// Shared KV store configuration
#[derive(Debug, Clone, Deserialize)]
pub struct KvConfig {
    /// Store endpoint. The literal value `memory` selects the in-process
    /// backend for single-node and development runs.
    #[serde(default = "default_kv_url")]
    pub url: String,

    #[serde(default)]
    pub password: Option<String>,

    #[serde(default = "default_kv_pool_size")]
    pub pool_size: u32,

    #[serde(default = "default_kv_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
}

impl Default for KvConfig {
    fn default() -> Self {
        Self {
            url: default_kv_url(),
            password: None,
            pool_size: default_kv_pool_size(),
            connect_timeout_secs: default_kv_connect_timeout_secs(),
        }
    }
}

/// Telemetry export configuration
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TelemetryConfig {
    /// Optional push endpoint for an external sink; metrics are always
    /// served on `/metrics` regardless.
    #[serde(default)]
    pub endpoint: Option<String>,
}

// ==================== Default Value Functions ====================

fn default_server() -> ServerConfig {
    ServerConfig {
        host: default_host(),
        port: default_port(),
        tls_cert: None,
        tls_key: None,
        outgoing_queue_size: default_outgoing_queue(),
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_outgoing_queue() -> usize {
    64
}

fn default_auth() -> AuthConfig {
    AuthConfig {
        token_secret: String::new(),
        token_algorithm: default_token_algorithm(),
    }
}

fn default_token_algorithm() -> String {
    "HS256".to_string()
}

fn default_max_connections_per_ip() -> u32 {
    2
}

fn default_max_connections_per_user() -> u32 {
    5
}

fn default_messages_per_second() -> u32 {
    5
}

fn default_messages_per_minute() -> u32 {
    60
}

fn default_messages_per_hour() -> u32 {
    1000
}

fn default_messages_per_day() -> u32 {
    10000
}

fn default_connect_timeout_secs() -> u64 {
    10
}

fn default_message_timeout_secs() -> u64 {
    30
}

fn default_history_max_length() -> usize {
    100
}

fn default_conversation() -> String {
    "lobby".to_string()
}

fn default_llm_endpoint() -> String {
    "https://api.anthropic.com".to_string()
}

fn default_llm_api_version() -> String {
    "2023-06-01".to_string()
}

fn default_llm_model() -> String {
    "claude-3-5-sonnet-latest".to_string()
}

fn default_llm_temperature() -> f32 {
    0.0
}

fn default_llm_max_tokens() -> u32 {
    1024
}

fn default_llm_cache_ttl_secs() -> u64 {
    86_400
}

fn default_llm_request_timeout_secs() -> u64 {
    120
}

fn default_true() -> bool {
    true
}

fn default_kv_url() -> String {
    "redis://127.0.0.1:6379/0".to_string()
}

fn default_kv_pool_size() -> u32 {
    10
}

fn default_kv_connect_timeout_secs() -> u64 {
    5
}
