use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::{info, warn};

mod api;
mod auth;
mod config;
mod error;
mod history;
mod kv;
mod limiter;
mod llm;
mod registry;
mod repo;
mod service;
mod telemetry;
mod websocket;

use crate::config::AppConfig;
use crate::kv::{KvStore, MemoryKv, RedisKv};
use crate::llm::HttpProvider;
use crate::repo::{MemoryUserRepository, NullMessageRepository};
use crate::service::ChatService;

// Re-export config crate types to avoid namespace collision
use ::config::{Config as ConfigBuilder, Environment, File};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_logging();

    info!(
        "Starting Colloquy session service v{}",
        env!("CARGO_PKG_VERSION")
    );

    let app_config: AppConfig = ConfigBuilder::builder()
        .add_source(File::with_name("config").required(false))
        .add_source(
            Environment::with_prefix("COLLOQUY")
                .separator("__")
                .try_parsing(true),
        )
        .build()?
        .try_deserialize()?;

    info!(
        host = %app_config.server.host,
        port = app_config.server.port,
        "Configuration loaded"
    );

    if app_config.server.tls_cert.is_some() || app_config.server.tls_key.is_some() {
        warn!("TLS material configured; this build expects TLS termination at the fronting proxy");
    }

    let kv: Arc<dyn KvStore> = if app_config.kv.url == "memory" {
        info!("Using in-process KV store");
        Arc::new(MemoryKv::new())
    } else {
        Arc::new(RedisKv::connect(&app_config.kv).await?)
    };

    // Deployments wire durable user and message stores here; the defaults
    // keep a fresh checkout runnable without external services.
    let users = Arc::new(MemoryUserRepository::new());
    let messages = Arc::new(NullMessageRepository::new());
    let provider = Arc::new(HttpProvider::new(app_config.llm.clone())?);

    let addr = format!("{}:{}", app_config.server.host, app_config.server.port);
    let service = ChatService::new(app_config, kv, users, messages, provider)?;
    let app = api::router(service);

    let listener = TcpListener::bind(&addr).await?;
    info!("Listening on {}", addr);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;

    Ok(())
}

fn init_logging() {
    use tracing_subscriber::{EnvFilter, fmt, prelude::*};

    let format = fmt::format().with_target(true).compact();

    // Use RUST_LOG if set, otherwise default to info level for our crate
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("colloquy_service=info"));

    tracing_subscriber::registry()
        .with(fmt::layer().event_format(format))
        .with(filter)
        .init();
}
