use axum::{
    Json, Router,
    extract::{ConnectInfo, Query, State, WebSocketUpgrade},
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::auth::Principal;
use crate::error::ErrorResponse;
use crate::limiter::{Scope, WindowCounters};
use crate::registry::ConnectionSnapshot;
use crate::service::ChatService;
use crate::telemetry::MetricsSnapshot;
use crate::websocket::handle_ws_connection;

/// Application state
pub struct AppState {
    pub service: Arc<ChatService>,
    pub start_time: Instant,
}

/// Build the API router
pub fn router(service: Arc<ChatService>) -> Router {
    let state = Arc::new(AppState {
        service,
        start_time: Instant::now(),
    });

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .route("/ws", get(ws_handler))
        .route("/ws/status", get(ws_status_handler))
        .route("/admin/rate-limits/reset", post(reset_rate_limits_handler))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// === WebSocket ===

#[derive(Deserialize)]
struct WsParams {
    token: Option<String>,
    conversation: Option<String>,
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<WsParams>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    info!(ip = %addr.ip(), "WebSocket upgrade request received");
    ws.on_upgrade(move |socket| {
        handle_ws_connection(
            socket,
            addr.ip().to_string(),
            params.token,
            params.conversation,
            state.service.clone(),
        )
    })
}

// === Health & Metrics ===

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
    uptime_seconds: u64,
    kv_available: bool,
    provider_configured: bool,
    active_connections: usize,
}

async fn health_handler(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let kv_available = state.service.kv.ttl("health:probe").await.is_ok();
    let provider_configured = !state.service.config.llm.api_key.is_empty();

    let status = if kv_available {
        "healthy".to_string()
    } else {
        "degraded: kv store unavailable".to_string()
    };

    Json(HealthResponse {
        status,
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_seconds: state.start_time.elapsed().as_secs(),
        kv_available,
        provider_configured,
        active_connections: state.service.registry.len(),
    })
}

async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let snapshot = state.service.metrics.snapshot();
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        render_metrics(&snapshot),
    )
}

fn render_metrics(snapshot: &MetricsSnapshot) -> String {
    let mut out = String::new();
    {
        let mut counter = |name: &str, help: &str, value: u64| {
            out.push_str(&format!(
                "# HELP colloquy_{name} {help}\n# TYPE colloquy_{name} counter\ncolloquy_{name} {value}\n",
            ));
        };

        counter(
            "ws_connections_opened_total",
            "WebSocket connections opened",
            snapshot.ws_connections_opened,
        );
        counter(
            "ws_connections_closed_total",
            "WebSocket connections closed",
            snapshot.ws_connections_closed,
        );
        counter(
            "ws_connections_rejected_total",
            "WebSocket connections rejected",
            snapshot.ws_connections_rejected,
        );
        counter(
            "ws_messages_received_total",
            "Envelopes received from peers",
            snapshot.ws_messages_received,
        );
        counter(
            "ws_messages_sent_total",
            "Envelopes written to peers",
            snapshot.ws_messages_sent,
        );
        counter(
            "ws_malformed_frames_total",
            "Frames rejected as malformed or unknown",
            snapshot.ws_malformed_frames,
        );
        counter(
            "ws_broadcast_dropped_total",
            "Envelopes refused by saturated outgoing queues",
            snapshot.ws_broadcast_dropped,
        );
        counter(
            "rl_messages_denied_total",
            "Messages denied by the rate limiter",
            snapshot.rl_messages_denied,
        );
        counter(
            "rl_connections_denied_total",
            "Connections denied by the rate limiter",
            snapshot.rl_connections_denied,
        );
        counter(
            "rl_system_bypass_total",
            "Admin system envelopes bypassing rate counting",
            snapshot.rl_system_bypass,
        );
        counter(
            "kv_unavailable_total",
            "KV store failures observed",
            snapshot.kv_unavailable,
        );
        counter(
            "llm_requests_total",
            "Upstream completion requests",
            snapshot.llm_requests,
        );
        counter(
            "llm_upstream_errors_total",
            "Upstream provider failures",
            snapshot.llm_upstream_errors,
        );
        counter(
            "llm_cancelled_total",
            "Streams cancelled by clients",
            snapshot.llm_cancelled,
        );
        counter(
            "llm_cache_hits_total",
            "Response cache hits",
            snapshot.llm_cache_hits,
        );
        counter(
            "llm_cache_misses_total",
            "Response cache misses",
            snapshot.llm_cache_misses,
        );
    }

    let mut gauge = |name: &str, help: &str, value: f64| {
        out.push_str(&format!(
            "# HELP colloquy_{name} {help}\n# TYPE colloquy_{name} gauge\ncolloquy_{name} {value}\n",
        ));
    };

    gauge(
        "ws_active_connections",
        "Live WebSocket connections",
        snapshot.ws_active_connections as f64,
    );
    gauge(
        "llm_first_chunk_mean_ms",
        "Mean time to first streamed chunk",
        snapshot.llm_first_chunk_mean_ms,
    );
    gauge(
        "llm_stream_mean_ms",
        "Mean full-stream duration",
        snapshot.llm_stream_mean_ms,
    );
    out
}

// === Admin ===

#[derive(Serialize)]
struct ConnectionStatus {
    #[serde(flatten)]
    connection: ConnectionSnapshot,
    counters: WindowCounters,
}

#[derive(Serialize)]
struct WsStatusResponse {
    active_connections: Vec<ConnectionStatus>,
    total_connections: usize,
}

async fn ws_status_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<WsStatusResponse>, Response> {
    require_admin(&state, &headers).await?;

    let snapshots = state.service.registry.snapshots();
    let mut active_connections = Vec::with_capacity(snapshots.len());
    for connection in snapshots {
        let counters = state
            .service
            .limiter
            .counters(Scope::User, &connection.user_id)
            .await
            .unwrap_or_default();
        active_connections.push(ConnectionStatus {
            connection,
            counters,
        });
    }

    let total_connections = active_connections.len();
    Ok(Json(WsStatusResponse {
        active_connections,
        total_connections,
    }))
}

#[derive(Deserialize)]
struct ResetRequest {
    user_id: Option<String>,
}

#[derive(Serialize)]
struct ResetResponse {
    removed: u64,
}

async fn reset_rate_limits_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(request): Json<ResetRequest>,
) -> Result<Json<ResetResponse>, Response> {
    let principal = require_admin(&state, &headers).await?;

    let removed = state
        .service
        .limiter
        .reset(request.user_id.as_deref())
        .await
        .map_err(|e| crate::error::ServiceError::from(e).into_response())?;

    info!(
        admin = %principal.user_id,
        user_id = ?request.user_id,
        removed,
        "Rate limit counters reset"
    );
    Ok(Json(ResetResponse { removed }))
}

/// Resolve the bearer token in `Authorization` and require admin privilege.
async fn require_admin(state: &Arc<AppState>, headers: &HeaderMap) -> Result<Principal, Response> {
    let token = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .ok_or_else(|| {
            error_response(StatusCode::UNAUTHORIZED, "authentication required")
        })?;

    let principal = state
        .service
        .auth
        .verify(token)
        .await
        .map_err(|e| error_response(StatusCode::UNAUTHORIZED, &e.to_string()))?;

    if !principal.is_admin {
        return Err(error_response(
            StatusCode::FORBIDDEN,
            "admin privilege required",
        ));
    }
    Ok(principal)
}

fn error_response(status: StatusCode, message: &str) -> Response {
    (
        status,
        Json(ErrorResponse {
            message: message.to_string(),
            code: None,
        }),
    )
        .into_response()
}
