//! WebSocket connection handling.
//!
//! Entry point called on upgrade: splits the socket, spawns the single
//! writer task that owns the sink, and drives the session state machine.
//! The writer drains the bounded outgoing queue and, once it closes, sends
//! whatever close frame the session left behind.

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use futures::SinkExt;
use futures::stream::{SplitSink, StreamExt};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info};
use uuid::Uuid;

use super::messages::Envelope;
use super::session::{Session, SessionReject};
use crate::error::ErrorKind;
use crate::service::ChatService;
use crate::telemetry::Metrics;

/// Close frame the writer sends after the outgoing queue drains.
type CloseSlot = Arc<Mutex<Option<(u16, String)>>>;

/// Handle one WebSocket connection from upgrade to teardown.
///
/// `token` and `conversation` come from the upgrade query string; headers
/// are not portable across transports and are not consulted.
pub async fn handle_ws_connection(
    socket: WebSocket,
    ip: String,
    token: Option<String>,
    conversation: Option<String>,
    service: Arc<ChatService>,
) {
    let connection_id = Uuid::new_v4().to_string();
    info!(connection_id = %connection_id, ip = %ip, "New WebSocket connection");
    service.metrics.ws_connections_opened.inc();

    let (ws_tx, ws_rx) = socket.split();
    let (out_tx, out_rx) = mpsc::channel::<Envelope>(service.config.server.outgoing_queue_size);
    let close_slot: CloseSlot = Arc::new(Mutex::new(None));

    let send_task = tokio::spawn(writer_loop(
        ws_tx,
        out_rx,
        close_slot.clone(),
        service.metrics.clone(),
        connection_id.clone(),
    ));
    let send_abort = send_task.abort_handle();

    let established = tokio::time::timeout(
        service.config.rate_limit.connect_timeout(),
        Session::establish(
            service.clone(),
            connection_id.clone(),
            ip,
            token,
            conversation,
            out_tx.clone(),
        ),
    )
    .await;

    match established {
        Ok(Ok(mut session)) => {
            let close = session.run(ws_rx).await;
            *close_slot.lock() = close;
            session.teardown().await;
        }
        Ok(Err(reject)) => {
            reject_connection(&service, &out_tx, &close_slot, reject).await;
        }
        Err(_elapsed) => {
            // The handshake may have been cancelled after admission was
            // charged; undo whatever made it into the registry.
            if let Some(meta) = service.registry.unregister(&connection_id) {
                service
                    .limiter
                    .release_connection(&meta.ip, &meta.user_id)
                    .await;
            }
            reject_connection(
                &service,
                &out_tx,
                &close_slot,
                SessionReject {
                    kind: ErrorKind::AuthenticationRequired,
                    message: "handshake timed out".to_string(),
                },
            )
            .await;
        }
    }

    // Closing the queue lets the writer flush pending envelopes, send the
    // close frame, and exit; the abort is a backstop for a wedged sink.
    drop(out_tx);
    let _ = tokio::time::timeout(Duration::from_secs(1), send_task).await;
    send_abort.abort();
}

async fn reject_connection(
    service: &Arc<ChatService>,
    out_tx: &mpsc::Sender<Envelope>,
    close_slot: &CloseSlot,
    reject: SessionReject,
) {
    info!(
        kind = reject.kind.as_str(),
        reason = %reject.message,
        "Connection rejected"
    );
    service.metrics.ws_connections_rejected.inc();

    let _ = out_tx
        .send(Envelope::error(reject.kind, reject.message.clone()))
        .await;
    *close_slot.lock() = Some((reject.kind.close_code().unwrap_or(1008), reject.message));
}

async fn writer_loop(
    mut ws_tx: SplitSink<WebSocket, Message>,
    mut out_rx: mpsc::Receiver<Envelope>,
    close_slot: CloseSlot,
    metrics: Arc<Metrics>,
    connection_id: String,
) {
    while let Some(envelope) = out_rx.recv().await {
        match serde_json::to_string(&envelope) {
            Ok(json) => {
                if ws_tx.send(Message::Text(json.into())).await.is_err() {
                    break;
                }
                metrics.ws_messages_sent.inc();
            }
            Err(e) => {
                error!(error = %e, "Failed to serialize envelope");
            }
        }
    }

    let frame = close_slot.lock().take();
    if let Some((code, reason)) = frame {
        let _ = ws_tx
            .send(Message::Close(Some(CloseFrame {
                code,
                reason: reason.into(),
            })))
            .await;
    }
    debug!(connection_id = %connection_id, "WebSocket send task ended");
}
