//! Per-connection session state machine.
//!
//! One session owns one connection: it authenticates the handshake, walks
//! the lifecycle states, and then multiplexes peer frames, bridge chunks,
//! and timer ticks in a single logical thread of control. All writes leave
//! through the bounded outgoing queue drained by the connection's writer
//! task, so outbound order is the submission order.

use axum::extract::ws::{Message, WebSocket};
use chrono::Utc;
use futures::StreamExt;
use futures::stream::SplitStream;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::auth::Principal;
use crate::error::{AuthError, ErrorKind};
use crate::registry::{ConnectionMeta, ConnectionState};
use crate::service::ChatService;
use crate::websocket::messages::{
    ChatMessage, Envelope, LimitsSnapshot, PresenceState, Role, SystemMessage,
};

/// Upper bound on one chat message's content.
const MAX_MESSAGE_LENGTH: usize = 4096;

/// Malformed-input burst that escalates to CLOSING.
const MALFORMED_BURST_LIMIT: u32 = 5;
const MALFORMED_BURST_WINDOW: Duration = Duration::from_secs(1);

/// Prompts queued behind an in-flight response before new ones are refused.
const MAX_PENDING_PROMPTS: usize = 8;

/// Why a handshake was refused before the session was established.
#[derive(Debug)]
pub(crate) struct SessionReject {
    pub kind: ErrorKind,
    pub message: String,
}

impl SessionReject {
    fn auth(error: AuthError) -> Self {
        Self {
            kind: ErrorKind::AuthenticationRequired,
            message: error.to_string(),
        }
    }
}

/// Loop decision after handling one event.
enum Flow {
    Continue,
    /// Install (or clear) the in-flight chunk stream.
    SetStream(Option<mpsc::Receiver<Envelope>>),
    /// Leave the loop; `Some` carries a close frame for the peer.
    Close(Option<(u16, String)>),
}

#[derive(Debug)]
struct InFlight {
    id: String,
    cancel: Option<oneshot::Sender<()>>,
}

pub(crate) struct Session {
    service: Arc<ChatService>,
    connection_id: String,
    principal: Principal,
    ip: String,
    conversation_id: String,
    outgoing: mpsc::Sender<Envelope>,
    in_flight: Option<InFlight>,
    accumulated: String,
    pending_prompts: VecDeque<ChatMessage>,
    ping_nonce: u64,
    malformed_count: u32,
    malformed_window_start: Instant,
    last_activity: Instant,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("connection_id", &self.connection_id)
            .field("conversation_id", &self.conversation_id)
            .finish_non_exhaustive()
    }
}

impl Session {
    /// Drive the handshake: authenticate, admit, register, and replay.
    ///
    /// The caller bounds this with connect_timeout; on success the
    /// connection has already received `welcome` and `history` and sits in
    /// READY.
    pub(crate) async fn establish(
        service: Arc<ChatService>,
        connection_id: String,
        ip: String,
        token: Option<String>,
        conversation: Option<String>,
        outgoing: mpsc::Sender<Envelope>,
    ) -> Result<Self, SessionReject> {
        let token = token.ok_or_else(|| SessionReject {
            kind: ErrorKind::AuthenticationRequired,
            message: "authentication required".to_string(),
        })?;

        let principal = service
            .auth
            .verify(&token)
            .await
            .map_err(SessionReject::auth)?;

        if !service
            .limiter
            .admit_connection(&ip, &principal.user_id)
            .await
            .is_allowed()
        {
            return Err(SessionReject {
                kind: ErrorKind::ConnectionLimitExceeded,
                message: "connection limit exceeded".to_string(),
            });
        }

        let conversation_id =
            conversation.unwrap_or_else(|| service.config.history.default_conversation.clone());

        let meta = ConnectionMeta::new(
            &connection_id,
            &principal.user_id,
            principal.is_admin,
            &ip,
            &conversation_id,
        );
        service.registry.register(meta, outgoing.clone());

        let session = Self {
            service,
            connection_id,
            principal,
            ip,
            conversation_id,
            outgoing,
            in_flight: None,
            accumulated: String::new(),
            pending_prompts: VecDeque::new(),
            ping_nonce: 0,
            malformed_count: 0,
            malformed_window_start: Instant::now(),
            last_activity: Instant::now(),
        };

        session.transition(ConnectionState::Authenticating);
        session.transition(ConnectionState::Authenticated);

        session.send(Envelope::Welcome {
            server_time: Utc::now(),
            connection_id: session.connection_id.clone(),
            limits: LimitsSnapshot::from(&session.service.config.rate_limit),
        });

        let messages = session
            .service
            .history
            .range(&session.conversation_id, 0, -1)
            .await
            .unwrap_or_default();
        session.send(Envelope::History { messages });

        session.broadcast_presence(PresenceState::Online);
        session.transition(ConnectionState::Ready);

        info!(
            connection_id = %session.connection_id,
            user_id = %session.principal.user_id,
            conversation_id = %session.conversation_id,
            "Session established"
        );
        Ok(session)
    }

    /// Main multiplexing loop. Returns the close frame to send, if any.
    pub(crate) async fn run(&mut self, mut ws_rx: SplitStream<WebSocket>) -> Option<(u16, String)> {
        let message_timeout = self.service.config.rate_limit.message_timeout();
        let mut interval = tokio::time::interval(message_timeout / 2);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // The first tick resolves immediately; skip it so an idle ping is
        // not the very first envelope after welcome.
        interval.tick().await;

        let mut stream_rx: Option<mpsc::Receiver<Envelope>> = None;

        loop {
            let flow = tokio::select! {
                frame = ws_rx.next() => match frame {
                    Some(Ok(message)) => self.handle_frame(message).await,
                    Some(Err(e)) => {
                        debug!(connection_id = %self.connection_id, error = %e, "Transport error");
                        Flow::Close(None)
                    }
                    None => Flow::Close(None),
                },
                chunk = next_chunk(&mut stream_rx) => self.handle_chunk(chunk).await,
                _ = interval.tick() => self.handle_tick(message_timeout).await,
            };

            match flow {
                Flow::Continue => {}
                Flow::SetStream(rx) => stream_rx = rx,
                Flow::Close(frame) => return frame,
            }
        }
    }

    /// Release everything this connection holds. Runs unconditionally at
    /// the end of the transport's life.
    pub(crate) async fn teardown(self) {
        let _ = self
            .service
            .registry
            .transition(&self.connection_id, ConnectionState::Closing);
        let _ = self
            .service
            .registry
            .transition(&self.connection_id, ConnectionState::Closed);
        self.service.registry.unregister(&self.connection_id);

        self.service
            .limiter
            .release_connection(&self.ip, &self.principal.user_id)
            .await;

        if self.service.registry.count_by_user(&self.principal.user_id) == 0 {
            self.service.registry.broadcast(
                &self.conversation_id,
                &Envelope::Presence {
                    user_id: self.principal.user_id.clone(),
                    state: PresenceState::Offline,
                },
                None,
            );
        }

        self.service.metrics.ws_connections_closed.inc();
        info!(connection_id = %self.connection_id, "Session closed");
    }

    async fn handle_frame(&mut self, message: Message) -> Flow {
        match message {
            Message::Text(text) => {
                self.touch();
                match serde_json::from_str::<Envelope>(&text) {
                    Ok(envelope) => {
                        self.service.metrics.ws_messages_received.inc();
                        self.handle_envelope(envelope).await
                    }
                    Err(e) => {
                        debug!(
                            connection_id = %self.connection_id,
                            error = %e,
                            "Undecodable frame"
                        );
                        self.validation_error("invalid or unknown envelope")
                    }
                }
            }
            Message::Binary(_) => {
                self.touch();
                self.validation_error("binary frames are not supported")
            }
            Message::Ping(_) | Message::Pong(_) => {
                self.touch();
                self.service.registry.heartbeat(&self.connection_id);
                Flow::Continue
            }
            Message::Close(_) => {
                debug!(connection_id = %self.connection_id, "Peer closed");
                Flow::Close(None)
            }
        }
    }

    async fn handle_envelope(&mut self, envelope: Envelope) -> Flow {
        self.service.registry.heartbeat(&self.connection_id);

        match envelope {
            Envelope::ChatMessage(message) => self.handle_chat(message).await,
            Envelope::Cancel { id } => self.handle_cancel(&id),
            Envelope::Ping { nonce } => {
                self.send(Envelope::Pong { nonce });
                Flow::Continue
            }
            Envelope::Pong { .. } => Flow::Continue,
            Envelope::Presence { state, .. } => {
                self.service
                    .registry
                    .set_typing(&self.connection_id, state == PresenceState::Typing);
                self.broadcast_presence(state);
                Flow::Continue
            }
            Envelope::System(system) => self.handle_system(system).await,
            Envelope::ChatChunk(_)
            | Envelope::Welcome { .. }
            | Envelope::History { .. }
            | Envelope::Error { .. } => {
                self.validation_error("server-originated envelope type")
            }
        }
    }

    async fn handle_chat(&mut self, mut message: ChatMessage) -> Flow {
        let content = message.content.trim();
        if content.is_empty() {
            return self.validation_error("missing or empty content");
        }
        if message.content.len() > MAX_MESSAGE_LENGTH {
            return self.validation_error("message exceeds maximum length");
        }

        let admission = self
            .service
            .limiter
            .admit_message(&self.principal.user_id, false)
            .await;
        if !admission.is_allowed() {
            self.send(Envelope::error(
                ErrorKind::RateLimitExceeded,
                "rate limit exceeded, slow down",
            ));
            return Flow::Continue;
        }

        // The session's conversation is authoritative for fan-out and
        // history; the sender role cannot be spoofed.
        if message.id.is_empty() {
            message.id = Uuid::new_v4().to_string();
        }
        message.role = Role::User;
        message.conversation_id = self.conversation_id.clone();
        message.timestamp = Utc::now();

        self.service
            .registry
            .set_last_message(&self.connection_id, &message.id);

        if let Err(e) = self
            .service
            .history
            .append(&self.conversation_id, &message)
            .await
        {
            warn!(connection_id = %self.connection_id, error = %e, "History append failed");
        }

        // Echo to the sender first, then fan out to the conversation.
        self.send(Envelope::ChatMessage(message.clone()));
        self.service.registry.broadcast(
            &self.conversation_id,
            &Envelope::ChatMessage(message.clone()),
            Some(&self.connection_id),
        );
        self.persist(message.clone());

        if self.in_flight.is_some() {
            if self.pending_prompts.len() >= MAX_PENDING_PROMPTS {
                self.send(Envelope::error(
                    ErrorKind::RateLimitExceeded,
                    "too many queued prompts",
                ));
                return Flow::Continue;
            }
            self.pending_prompts.push_back(message);
            return Flow::Continue;
        }

        let rx = self.start_stream(&message).await;
        Flow::SetStream(Some(rx))
    }

    fn handle_cancel(&mut self, id: &str) -> Flow {
        if let Some(in_flight) = &mut self.in_flight {
            if in_flight.id == id {
                if let Some(cancel) = in_flight.cancel.take() {
                    debug!(connection_id = %self.connection_id, id = %id, "Cancelling stream");
                    let _ = cancel.send(());
                }
                return Flow::Continue;
            }
        }

        let before = self.pending_prompts.len();
        self.pending_prompts.retain(|prompt| prompt.id != id);
        if self.pending_prompts.len() == before {
            debug!(connection_id = %self.connection_id, id = %id, "Cancel for unknown id");
        }
        Flow::Continue
    }

    async fn handle_system(&mut self, mut system: SystemMessage) -> Flow {
        if !self.principal.is_admin {
            return self.validation_error("system envelopes require admin privilege");
        }

        // Unconditional, audited bypass of message counting.
        self.service
            .limiter
            .admit_message(&self.principal.user_id, true)
            .await;

        if system.id.is_empty() {
            system.id = Uuid::new_v4().to_string();
        }
        system.conversation_id = Some(self.conversation_id.clone());
        self.service.registry.broadcast(
            &self.conversation_id,
            &Envelope::System(system),
            Some(&self.connection_id),
        );
        Flow::Continue
    }

    async fn handle_chunk(&mut self, chunk: Option<Envelope>) -> Flow {
        match chunk {
            Some(Envelope::ChatChunk(chunk)) => {
                self.touch();
                let is_final = chunk.is_final;
                let cancelled = chunk.metadata.contains_key("cancelled");
                self.accumulated.push_str(&chunk.delta);
                self.send(Envelope::ChatChunk(chunk));

                if is_final {
                    self.complete_response(cancelled).await
                } else {
                    Flow::Continue
                }
            }
            // Upstream error envelopes pass straight through; the bridge
            // follows them with a final chunk.
            Some(other) => {
                self.send(other);
                Flow::Continue
            }
            None => self.complete_response(true).await,
        }
    }

    /// Wrap up the in-flight response and start the next queued prompt.
    async fn complete_response(&mut self, cancelled: bool) -> Flow {
        self.in_flight = None;
        let content = std::mem::take(&mut self.accumulated);

        if !cancelled && !content.is_empty() {
            let mut reply = ChatMessage::new(Role::Assistant, content, &self.conversation_id);
            reply.timestamp = Utc::now();

            if let Err(e) = self
                .service
                .history
                .append(&self.conversation_id, &reply)
                .await
            {
                warn!(connection_id = %self.connection_id, error = %e, "History append failed");
            }
            self.service.registry.broadcast(
                &self.conversation_id,
                &Envelope::ChatMessage(reply.clone()),
                Some(&self.connection_id),
            );
            self.persist(reply);
        }

        let _ = self
            .service
            .registry
            .transition(&self.connection_id, ConnectionState::Ready);

        match self.pending_prompts.pop_front() {
            Some(next) => {
                let rx = self.start_stream(&next).await;
                Flow::SetStream(Some(rx))
            }
            None => Flow::SetStream(None),
        }
    }

    async fn start_stream(&mut self, message: &ChatMessage) -> mpsc::Receiver<Envelope> {
        let _ = self
            .service
            .registry
            .transition(&self.connection_id, ConnectionState::Streaming);

        let context = self
            .service
            .history
            .range(&self.conversation_id, 0, -1)
            .await
            .unwrap_or_else(|_| vec![message.clone()]);

        let (cancel_tx, cancel_rx) = oneshot::channel();
        self.in_flight = Some(InFlight {
            id: message.id.clone(),
            cancel: Some(cancel_tx),
        });
        self.accumulated.clear();

        self.service
            .bridge
            .stream_response(message.id.clone(), context, cancel_rx)
    }

    async fn handle_tick(&mut self, message_timeout: Duration) -> Flow {
        match self.service.registry.state(&self.connection_id) {
            Some(ConnectionState::Unresponsive) => {
                if self.outgoing.capacity() > 0 {
                    // Queue drained in time; the connection recovered.
                    let _ = self
                        .service
                        .registry
                        .transition(&self.connection_id, ConnectionState::Ready);
                    return Flow::Continue;
                }

                let lapsed = self
                    .service
                    .registry
                    .unresponsive_since(&self.connection_id)
                    .map(|since| {
                        Utc::now().signed_duration_since(since).num_seconds()
                            >= message_timeout.as_secs() as i64
                    })
                    .unwrap_or(true);
                if lapsed {
                    warn!(connection_id = %self.connection_id, "Unresponsive grace period lapsed");
                    return Flow::Close(Some((1011, "unresponsive".to_string())));
                }
                Flow::Continue
            }
            Some(ConnectionState::Streaming)
                if self.last_activity.elapsed() > message_timeout =>
            {
                debug!(connection_id = %self.connection_id, "Streaming idle timeout");
                Flow::Close(Some((1000, "idle timeout".to_string())))
            }
            _ => {
                if self.last_activity.elapsed() >= message_timeout / 2 {
                    self.ping_nonce += 1;
                    self.send(Envelope::Ping {
                        nonce: self.ping_nonce,
                    });
                }
                Flow::Continue
            }
        }
    }

    /// Report a validation failure in-band; a burst escalates to CLOSING.
    fn validation_error(&mut self, message: &str) -> Flow {
        self.service.metrics.ws_malformed_frames.inc();

        if self.malformed_window_start.elapsed() > MALFORMED_BURST_WINDOW {
            self.malformed_window_start = Instant::now();
            self.malformed_count = 0;
        }
        self.malformed_count += 1;

        self.send(Envelope::error(ErrorKind::InvalidMessageFormat, message));

        if self.malformed_count > MALFORMED_BURST_LIMIT {
            warn!(connection_id = %self.connection_id, "Malformed input burst, closing");
            return Flow::Close(Some((1008, "persistent malformed input".to_string())));
        }
        Flow::Continue
    }

    /// Offer an envelope to this connection's own outgoing queue.
    fn send(&self, envelope: Envelope) {
        self.service.registry.send_to(&self.connection_id, envelope);
    }

    fn broadcast_presence(&self, state: PresenceState) {
        self.service.registry.broadcast(
            &self.conversation_id,
            &Envelope::Presence {
                user_id: self.principal.user_id.clone(),
                state,
            },
            Some(&self.connection_id),
        );
    }

    fn persist(&self, message: ChatMessage) {
        let repository = self.service.messages.clone();
        tokio::spawn(async move {
            if let Err(e) = repository.persist(&message).await {
                warn!(message_id = %message.id, error = %e, "Message persistence failed");
            }
        });
    }

    fn transition(&self, state: ConnectionState) {
        if let Err(e) = self.service.registry.transition(&self.connection_id, state) {
            warn!(connection_id = %self.connection_id, error = %e, "State transition refused");
        }
    }

    fn touch(&mut self) {
        self.last_activity = Instant::now();
    }
}

/// Await the next bridge chunk, or park forever when no stream is in
/// flight so the other select arms keep the loop alive.
async fn next_chunk(stream_rx: &mut Option<mpsc::Receiver<Envelope>>) -> Option<Envelope> {
    match stream_rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}
