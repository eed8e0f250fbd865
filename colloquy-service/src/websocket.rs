//! WebSocket session layer.
//!
//! Wire envelope types, the per-connection session state machine, and the
//! connection handler that binds them to the transport.

mod handlers;
pub mod messages;
mod session;

pub use handlers::handle_ws_connection;
pub use messages::{
    ChatChunk, ChatMessage, Envelope, LimitsSnapshot, MetaValue, Metadata, PresenceState, Role,
    SystemMessage,
};
