//! Wire envelope types.
//!
//! One envelope per JSON text frame, discriminated by `type`. Encoding then
//! decoding any envelope yields an equal envelope; tests rely on that.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::config::RateLimitConfig;
use crate::error::ErrorKind;

/// Primitive-valued metadata attached to chat traffic.
pub type Metadata = BTreeMap<String, MetaValue>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetaValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

/// Message author role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
    System,
}

/// Presence state carried in presence envelopes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PresenceState {
    Online,
    Typing,
    Offline,
}

/// A chat message, both as a wire envelope body and as the unit stored in
/// the conversation history ring.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: String,
    pub role: Role,
    pub content: String,
    pub conversation_id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Metadata::is_empty")]
    pub metadata: Metadata,
}

impl ChatMessage {
    pub fn new(role: Role, content: impl Into<String>, conversation_id: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            role,
            content: content.into(),
            conversation_id: conversation_id.into(),
            timestamp: Utc::now(),
            metadata: Metadata::new(),
        }
    }
}

/// One delta of a streaming response. All chunks of a response share the id
/// of the message that prompted it; sequences start at 0 and exactly one
/// chunk per id carries `final: true`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatChunk {
    pub id: String,
    pub sequence: u64,
    pub delta: String,
    #[serde(rename = "final")]
    pub is_final: bool,
    #[serde(default, skip_serializing_if = "Metadata::is_empty")]
    pub metadata: Metadata,
}

impl ChatChunk {
    pub fn delta(id: impl Into<String>, sequence: u64, delta: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            sequence,
            delta: delta.into(),
            is_final: false,
            metadata: Metadata::new(),
        }
    }

    pub fn terminal(id: impl Into<String>, sequence: u64) -> Self {
        Self {
            id: id.into(),
            sequence,
            delta: String::new(),
            is_final: true,
            metadata: Metadata::new(),
        }
    }

    pub fn cancelled(id: impl Into<String>, sequence: u64) -> Self {
        let mut chunk = Self::terminal(id, sequence);
        chunk
            .metadata
            .insert("cancelled".to_string(), MetaValue::Bool(true));
        chunk
    }
}

/// Server-originated control message; bypasses rate counting when sent by
/// an admin principal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemMessage {
    pub id: String,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Metadata::is_empty")]
    pub metadata: Metadata,
}

/// Rate limits reported to the client in the welcome envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LimitsSnapshot {
    pub messages_per_second: u32,
    pub messages_per_minute: u32,
    pub messages_per_hour: u32,
    pub messages_per_day: u32,
    pub max_connections_per_ip: u32,
    pub max_connections_per_user: u32,
}

impl From<&RateLimitConfig> for LimitsSnapshot {
    fn from(config: &RateLimitConfig) -> Self {
        Self {
            messages_per_second: config.messages_per_second,
            messages_per_minute: config.messages_per_minute,
            messages_per_hour: config.messages_per_hour,
            messages_per_day: config.messages_per_day,
            max_connections_per_ip: config.max_connections_per_ip,
            max_connections_per_user: config.max_connections_per_user,
        }
    }
}

/// The unit exchanged over the transport, one per text frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Envelope {
    ChatMessage(ChatMessage),
    ChatChunk(ChatChunk),
    Welcome {
        server_time: DateTime<Utc>,
        connection_id: String,
        limits: LimitsSnapshot,
    },
    History {
        messages: Vec<ChatMessage>,
    },
    Presence {
        user_id: String,
        state: PresenceState,
    },
    Ping {
        nonce: u64,
    },
    Pong {
        nonce: u64,
    },
    Error {
        code: u16,
        kind: ErrorKind,
        message: String,
        #[serde(default, skip_serializing_if = "Metadata::is_empty")]
        details: Metadata,
    },
    System(SystemMessage),
    Cancel {
        id: String,
    },
}

impl Envelope {
    /// Build an in-band error envelope for a wire-visible failure kind.
    pub fn error(kind: ErrorKind, message: impl Into<String>) -> Self {
        Envelope::Error {
            code: kind.envelope_code().unwrap_or(5000),
            kind,
            message: message.into(),
            details: Metadata::new(),
        }
    }

    /// Wire discriminator for this envelope, for logging.
    pub fn type_name(&self) -> &'static str {
        match self {
            Envelope::ChatMessage(_) => "chat_message",
            Envelope::ChatChunk(_) => "chat_chunk",
            Envelope::Welcome { .. } => "welcome",
            Envelope::History { .. } => "history",
            Envelope::Presence { .. } => "presence",
            Envelope::Ping { .. } => "ping",
            Envelope::Pong { .. } => "pong",
            Envelope::Error { .. } => "error",
            Envelope::System(_) => "system",
            Envelope::Cancel { .. } => "cancel",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(envelope: &Envelope) -> Envelope {
        let json = serde_json::to_string(envelope).unwrap();
        serde_json::from_str(&json).unwrap()
    }

    #[test]
    fn test_chat_message_roundtrip() {
        let mut message = ChatMessage::new(Role::User, "hi", "k-1");
        message
            .metadata
            .insert("client".to_string(), MetaValue::Str("web".to_string()));
        let envelope = Envelope::ChatMessage(message);
        assert_eq!(roundtrip(&envelope), envelope);
    }

    #[test]
    fn test_chat_message_wire_shape() {
        let envelope = Envelope::ChatMessage(ChatMessage {
            id: "m-1".to_string(),
            role: Role::User,
            content: "hi".to_string(),
            conversation_id: "k-1".to_string(),
            timestamp: Utc::now(),
            metadata: Metadata::new(),
        });
        let json = serde_json::to_string(&envelope).unwrap();
        assert!(json.contains(r#""type":"chat_message""#));
        assert!(json.contains(r#""id":"m-1""#));
        assert!(json.contains(r#""role":"user""#));
        assert!(json.contains(r#""conversation_id":"k-1""#));
        // Empty metadata is omitted entirely.
        assert!(!json.contains("metadata"));
    }

    #[test]
    fn test_chunk_final_field_name() {
        let envelope = Envelope::ChatChunk(ChatChunk::terminal("m-1", 4));
        let json = serde_json::to_string(&envelope).unwrap();
        assert!(json.contains(r#""final":true"#));
        assert!(json.contains(r#""sequence":4"#));
        assert_eq!(roundtrip(&envelope), envelope);
    }

    #[test]
    fn test_cancelled_chunk_marker() {
        let chunk = ChatChunk::cancelled("m-7", 3);
        assert!(chunk.is_final);
        assert_eq!(chunk.metadata.get("cancelled"), Some(&MetaValue::Bool(true)));

        let json = serde_json::to_string(&Envelope::ChatChunk(chunk)).unwrap();
        assert!(json.contains(r#""cancelled":true"#));
    }

    #[test]
    fn test_error_envelope_codes() {
        let envelope = Envelope::error(ErrorKind::RateLimitExceeded, "slow down");
        let json = serde_json::to_string(&envelope).unwrap();
        assert!(json.contains(r#""type":"error""#));
        assert!(json.contains(r#""code":4002"#));
        assert!(json.contains(r#""kind":"rate_limit_exceeded""#));
        assert_eq!(roundtrip(&envelope), envelope);
    }

    #[test]
    fn test_ping_pong_roundtrip() {
        let ping = Envelope::Ping { nonce: 42 };
        assert_eq!(roundtrip(&ping), ping);

        let parsed: Envelope = serde_json::from_str(r#"{"type":"pong","nonce":42}"#).unwrap();
        assert_eq!(parsed, Envelope::Pong { nonce: 42 });
    }

    #[test]
    fn test_history_roundtrip_preserves_order() {
        let envelope = Envelope::History {
            messages: vec![
                ChatMessage::new(Role::User, "first", "k-1"),
                ChatMessage::new(Role::Assistant, "second", "k-1"),
            ],
        };
        let decoded = roundtrip(&envelope);
        assert_eq!(decoded, envelope);
        if let Envelope::History { messages } = decoded {
            assert_eq!(messages[0].content, "first");
            assert_eq!(messages[1].content, "second");
        } else {
            panic!("expected history envelope");
        }
    }

    #[test]
    fn test_presence_wire_shape() {
        let envelope = Envelope::Presence {
            user_id: "u1".to_string(),
            state: PresenceState::Typing,
        };
        let json = serde_json::to_string(&envelope).unwrap();
        assert!(json.contains(r#""state":"typing""#));
        assert_eq!(roundtrip(&envelope), envelope);
    }

    #[test]
    fn test_unknown_type_fails_to_parse() {
        let result: Result<Envelope, _> =
            serde_json::from_str(r#"{"type":"mystery","payload":1}"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_cancel_parse() {
        let parsed: Envelope = serde_json::from_str(r#"{"type":"cancel","id":"m-7"}"#).unwrap();
        assert_eq!(
            parsed,
            Envelope::Cancel {
                id: "m-7".to_string()
            }
        );
    }

    #[test]
    fn test_metadata_value_kinds_roundtrip() {
        let mut metadata = Metadata::new();
        metadata.insert("flag".to_string(), MetaValue::Bool(true));
        metadata.insert("count".to_string(), MetaValue::Int(7));
        metadata.insert("ratio".to_string(), MetaValue::Float(0.5));
        metadata.insert("tag".to_string(), MetaValue::Str("x".to_string()));

        let mut message = ChatMessage::new(Role::System, "s", "k-1");
        message.metadata = metadata;
        let envelope = Envelope::ChatMessage(message);
        assert_eq!(roundtrip(&envelope), envelope);
    }
}
