//! LLM streaming bridge.
//!
//! Turns an inbound user message plus recent conversation history into a
//! streaming upstream call and forwards the deltas back as `chat_chunk`
//! envelopes. The provider sits behind a trait so the bridge can be driven
//! by a scripted source in tests.

mod bridge;
mod cache;
mod provider;

pub use bridge::StreamBridge;
pub use cache::ResponseCache;
pub use provider::HttpProvider;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::mpsc;

use crate::error::ProviderError;
use crate::websocket::{ChatMessage, Role};

/// A message in the provider's required shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProviderMessage {
    pub role: String,
    pub content: String,
}

impl ProviderMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: content.into(),
        }
    }
}

/// One event of an upstream response stream.
#[derive(Debug, Clone)]
pub enum ProviderEvent {
    Delta(String),
    Done,
    Error(ProviderError),
}

/// Upstream LLM provider collaborator.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Open a streaming completion; deltas arrive on the returned channel,
    /// terminated by exactly one `Done` or `Error`.
    async fn stream(
        &self,
        messages: Vec<ProviderMessage>,
        system: Option<String>,
    ) -> Result<mpsc::Receiver<ProviderEvent>, ProviderError>;
}

/// Transform conversation history into the provider shape.
///
/// The first `system` message becomes the out-of-band system prompt; the
/// rest map onto the user/assistant alternation the provider expects.
pub fn format_messages(history: &[ChatMessage]) -> (Vec<ProviderMessage>, Option<String>) {
    let mut system = None;
    let mut messages = Vec::with_capacity(history.len());

    for message in history {
        match message.role {
            Role::System if system.is_none() => {
                system = Some(message.content.clone());
            }
            Role::Assistant => messages.push(ProviderMessage::assistant(&message.content)),
            _ => messages.push(ProviderMessage::user(&message.content)),
        }
    }

    (messages, system)
}
