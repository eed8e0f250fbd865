//! HTTP provider client.
//!
//! Speaks a Messages-style streaming API: one POST with `stream: true`, the
//! response arriving as server-sent events. A spawned task parses the byte
//! stream into [`ProviderEvent`]s so the caller just drains a channel.

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, error};

use super::{Provider, ProviderEvent, ProviderMessage};
use crate::config::LlmConfig;
use crate::error::{ProviderError, ServiceError, ServiceResult};

pub struct HttpProvider {
    client: Client,
    config: LlmConfig,
}

impl HttpProvider {
    pub fn new(config: LlmConfig) -> ServiceResult<Self> {
        let client = Client::builder()
            .timeout(config.request_timeout())
            .build()
            .map_err(|e| ServiceError::Config {
                message: format!("failed to build provider client: {}", e),
            })?;

        Ok(Self { client, config })
    }

    fn messages_url(&self) -> String {
        format!("{}/v1/messages", self.config.endpoint)
    }
}

#[derive(Serialize)]
struct MessagesRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    temperature: f32,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    messages: &'a [ProviderMessage],
}

#[async_trait]
impl Provider for HttpProvider {
    async fn stream(
        &self,
        messages: Vec<ProviderMessage>,
        system: Option<String>,
    ) -> Result<mpsc::Receiver<ProviderEvent>, ProviderError> {
        let request = MessagesRequest {
            model: &self.config.model,
            max_tokens: self.config.max_tokens,
            temperature: self.config.temperature,
            stream: true,
            system,
            messages: &messages,
        };

        debug!(
            model = %self.config.model,
            message_count = messages.len(),
            "Opening provider stream"
        );

        let response = self
            .client
            .post(self.messages_url())
            .header("x-api-key", &self.config.api_key)
            .header("anthropic-version", &self.config.api_version)
            .json(&request)
            .send()
            .await
            .map_err(|e| ProviderError::Unavailable {
                message: e.to_string(),
            })?;

        let status = response.status();
        if status.as_u16() == 429 {
            let retry_after_secs = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse().ok());
            return Err(ProviderError::Throttled { retry_after_secs });
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::Unavailable {
                message: format!("HTTP {}: {}", status, body),
            });
        }

        let (tx, rx) = mpsc::channel(100);
        let mut byte_stream = response.bytes_stream();

        tokio::spawn(async move {
            let mut buffer = String::new();
            let mut current_event: Option<String> = None;

            while let Some(chunk_result) = byte_stream.next().await {
                match chunk_result {
                    Ok(chunk) => {
                        buffer.push_str(&String::from_utf8_lossy(&chunk));

                        while let Some(pos) = buffer.find('\n') {
                            let line = buffer[..pos].trim().to_string();
                            buffer = buffer[pos + 1..].to_string();

                            if line.is_empty() {
                                current_event = None;
                                continue;
                            }

                            let Some((field, value)) = sse_field(&line) else {
                                continue;
                            };

                            match field {
                                "event" => current_event = Some(value.to_string()),
                                "data" => match current_event.as_deref() {
                                    Some("content_block_delta") => {
                                        if let Some(text) = parse_delta(value) {
                                            if !text.is_empty()
                                                && tx.send(ProviderEvent::Delta(text)).await.is_err()
                                            {
                                                return;
                                            }
                                        }
                                    }
                                    Some("message_stop") => {
                                        let _ = tx.send(ProviderEvent::Done).await;
                                        return;
                                    }
                                    Some("error") => {
                                        let message = parse_error(value)
                                            .unwrap_or_else(|| "stream error".to_string());
                                        error!(error = %message, "Provider stream error event");
                                        let _ = tx
                                            .send(ProviderEvent::Error(ProviderError::Unavailable {
                                                message,
                                            }))
                                            .await;
                                        return;
                                    }
                                    _ => {}
                                },
                                _ => {}
                            }
                        }
                    }
                    Err(e) => {
                        let _ = tx
                            .send(ProviderEvent::Error(ProviderError::Unavailable {
                                message: e.to_string(),
                            }))
                            .await;
                        return;
                    }
                }
            }

            // Upstream closed without a stop event; treat what we have as
            // complete rather than erroring a finished response.
            let _ = tx.send(ProviderEvent::Done).await;
        });

        Ok(rx)
    }
}

/// Split one SSE line into its field name and value.
fn sse_field(line: &str) -> Option<(&str, &str)> {
    let (field, value) = line.split_once(':')?;
    Some((field.trim(), value.trim()))
}

#[derive(Deserialize)]
struct DeltaEvent {
    delta: DeltaBody,
}

#[derive(Deserialize)]
struct DeltaBody {
    #[serde(default)]
    text: Option<String>,
}

fn parse_delta(data: &str) -> Option<String> {
    serde_json::from_str::<DeltaEvent>(data).ok()?.delta.text
}

#[derive(Deserialize)]
struct ErrorEvent {
    error: ErrorBody,
}

#[derive(Deserialize)]
struct ErrorBody {
    message: String,
}

fn parse_error(data: &str) -> Option<String> {
    Some(serde_json::from_str::<ErrorEvent>(data).ok()?.error.message)
}
