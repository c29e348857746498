use crate::models::{Message, ModelConfig, Sender};
use anyhow::{Context, Result};
use async_trait::async_trait;
use eventsource_stream::Eventsource;
use futures::{Stream, StreamExt};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::pin::Pin;

// Stream of text fragments; ends when the upstream reply is complete
pub type DeltaStream = Pin<Box<dyn Stream<Item = Result<String>> + Send>>;

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl From<Sender> for Role {
    fn from(sender: Sender) -> Self {
        match sender {
            Sender::User => Role::User,
            Sender::Assistant => Role::Assistant,
        }
    }
}

/// One entry of the history sent upstream.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct CompletionMessage {
    pub role: Role,
    pub content: String,
}

impl From<&Message> for CompletionMessage {
    fn from(msg: &Message) -> Self {
        Self {
            role: msg.sender.into(),
            content: msg.text.clone(),
        }
    }
}

// Interface for completion providers. One attempt per call, no retry.
#[async_trait]
pub trait LLMApiProvider: Send + Sync {
    // Returns a stream of content deltas.
    async fn send_chat_stream_request(
        &self,
        config: &ModelConfig,
        api_key: &str,
        messages: &[CompletionMessage],
    ) -> Result<DeltaStream>;
}

// --- OpenAI Compatible Provider Implementation ---

#[derive(Serialize, Debug)]
struct OpenAIRequestBody<'a> {
    model: &'a str,
    messages: &'a [CompletionMessage],
    stream: bool,
}

// Response structure for STREAMING chunks
#[derive(Deserialize, Debug)]
struct OpenAIStreamChunk {
    choices: Vec<OpenAIStreamChoice>,
}

#[derive(Deserialize, Debug)]
struct OpenAIStreamChoice {
    delta: OpenAIStreamDelta,
}

#[derive(Deserialize, Debug)]
struct OpenAIStreamDelta {
    // Absent on role-only and final chunks
    content: Option<String>,
}

/// Interprets the data of one SSE event. `Ok(None)` means the event carries no
/// text (end marker, ping, role-only delta).
pub fn parse_stream_event(data: &str) -> Result<Option<String>> {
    let data = data.trim();
    if data == "[DONE]" {
        log::info!("Stream finished with [DONE]");
        return Ok(None);
    }

    match serde_json::from_str::<OpenAIStreamChunk>(data) {
        Ok(chunk) => Ok(chunk
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.delta.content)),
        Err(e) => match serde_json::from_str::<serde_json::Value>(data) {
            Ok(json_value) if json_value.get("type").and_then(|t| t.as_str()) == Some("ping") => {
                log::debug!("Received stream ping event, skipping.");
                Ok(None)
            }
            Ok(_) => {
                log::warn!("Stream event is JSON but not a completion chunk: {} - Data: {}", e, data);
                Err(anyhow::Error::from(e)
                    .context(format!("Parsed as JSON but not a valid completion chunk: {}", data)))
            }
            Err(_) => {
                log::warn!("Failed to parse stream event as JSON: {} - Data: {}", e, data);
                Err(anyhow::Error::from(e)
                    .context(format!("Failed to parse stream chunk as JSON: {}", data)))
            }
        },
    }
}

pub struct OpenAICompatibleProvider {
    client: Client,
}

impl OpenAICompatibleProvider {
    pub fn new() -> Self {
        Self { client: Client::new() }
    }
}

impl Default for OpenAICompatibleProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LLMApiProvider for OpenAICompatibleProvider {
    async fn send_chat_stream_request(
        &self,
        config: &ModelConfig,
        api_key: &str,
        messages: &[CompletionMessage],
    ) -> Result<DeltaStream> {
        log::info!(
            "Sending STREAM request to {} using model: {} ({} messages)",
            config.api_url,
            config.model,
            messages.len()
        );

        let request_body = OpenAIRequestBody {
            model: &config.model,
            messages,
            stream: true,
        };

        let request_url = format!("{}/chat/completions", config.api_url.trim_end_matches('/'));

        let response = self
            .client
            .post(&request_url)
            .bearer_auth(api_key)
            .json(&request_body)
            .send()
            .await
            .context("Failed to send stream request to completion API")?;

        if !response.status().is_success() {
            let status = response.status();
            let error_body = response
                .text()
                .await
                .unwrap_or_else(|_| "<Failed to read error body>".to_string());
            log::error!("Completion stream request failed with status {}: {}", status, error_body);
            return Err(anyhow::anyhow!(
                "API stream request failed with status {}: {}",
                status,
                error_body
            ));
        }

        let delta_stream = response
            .bytes_stream()
            .eventsource()
            .map(|event_result| -> Result<Option<String>> {
                let event = event_result.context("Error reading stream event")?;
                parse_stream_event(&event.data)
            })
            .filter_map(|result| async move {
                match result {
                    Ok(Some(content)) => Some(Ok(content)),
                    Ok(None) => None,
                    Err(e) => {
                        log::error!("Error processing stream chunk: {:?}", e);
                        Some(Err(e))
                    }
                }
            });

        Ok(Box::pin(delta_stream))
    }
}
