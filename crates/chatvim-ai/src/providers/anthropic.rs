//! Anthropic Messages API provider

use async_trait::async_trait;
use reqwest::header::HeaderMap;
use reqwest_eventsource::EventSource;
use serde::{Deserialize, Serialize};

use super::{LlmProvider, header};
use crate::{
    error::{Error, Result},
    stream::{Decoded, ErrorDetail, FragmentExtractor, FragmentStream, sse_fragments},
    types::{Message, Model, Role, StreamOptions, split_system},
};

const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Anthropic API client
pub struct AnthropicProvider {
    client: reqwest::Client,
    api_key: String,
}

impl AnthropicProvider {
    /// Create a new Anthropic provider with an API key
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key: api_key.into(),
        }
    }


    fn build_request(
        &self,
        model: &Model,
        messages: &[Message],
        options: &StreamOptions,
    ) -> AnthropicRequest {
        let (system, rest) = split_system(messages);
        AnthropicRequest {
            model: model.id.clone(),
            messages: merge_consecutive(&rest),
            max_tokens: options.max_tokens.unwrap_or(model.max_tokens),
            stream: true,
            system,
            temperature: options.temperature,
        }
    }
}

#[async_trait]
impl LlmProvider for AnthropicProvider {
    async fn stream(
        &self,
        model: &Model,
        messages: &[Message],
        options: &StreamOptions,
    ) -> Result<FragmentStream> {
        let request = self.build_request(model, messages, options);
        let url = format!("{}/v1/messages", model.base_url);
        tracing::debug!("Anthropic API URL: {}", url);

        let mut headers = HeaderMap::new();
        header(&mut headers, "x-api-key", &self.api_key)?;
        header(&mut headers, "anthropic-version", ANTHROPIC_VERSION)?;
        header(&mut headers, "accept", "text/event-stream")?;
        header(&mut headers, "content-type", "application/json")?;

        let request_builder = self.client.post(&url).headers(headers).json(&request);
        let event_source = EventSource::new(request_builder)
            .map_err(|e| Error::Sse(format!("Failed to create event source: {}", e)))?;

        Ok(sse_fragments(event_source, AnthropicExtractor))
    }
}

/// The Messages API rejects two adjacent turns with the same role; a chat
/// transcript can easily contain them (two `>` lines in a row).
fn merge_consecutive(messages: &[&Message]) -> Vec<AnthropicMessage> {
    let mut merged: Vec<AnthropicMessage> = Vec::new();
    for msg in messages {
        let role = match msg.role {
            Role::Assistant => "assistant",
            _ => "user",
        };
        match merged.last_mut() {
            Some(last) if last.role == role => {
                last.content.push_str("\n\n");
                last.content.push_str(&msg.content);
            }
            _ => merged.push(AnthropicMessage {
                role,
                content: msg.content.clone(),
            }),
        }
    }
    merged
}

/// `content_block_delta` events carrying `text_delta`s; `message_stop` ends.
#[derive(Debug, Default, Clone, Copy)]
pub struct AnthropicExtractor;

impl FragmentExtractor for AnthropicExtractor {
    fn extract_fragment(&self, event: &str, data: &str) -> Result<Decoded> {
        match event {
            "content_block_delta" => {
                let data: ContentBlockDeltaEvent = serde_json::from_str(data)?;
                match (data.delta.delta_type.as_str(), data.delta.text) {
                    ("text_delta", Some(text)) if !text.is_empty() => {
                        Ok(Decoded::Fragment(text))
                    }
                    _ => Ok(Decoded::Skip),
                }
            }
            "message_stop" => Ok(Decoded::End),
            "error" => {
                let data: ErrorEvent = serde_json::from_str(data)?;
                Err(data.error.into_error())
            }
            _ => Ok(Decoded::Skip),
        }
    }
}

// Request types

#[derive(Debug, Serialize)]
struct AnthropicRequest {
    model: String,
    messages: Vec<AnthropicMessage>,
    max_tokens: u32,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
}

#[derive(Debug, Serialize)]
struct AnthropicMessage {
    role: &'static str,
    content: String,
}

// Streaming response types

#[derive(Debug, Deserialize)]
struct ContentBlockDeltaEvent {
    delta: Delta,
}

#[derive(Debug, Deserialize)]
struct Delta {
    #[serde(rename = "type")]
    delta_type: String,
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ErrorEvent {
    error: ErrorDetail,
}
