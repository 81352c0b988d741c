//! OpenAI Chat Completions API provider
//!
//! Also serves OpenAI-compatible servers (Ollama, vLLM, OpenRouter) through
//! a custom `base_url`.

use async_trait::async_trait;
use reqwest::header::HeaderMap;
use reqwest_eventsource::EventSource;
use serde::{Deserialize, Serialize};

use super::{LlmProvider, header};
use crate::{
    error::{Error, Result},
    stream::{Decoded, ErrorDetail, FragmentExtractor, FragmentStream, sse_fragments},
    types::{Message, Model, StreamOptions},
};

/// OpenAI API client
pub struct OpenAIProvider {
    client: reqwest::Client,
    api_key: String,
}

impl OpenAIProvider {
    /// Create a new OpenAI provider with an API key
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
    ) -> OpenAIRequest {
        OpenAIRequest {
            model: model.id.clone(),
            messages: messages
                .iter()
                .map(|m| OpenAIMessage {
                    role: m.role.as_str(),
                    content: m.content.clone(),
                })
                .collect(),
            stream: true,
            max_tokens: options.max_tokens,
            temperature: options.temperature,
        }
    }
}

#[async_trait]
impl LlmProvider for OpenAIProvider {
    async fn stream(
        &self,
        model: &Model,
        messages: &[Message],
        options: &StreamOptions,
    ) -> Result<FragmentStream> {
        let request = self.build_request(model, messages, options);
        let url = format!("{}/chat/completions", model.base_url);
        tracing::debug!("OpenAI API URL: {}", url);

        let mut headers = HeaderMap::new();
        header(&mut headers, "authorization", format!("Bearer {}", self.api_key))?;
        header(&mut headers, "content-type", "application/json")?;

        let request_builder = self.client.post(&url).headers(headers).json(&request);
        let event_source = EventSource::new(request_builder)
            .map_err(|e| Error::Sse(format!("Failed to create event source: {}", e)))?;

        Ok(sse_fragments(event_source, OpenAIExtractor))
    }
}

/// `choices[0].delta.content`, terminated by a literal `[DONE]`.
#[derive(Debug, Default, Clone, Copy)]
pub struct OpenAIExtractor;

impl FragmentExtractor for OpenAIExtractor {
    fn extract_fragment(&self, _event: &str, data: &str) -> Result<Decoded> {
        let data = data.trim();
        if data == "[DONE]" {
            return Ok(Decoded::End);
        }
        if data.is_empty() {
            return Ok(Decoded::Skip);
        }

        let chunk: StreamChunk = serde_json::from_str(data)
            .map_err(|e| Error::UnexpectedResponse(format!("Failed to parse chunk: {}", e)))?;
        if let Some(error) = chunk.error {
            return Err(error.into_error());
        }

        let text = chunk
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.delta.content)
            .unwrap_or_default();
        if text.is_empty() {
            Ok(Decoded::Skip)
        } else {
            Ok(Decoded::Fragment(text))
        }
    }
}

// Request types

#[derive(Debug, Serialize)]
struct OpenAIRequest {
    model: String,
    messages: Vec<OpenAIMessage>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
}

#[derive(Debug, Serialize)]
struct OpenAIMessage {
    role: &'static str,
    content: String,
}

// Streaming response types

#[derive(Debug, Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
    #[serde(default)]
    error: Option<ErrorDetail>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    delta: StreamDelta,
}

#[derive(Debug, Deserialize)]
struct StreamDelta {
    #[serde(default)]
    content: Option<String>,
}
