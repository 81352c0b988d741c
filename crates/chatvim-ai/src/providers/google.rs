//! Google Generative AI (Gemini) API provider

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

/// Google Generative AI client
pub struct GoogleProvider {
    client: reqwest::Client,
    api_key: String,
}

impl GoogleProvider {
    /// Create a new Google provider with an API key
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key: api_key.into(),
        }
    }


    fn build_request(&self, messages: &[Message], options: &StreamOptions) -> GeminiRequest {
        let (system, rest) = split_system(messages);
        GeminiRequest {
            contents: rest
                .into_iter()
                .map(|m| GeminiContent {
                    role: Some(match m.role {
                        Role::Assistant => "model",
                        _ => "user",
                    }),
                    parts: vec![GeminiPart {
                        text: m.content.clone(),
                    }],
                })
                .collect(),
            system_instruction: system.map(|text| GeminiContent {
                role: None,
                parts: vec![GeminiPart { text }],
            }),
            generation_config: Some(GeminiGenerationConfig {
                max_output_tokens: options.max_tokens,
                temperature: options.temperature,
            }),
        }
    }
}

#[async_trait]
impl LlmProvider for GoogleProvider {
    async fn stream(
        &self,
        model: &Model,
        messages: &[Message],
        options: &StreamOptions,
    ) -> Result<FragmentStream> {
        let request = self.build_request(messages, options);
        let url = format!(
            "{}/models/{}:streamGenerateContent?alt=sse",
            model.base_url, model.id
        );
        tracing::debug!("Google API URL: {}", url);

        let mut headers = HeaderMap::new();
        header(&mut headers, "x-goog-api-key", &self.api_key)?;
        header(&mut headers, "content-type", "application/json")?;

        let request_builder = self.client.post(&url).headers(headers).json(&request);
        let event_source = EventSource::new(request_builder)
            .map_err(|e| Error::Sse(format!("Failed to create event source: {}", e)))?;

        Ok(sse_fragments(event_source, GoogleExtractor))
    }
}

/// Concatenated `candidates[0].content.parts[].text`. Gemini has no end
/// marker; the response ends when the connection does.
#[derive(Debug, Default, Clone, Copy)]
pub struct GoogleExtractor;

impl FragmentExtractor for GoogleExtractor {
    fn extract_fragment(&self, _event: &str, data: &str) -> Result<Decoded> {
        let data = data.trim();
        if data.is_empty() {
            return Ok(Decoded::Skip);
        }

        let response: GeminiStreamResponse = serde_json::from_str(data)?;
        if let Some(error) = response.error {
            return Err(error.into_error());
        }

        let text: String = response
            .candidates
            .into_iter()
            .next()
            .and_then(|c| c.content)
            .map(|content| {
                content
                    .parts
                    .into_iter()
                    .filter_map(|p| p.text)
                    .collect()
            })
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
#[serde(rename_all = "camelCase")]
struct GeminiRequest {
    contents: Vec<GeminiContent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<GeminiContent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    generation_config: Option<GeminiGenerationConfig>,
}

#[derive(Debug, Serialize)]
struct GeminiContent {
    #[serde(skip_serializing_if = "Option::is_none")]
    role: Option<&'static str>,
    parts: Vec<GeminiPart>,
}

#[derive(Debug, Serialize)]
struct GeminiPart {
    text: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiGenerationConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    max_output_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
}

// Streaming response types

#[derive(Debug, Deserialize)]
struct GeminiStreamResponse {
    #[serde(default)]
    candidates: Vec<GeminiCandidate>,
    #[serde(default)]
    error: Option<ErrorDetail>,
}

#[derive(Debug, Deserialize)]
struct GeminiCandidate {
    #[serde(default)]
    content: Option<GeminiResponseContent>,
}

#[derive(Debug, Deserialize)]
struct GeminiResponseContent {
    #[serde(default)]
    parts: Vec<GeminiResponsePart>,
}

#[derive(Debug, Deserialize)]
struct GeminiResponsePart {
    #[serde(default)]
    text: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_joins_parts() {
        let data = r#"{"candidates":[{"content":{"role":"model","parts":[{"text":"Hel"},{"text":"lo"}]}}]}"#;
        assert_eq!(
            GoogleExtractor.extract_fragment("message", data).unwrap(),
            Decoded::Fragment("Hello".into())
        );
    }

    #[test]
    fn test_extract_usage_only_chunk_is_skipped() {
        let data = r#"{"candidates":[{"finishReason":"STOP"}],"usageMetadata":{"promptTokenCount":3}}"#;
        assert_eq!(
            GoogleExtractor.extract_fragment("message", data).unwrap(),
            Decoded::Skip
        );
    }

    #[test]
    fn test_extract_error_payload() {
        let data = r#"{"error":{"code":503,"message":"The model is overloaded.","status":"UNAVAILABLE"}}"#;
        let err = GoogleExtractor.extract_fragment("message", data).unwrap_err();
        assert!(err.is_retryable());
    }

    #[test]
    fn test_build_request_maps_roles() {
        let provider = GoogleProvider::new("key");
        let messages = vec![
            Message::system("be brief"),
            Message::user("hi"),
            Message::assistant("hello"),
        ];
        let options = StreamOptions {
            max_tokens: Some(100),
            temperature: None,
        };
        let json = serde_json::to_value(provider.build_request(&messages, &options)).unwrap();
        assert_eq!(json["systemInstruction"]["parts"][0]["text"], "be brief");
        assert_eq!(json["contents"][0]["role"], "user");
        assert_eq!(json["contents"][1]["role"], "model");
        assert_eq!(json["generationConfig"]["maxOutputTokens"], 100);
    }
}
