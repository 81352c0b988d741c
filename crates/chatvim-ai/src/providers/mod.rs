//! Completion provider implementations

pub mod anthropic;
pub mod google;
pub mod openai;

use std::sync::Arc;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};

use crate::{Api, Error, FragmentStream, Message, Model, Result, StreamOptions};

/// Trait for completion providers
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Start a streaming completion for the given conversation
    async fn stream(
        &self,
        model: &Model,
        messages: &[Message],
        options: &StreamOptions,
    ) -> Result<FragmentStream>;
}

/// Get an API key from a provided value or the environment
pub fn get_api_key(provided: Option<&str>, env_var: &str) -> Result<String> {
    if let Some(key) = provided {
        return Ok(key.to_string());
    }

    std::env::var(env_var).map_err(|_| Error::InvalidApiKey)
}

/// Build the provider that serves `model`.
///
/// `api_key` takes precedence over the provider's environment variable.
pub fn connect(model: &Model, api_key: Option<&str>) -> Result<Arc<dyn LlmProvider>> {
    let key = match model.provider.api_key_env_var() {
        Some(env_var) => get_api_key(api_key, env_var)?,
        None => api_key.map(str::to_string).ok_or(Error::InvalidApiKey)?,
    };
    let provider: Arc<dyn LlmProvider> = match model.api {
        Api::OpenAICompletions => Arc::new(openai::OpenAIProvider::new(key)),
        Api::AnthropicMessages => Arc::new(anthropic::AnthropicProvider::new(key)),
        Api::GoogleGenerativeAI => Arc::new(google::GoogleProvider::new(key)),
    };
    Ok(provider)
}

/// Header values come from API keys and config; reject anything that is not
/// a legal header instead of panicking.
pub(crate) fn header(
    headers: &mut HeaderMap,
    name: &'static str,
    value: impl AsRef<str>,
) -> Result<()> {
    let value = HeaderValue::from_str(value.as_ref())
        .map_err(|e| Error::InvalidConfig(format!("invalid value for header {}: {}", name, e)))?;
    headers.insert(HeaderName::from_static(name), value);
    Ok(())
}
