//! Transport abstraction for opening completion streams

use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use chatvim_ai::{
    Error, FragmentStream, Message, Model, Provider, Result, StreamOptions, models, providers,
};
use futures::{StreamExt, future, stream};
use tokio_util::sync::CancellationToken;

/// Retry configuration
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of retry attempts
    pub max_retries: u32,
    /// Initial delay between retries
    pub initial_delay: Duration,
    /// Maximum delay between retries
    pub max_delay: Duration,
    /// Multiplier for exponential backoff
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Calculate delay for a given attempt (0-indexed)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let delay_secs =
            self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(attempt as i32);
        Duration::from_secs_f64(delay_secs.min(self.max_delay.as_secs_f64()))
    }
}

/// One request for a streamed reply
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    /// Model identifier, resolved by the transport
    pub model: String,
    pub messages: Vec<Message>,
    pub options: StreamOptions,
}

/// Opens fragment streams for completion requests
#[async_trait]
pub trait Transport: Send + Sync {
    /// Start streaming the reply to `request`.
    ///
    /// Cancelling `cancel` while the stream is being opened returns
    /// [`Error::Aborted`]. Once a stream is returned the caller owns it and
    /// releases the connection by dropping it.
    async fn open(
        &self,
        request: &CompletionRequest,
        cancel: CancellationToken,
    ) -> Result<FragmentStream>;
}

/// Direct provider transport - calls LLM APIs directly
pub struct ProviderTransport {
    api_keys: HashMap<Provider, String>,
    retry_config: RetryConfig,
}

impl ProviderTransport {
    /// Create a transport that reads API keys from the environment
    pub fn new() -> Self {
        Self {
            api_keys: HashMap::new(),
            retry_config: RetryConfig::default(),
        }
    }

    /// Use `key` for `provider` instead of its environment variable
    pub fn with_api_key(mut self, provider: Provider, key: impl Into<String>) -> Self {
        self.api_keys.insert(provider, key.into());
        self
    }

    /// Set retry configuration
    pub fn with_retry_config(mut self, config: RetryConfig) -> Self {
        self.retry_config = config;
        self
    }
}

impl Default for ProviderTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for ProviderTransport {
    async fn open(
        &self,
        request: &CompletionRequest,
        cancel: CancellationToken,
    ) -> Result<FragmentStream> {
        let model = models::resolve_model(&request.model)?;
        let api_key = self.api_keys.get(&model.provider).map(String::as_str);

        open_with_retry(&self.retry_config, &cancel, || {
            open_once(&model, api_key, request)
        })
        .await
    }
}

/// Connect and wait for the first fragment.
///
/// Errors surfacing before any output are still worth retrying, so the
/// first item is pulled here and chained back in front of the stream.
async fn open_once(
    model: &Model,
    api_key: Option<&str>,
    request: &CompletionRequest,
) -> Result<FragmentStream> {
    let provider = providers::connect(model, api_key)?;
    let mut fragments = provider
        .stream(model, &request.messages, &request.options)
        .await?;

    match fragments.next().await {
        Some(Ok(first)) => Ok(Box::pin(stream::once(future::ready(Ok(first))).chain(fragments))),
        Some(Err(e)) => Err(e),
        None => Ok(Box::pin(stream::empty())),
    }
}

/// Run `attempt` until it succeeds, fails with a non-retryable error, or
/// the retry budget runs out. Backoff waits end early on cancellation.
async fn open_with_retry<F, Fut>(
    config: &RetryConfig,
    cancel: &CancellationToken,
    mut attempt: F,
) -> Result<FragmentStream>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<FragmentStream>>,
{
    let mut retries = 0u32;
    loop {
        let result = tokio::select! {
            _ = cancel.cancelled() => return Err(Error::Aborted),
            result = attempt() => result,
        };

        match result {
            Ok(fragments) => return Ok(fragments),
            Err(e) if retries < config.max_retries && e.is_retryable() => {
                let delay = match &e {
                    Error::RateLimited {
                        retry_after: Some(secs),
                    } => Duration::from_secs(*secs).min(config.max_delay),
                    _ => config.delay_for_attempt(retries),
                };
                tracing::warn!(
                    "Request failed (attempt {}/{}): {}. Retrying in {:?}...",
                    retries + 1,
                    config.max_retries + 1,
                    e,
                    delay
                );
                retries += 1;
                tokio::select! {
                    _ = cancel.cancelled() => return Err(Error::Aborted),
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            Err(e) => return Err(e),
        }
    }
}
