//! Fragment streams and SSE decoding shared by all providers

use std::pin::Pin;

use async_stream::stream;
use futures::StreamExt;
use reqwest::StatusCode;
use reqwest_eventsource::{Event, EventSource, retry::Never};
use serde::Deserialize;
use tokio_stream::Stream;

use crate::error::{Error, Result};

/// A lazy, finite stream of assistant text fragments.
///
/// Dropping the stream drops the underlying event source, which closes the
/// HTTP connection.
pub type FragmentStream = Pin<Box<dyn Stream<Item = Result<String>> + Send>>;

/// What a single raw SSE message contributed to the response
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decoded {
    /// A piece of assistant text
    Fragment(String),
    /// Bookkeeping message with no text (role headers, usage, pings)
    Skip,
    /// The provider signalled the end of the response
    End,
}

/// Normalizes one provider's streaming chunk shape into text fragments.
pub trait FragmentExtractor: Send + 'static {
    /// Decode one SSE message. `event` is the SSE event name ("message" when
    /// the server did not set one), `data` the raw payload.
    fn extract_fragment(&self, event: &str, data: &str) -> Result<Decoded>;
}

/// Drive an event source through an extractor, yielding non-empty fragments.
pub fn sse_fragments<X: FragmentExtractor>(
    mut event_source: EventSource,
    extractor: X,
) -> FragmentStream {
    // Reconnecting mid-response would replay text we already emitted.
    event_source.set_retry_policy(Box::new(Never));

    Box::pin(stream! {
        while let Some(event) = event_source.next().await {
            match event {
                Ok(Event::Open) => {
                    tracing::debug!("SSE connection opened");
                }
                Ok(Event::Message(msg)) => {
                    match extractor.extract_fragment(&msg.event, &msg.data) {
                        Ok(Decoded::Fragment(text)) => {
                            if !text.is_empty() {
                                yield Ok(text);
                            }
                        }
                        Ok(Decoded::Skip) => {}
                        Ok(Decoded::End) => break,
                        Err(e) => {
                            yield Err(e);
                            break;
                        }
                    }
                }
                Err(reqwest_eventsource::Error::StreamEnded) => break,
                Err(reqwest_eventsource::Error::InvalidStatusCode(status, response)) => {
                    let retry_after = response
                        .headers()
                        .get("retry-after")
                        .and_then(|v| v.to_str().ok())
                        .and_then(|v| v.parse::<u64>().ok());
                    let body = response.text().await.unwrap_or_default();
                    yield Err(status_error(status, &body, retry_after));
                    break;
                }
                Err(reqwest_eventsource::Error::Transport(e)) => {
                    yield Err(Error::Http(e));
                    break;
                }
                Err(e) => {
                    yield Err(Error::Sse(e.to_string()));
                    break;
                }
            }
        }
        event_source.close();
    })
}

/// Map a non-success HTTP status and its body onto an error.
pub fn status_error(status: StatusCode, body: &str, retry_after: Option<u64>) -> Error {
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            Error::Auth(error_body_message(body).unwrap_or_else(|| status.to_string()))
        }
        StatusCode::TOO_MANY_REQUESTS => Error::RateLimited { retry_after },
        _ => {
            let message = error_body_message(body).unwrap_or_else(|| body.trim().to_string());
            let error_type = error_body_type(body).unwrap_or_else(|| {
                if status.is_server_error() {
                    "server_error".to_string()
                } else {
                    format!("http_{}", status.as_u16())
                }
            });
            Error::api(error_type, message)
        }
    }
}

/// `{"error": {"type"|"status": ..., "message": ...}}`, the shape all three
/// supported APIs use for error bodies.
#[derive(Debug, Deserialize)]
pub(crate) struct ErrorEnvelope {
    pub(crate) error: ErrorDetail,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ErrorDetail {
    #[serde(default, rename = "type")]
    pub(crate) error_type: Option<String>,
    #[serde(default)]
    pub(crate) status: Option<String>,
    #[serde(default)]
    pub(crate) message: Option<String>,
}

impl ErrorDetail {
    pub(crate) fn into_error(self) -> Error {
        let error_type = self
            .error_type
            .or(self.status)
            .unwrap_or_else(|| "error".to_string());
        Error::api(error_type, self.message.unwrap_or_default())
    }
}

fn error_body_message(body: &str) -> Option<String> {
    serde_json::from_str::<ErrorEnvelope>(body)
        .ok()
        .and_then(|e| e.error.message)
}

fn error_body_type(body: &str) -> Option<String> {
    serde_json::from_str::<ErrorEnvelope>(body)
        .ok()
        .and_then(|e| e.error.error_type.or(e.error.status))
}
