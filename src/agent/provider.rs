//! Pluggable LLM provider trait and the shared retry policy.
//!
//! Implementations translate provider-agnostic [`ChatMessage`] sequences
//! into vendor SDK calls. The core never retries inside a provider; it
//! wraps each call site with [`invoke_with_retries`] so every node gets
//! the same timeout and bounded-backoff behavior.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{Stream, StreamExt};
use tracing::warn;

use super::message::ChatMessage;
use crate::error::AgentError;

/// Stream of text fragments from a generating model.
pub type TokenStream = Pin<Box<dyn Stream<Item = Result<String, AgentError>> + Send>>;

/// Trait for LLM provider backends.
///
/// Implementations handle the transport layer (HTTP, SDK calls) for a
/// specific provider while presenting a uniform interface to graph nodes.
/// Calls are assumed idempotent and retry-safe; the provider's own
/// retry/backoff policy, if any, is outside the core's scope.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Provider name (e.g. `"openai"`, `"anthropic"`), for logging.
    fn name(&self) -> &'static str;

    /// Executes a completion request and returns the full text.
    ///
    /// # Errors
    ///
    /// Returns [`AgentError`] on API failures or response errors.
    async fn invoke(&self, messages: &[ChatMessage]) -> Result<String, AgentError>;

    /// Executes a streaming completion request.
    ///
    /// Returns text fragments in generation order.
    ///
    /// # Errors
    ///
    /// Returns [`AgentError`] on connection or streaming failures.
    async fn stream(&self, messages: &[ChatMessage]) -> Result<TokenStream, AgentError>;
}

/// Runs `call` with a per-attempt timeout and bounded linear backoff.
///
/// Transient provider failures (errors, timeouts) are retried up to
/// `max_retries` additional attempts; the last failure is returned when
/// attempts are exhausted. Callers decide whether that failure is fatal
/// or degrades the node to its partial-failure output.
///
/// # Errors
///
/// The final attempt's [`AgentError`] once retries are exhausted.
pub async fn invoke_with_retries<T, F, Fut>(
    label: &str,
    timeout: Duration,
    max_retries: u32,
    mut call: F,
) -> Result<T, AgentError>
where
    F: FnMut() -> Fut + Send,
    Fut: Future<Output = Result<T, AgentError>> + Send,
    T: Send,
{
    let mut last_err = AgentError::Orchestration {
        message: format!("{label}: no attempts made"),
    };

    for attempt in 0..=max_retries {
        let result = tokio::time::timeout(timeout, call()).await;
        match result {
            Ok(Ok(value)) => return Ok(value),
            Ok(Err(err)) => {
                warn!(label, attempt, error = %err, "call failed");
                last_err = err;
            }
            Err(_) => {
                warn!(label, attempt, timeout_s = timeout.as_secs(), "call timed out");
                last_err = AgentError::Timeout {
                    seconds: timeout.as_secs(),
                };
            }
        }

        if attempt < max_retries {
            tokio::time::sleep(Duration::from_millis(200 * u64::from(attempt + 1))).await;
        }
    }

    Err(last_err)
}

/// Opens a provider stream, bounding the open call by `timeout`.
///
/// Streaming calls carry the same per-call timeout as [`invoke`]
/// calls; a provider that never produces a stream must not stall the
/// node that asked for it.
///
/// [`invoke`]: LlmProvider::invoke
///
/// # Errors
///
/// [`AgentError::Timeout`] when the open does not complete in time, or
/// the provider's own error.
pub async fn open_stream_with_timeout(
    label: &str,
    timeout: Duration,
    provider: &dyn LlmProvider,
    messages: &[ChatMessage],
) -> Result<TokenStream, AgentError> {
    match tokio::time::timeout(timeout, provider.stream(messages)).await {
        Ok(result) => result,
        Err(_) => {
            warn!(label, timeout_s = timeout.as_secs(), "stream open timed out");
            Err(AgentError::Timeout {
                seconds: timeout.as_secs(),
            })
        }
    }
}

/// Waits for the next stream fragment, bounding the wait by `timeout`.
///
/// # Errors
///
/// [`AgentError::Timeout`] when no fragment arrives in time, or the
/// stream's own error for a broken generation.
pub async fn next_with_timeout(
    stream: &mut TokenStream,
    timeout: Duration,
) -> Result<Option<String>, AgentError> {
    match tokio::time::timeout(timeout, stream.next()).await {
        Ok(Some(piece)) => piece.map(Some),
        Ok(None) => Ok(None),
        Err(_) => Err(AgentError::Timeout {
            seconds: timeout.as_secs(),
        }),
    }
}
