//! The Provider trait - what one LLM backend must implement.

use async_trait::async_trait;
use thiserror::Error;

use crate::types::{CompletionRequest, CompletionResponse};

/// Errors from a provider.
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum ProviderError {
    /// Rate-limited or temporarily unavailable; a retry may succeed.
    #[error("provider retryable: {0}")]
    Retryable(String),
    /// Invalid request, auth failure, or other permanent error.
    #[error("provider error: {0}")]
    Failed(String),
    /// No scripted response left (test providers only).
    #[error("provider exhausted: no response queued")]
    Exhausted,
}

/// Sink for per-token streaming. The engine wires this to the event bus
/// keyed by (owner, thread, assistant message id).
pub type TokenSink = dyn Fn(&str) + Send + Sync;

/// One chat-completion backend.
///
/// The trait is intentionally one call: messages + tools in, assistant
/// message out. Everything else (retries, routing, streaming transport)
/// is the implementation's concern.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Invoke the model once.
    async fn complete(
        &self,
        request: CompletionRequest,
    ) -> Result<CompletionResponse, ProviderError>;

    /// Invoke the model with per-token streaming.
    ///
    /// The default forwards to [`Provider::complete`] and flushes the
    /// final text through the sink in one chunk; backends with true
    /// streaming override this.
    async fn complete_with_tokens(
        &self,
        request: CompletionRequest,
        sink: Option<&TokenSink>,
    ) -> Result<CompletionResponse, ProviderError> {
        let response = self.complete(request).await?;
        if let Some(sink) = sink {
            if let Some(text) = response.message.text_content() {
                sink(text);
            }
        }
        Ok(response)
    }
}
