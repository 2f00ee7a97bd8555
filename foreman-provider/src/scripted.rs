//! Scripted provider for deterministic tests.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;

use crate::provider::{Provider, ProviderError};
use crate::types::{CompletionRequest, CompletionResponse};

/// A provider that replays a fixed sequence of responses.
///
/// Each `complete` call pops the next queued response; the queue running
/// dry is a test bug and surfaces as [`ProviderError::Exhausted`].
pub struct ScriptedProvider {
    responses: Mutex<VecDeque<CompletionResponse>>,
    calls: AtomicUsize,
}

impl ScriptedProvider {
    /// Create a provider that replays `responses` in order.
    #[must_use]
    pub fn new(responses: Vec<CompletionResponse>) -> Self {
        Self {
            responses: Mutex::new(responses.into()),
            calls: AtomicUsize::new(0),
        }
    }

    /// Append another response to the script.
    pub fn push(&self, response: CompletionResponse) {
        if let Ok(mut queue) = self.responses.lock() {
            queue.push_back(response);
        }
    }

    /// How many times `complete` has been called.
    #[must_use]
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Provider for ScriptedProvider {
    async fn complete(
        &self,
        _request: CompletionRequest,
    ) -> Result<CompletionResponse, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let next = self
            .responses
            .lock()
            .map_err(|_| ProviderError::Failed("scripted provider lock poisoned".into()))?
            .pop_front();
        next.ok_or(ProviderError::Exhausted)
    }
}
