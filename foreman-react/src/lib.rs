#![deny(missing_docs)]
//! The ReAct engine - model + tools in a reasoning loop.
//!
//! Drives the Reason-Act-Observe cycle: call the model, execute the
//! requested tools in parallel, feed the results back, repeat until the
//! model returns a terminal assistant message - or until a spawn call
//! produces an interrupt, in which case the loop returns early and the
//! caller parks the run behind a worker barrier.
//!
//! The engine is stateless: every invocation receives the full message
//! history plus an explicit [`RunContext`]; nothing is carried through
//! ambient task-local state, so background resume tasks can never
//! inherit a worker's identity by accident.

mod context;
mod engine;
mod executor;
mod spawn;

pub use context::{AgentProfile, RunContext};
pub use engine::{EngineError, ReactEngine};
pub use executor::ToolBatchOutcome;
pub use spawn::{Interrupt, SpawnedJob};

/// Result of one engine invocation.
#[derive(Debug)]
pub struct ReactResult {
    /// The full message history, including everything appended this call.
    pub messages: Vec<foreman_types::ChatMessage>,
    /// Token usage aggregated across all LLM invocations in this call.
    pub usage: foreman_types::TokenUsage,
    /// Present when the loop returned early for a worker barrier.
    pub interrupt: Option<Interrupt>,
}

impl ReactResult {
    /// Whether the loop returned early on an interrupt.
    #[must_use]
    pub fn interrupted(&self) -> bool {
        self.interrupt.is_some()
    }
}
