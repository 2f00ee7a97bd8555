//! Explicit per-invocation context threaded through the engine.

use std::sync::Arc;

use foreman_events::EventEmitter;
use foreman_provider::TokenSink;
use foreman_types::{OwnerId, RunId, TraceId};

/// The agent configuration one engine invocation runs with.
#[derive(Debug, Clone)]
pub struct AgentProfile {
    /// Model identifier.
    pub model: String,
    /// Reasoning effort hint, inherited by spawned workers.
    pub reasoning_effort: Option<String>,
}

impl AgentProfile {
    /// A profile with just a model.
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            reasoning_effort: None,
        }
    }
}

/// Explicit context for one engine invocation.
///
/// Carries the emitter (which knows whether it reports for a supervisor
/// or a worker), the correlating ids, and the optional token sink.
/// Background tasks must construct a fresh context rather than clone the
/// one they were spawned under.
#[derive(Clone)]
pub struct RunContext {
    /// Event emitter for this invocation.
    pub emitter: EventEmitter,
    /// Supervisor run id, when the invocation belongs to a run.
    pub run_id: Option<RunId>,
    /// Owning user.
    pub owner_id: Option<OwnerId>,
    /// End-to-end trace correlator.
    pub trace_id: Option<TraceId>,
    /// Per-token sink, present when streaming is enabled for the run.
    pub token_sink: Option<Arc<TokenSink>>,
}

impl RunContext {
    /// Context with no token streaming.
    #[must_use]
    pub fn new(
        emitter: EventEmitter,
        run_id: Option<RunId>,
        owner_id: Option<OwnerId>,
        trace_id: Option<TraceId>,
    ) -> Self {
        Self {
            emitter,
            run_id,
            owner_id,
            trace_id,
            token_sink: None,
        }
    }
}
