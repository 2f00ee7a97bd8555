//! Context-scoped emitters for supervisor and worker tool events.

use std::sync::{Arc, Mutex};

use foreman_tool::envelope::{DEFAULT_PREVIEW_CHARS, redact_sensitive_args, safe_preview};
use foreman_types::{JobId, OwnerId, RunId, TraceId, WorkerId};
use serde_json::{Value, json};
use tracing::warn;

use crate::event::EventType;
use crate::store::EventStore;

/// Which side of the hierarchy an emitter reports for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmitterKind {
    /// The long-lived supervisor run.
    Supervisor,
    /// A disposable worker.
    Worker,
}

/// Context object emitting lifecycle and tool events for one run or
/// worker. Cheap to clone; clones share the critical-error flag.
///
/// Emission is best-effort: failures are logged and swallowed so an
/// event-log hiccup never fails a committed run outcome.
#[derive(Clone)]
pub struct EventEmitter {
    kind: EmitterKind,
    run_id: Option<RunId>,
    owner_id: Option<OwnerId>,
    job_id: Option<JobId>,
    worker_id: Option<WorkerId>,
    trace_id: Option<TraceId>,
    message_id: Option<String>,
    store: EventStore,
    critical_error: Arc<Mutex<Option<String>>>,
}

impl EventEmitter {
    /// Emitter for a supervisor run.
    #[must_use]
    pub fn supervisor(
        store: EventStore,
        run_id: RunId,
        owner_id: OwnerId,
        message_id: Option<String>,
        trace_id: Option<TraceId>,
    ) -> Self {
        Self {
            kind: EmitterKind::Supervisor,
            run_id: Some(run_id),
            owner_id: Some(owner_id),
            job_id: None,
            worker_id: None,
            trace_id,
            message_id,
            store,
            critical_error: Arc::new(Mutex::new(None)),
        }
    }

    /// Emitter for a worker.
    #[must_use]
    pub fn worker(
        store: EventStore,
        run_id: Option<RunId>,
        owner_id: Option<OwnerId>,
        job_id: Option<JobId>,
        worker_id: WorkerId,
        trace_id: Option<TraceId>,
    ) -> Self {
        Self {
            kind: EmitterKind::Worker,
            run_id,
            owner_id,
            job_id,
            worker_id: Some(worker_id),
            trace_id,
            message_id: None,
            store,
            critical_error: Arc::new(Mutex::new(None)),
        }
    }

    /// Which side this emitter reports for.
    #[must_use]
    pub fn kind(&self) -> EmitterKind {
        self.kind
    }

    /// The run this emitter is scoped to.
    #[must_use]
    pub fn run_id(&self) -> Option<RunId> {
        self.run_id
    }

    /// The worker job this emitter is scoped to.
    #[must_use]
    pub fn job_id(&self) -> Option<JobId> {
        self.job_id
    }

    fn base_payload(&self) -> Value {
        let mut payload = serde_json::Map::new();
        if let Some(owner) = self.owner_id {
            payload.insert("owner_id".into(), json!(owner));
        }
        if let Some(job) = self.job_id {
            payload.insert("job_id".into(), json!(job));
        }
        if let Some(worker) = &self.worker_id {
            payload.insert("worker_id".into(), json!(worker));
        }
        if let Some(trace) = &self.trace_id {
            payload.insert("trace_id".into(), json!(trace));
        }
        if let Some(message_id) = &self.message_id {
            payload.insert("message_id".into(), json!(message_id));
        }
        Value::Object(payload)
    }

    async fn append(&self, event_type: EventType, mut payload: Value) {
        let Some(run_id) = self.run_id else {
            return;
        };
        if let (Value::Object(target), Value::Object(base)) = (&mut payload, self.base_payload()) {
            for (key, value) in base {
                target.entry(key).or_insert(value);
            }
        }
        if let Err(error) = self.store.append_run_event(run_id, event_type, payload).await {
            warn!(%run_id, ?event_type, %error, "failed to append run event");
        }
    }

    /// Emit a tool-started event. Arguments are redacted before preview.
    pub async fn emit_tool_started(
        &self,
        tool_name: &str,
        tool_call_id: &str,
        args: &Value,
    ) {
        let safe_args = redact_sensitive_args(args);
        let preview = safe_preview(&safe_args.to_string(), DEFAULT_PREVIEW_CHARS);
        let event_type = match self.kind {
            EmitterKind::Supervisor => EventType::SupervisorToolStarted,
            EmitterKind::Worker => EventType::WorkerToolStarted,
        };
        self.append(
            event_type,
            json!({
                "tool_name": tool_name,
                "tool_call_id": tool_call_id,
                "args_preview": preview,
                "args": safe_args,
            }),
        )
        .await;
    }

    /// Emit a tool-completed event with a capped result preview.
    pub async fn emit_tool_completed(
        &self,
        tool_name: &str,
        tool_call_id: &str,
        duration_ms: i64,
        result: &str,
    ) {
        let event_type = match self.kind {
            EmitterKind::Supervisor => EventType::SupervisorToolCompleted,
            EmitterKind::Worker => EventType::WorkerToolCompleted,
        };
        self.append(
            event_type,
            json!({
                "tool_name": tool_name,
                "tool_call_id": tool_call_id,
                "duration_ms": duration_ms,
                "result_preview": safe_preview(result, DEFAULT_PREVIEW_CHARS),
                "result": result,
            }),
        )
        .await;
    }

    /// Emit a tool-failed event.
    pub async fn emit_tool_failed(
        &self,
        tool_name: &str,
        tool_call_id: &str,
        duration_ms: i64,
        error: &str,
    ) {
        let event_type = match self.kind {
            EmitterKind::Supervisor => EventType::SupervisorToolFailed,
            EmitterKind::Worker => EventType::WorkerToolFailed,
        };
        self.append(
            event_type,
            json!({
                "tool_name": tool_name,
                "tool_call_id": tool_call_id,
                "duration_ms": duration_ms,
                "error": safe_preview(error, 500),
            }),
        )
        .await;
    }

    /// Emit a heartbeat so external monitors know the engine is alive
    /// inside a long LLM call.
    pub async fn emit_heartbeat(&self, phase: &str) {
        let event_type = match self.kind {
            EmitterKind::Supervisor => EventType::SupervisorHeartbeat,
            EmitterKind::Worker => EventType::WorkerHeartbeat,
        };
        self.append(
            event_type,
            json!({
                "activity": "llm_reasoning",
                "phase": phase,
            }),
        )
        .await;
    }

    /// Mark a critical error on this context. In-memory only - the outer
    /// runner reads it after the loop for the fail-fast override.
    pub fn mark_critical_error(&self, message: impl Into<String>) {
        if let Ok(mut slot) = self.critical_error.lock() {
            if slot.is_none() {
                *slot = Some(message.into());
            }
        }
    }

    /// The first critical error marked on this context, if any.
    #[must_use]
    pub fn critical_error(&self) -> Option<String> {
        self.critical_error.lock().ok().and_then(|slot| slot.clone())
    }
}
