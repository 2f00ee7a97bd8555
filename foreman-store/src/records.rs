//! Row types for the orchestrator tables.

use chrono::{DateTime, Utc};
use foreman_types::{
    BarrierId, BarrierJobStatus, BarrierStatus, JobId, JobStatus, MessageId, OwnerId, Role, RunId,
    RunStatus, RunTrigger, ThreadId, ThreadKind, ToolCall, TraceId, WorkerId,
};
use serde::{Deserialize, Serialize};

/// One supervisor run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    /// Row id.
    pub id: RunId,
    /// Owning user.
    pub owner_id: OwnerId,
    /// Thread the run executes against.
    pub thread_id: ThreadId,
    /// Current status.
    pub status: RunStatus,
    /// What started the run.
    pub trigger: RunTrigger,
    /// When execution started.
    pub started_at: Option<DateTime<Utc>>,
    /// When the run reached a terminal state.
    pub finished_at: Option<DateTime<Utc>>,
    /// Wall-clock duration in milliseconds.
    pub duration_ms: Option<i64>,
    /// Model identifier.
    pub model: String,
    /// Reasoning effort hint.
    pub reasoning_effort: Option<String>,
    /// End-to-end trace correlator.
    pub trace_id: Option<TraceId>,
    /// Aggregated token usage across the run and its resumes.
    pub total_tokens: u64,
    /// Stable id for all assistant events emitted on this run.
    pub assistant_message_id: Option<String>,
    /// Parent run when this is a continuation. At most one continuation
    /// per parent (unique constraint).
    pub continuation_of_run_id: Option<RunId>,
    /// Original run of the continuation chain; a root run's id is its
    /// own root.
    pub root_run_id: Option<RunId>,
    /// Short summary for the task inbox.
    pub summary: Option<String>,
    /// Error string on failure.
    pub error: Option<String>,
}

/// Fields for creating a run.
#[derive(Debug, Clone)]
pub struct NewRun {
    /// Owning user.
    pub owner_id: OwnerId,
    /// Thread to execute against.
    pub thread_id: ThreadId,
    /// What started the run.
    pub trigger: RunTrigger,
    /// Model identifier.
    pub model: String,
    /// Reasoning effort hint.
    pub reasoning_effort: Option<String>,
    /// Trace correlator.
    pub trace_id: Option<TraceId>,
}

/// One message thread.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThreadRecord {
    /// Row id.
    pub id: ThreadId,
    /// Owning user.
    pub owner_id: OwnerId,
    /// Supervisor or transient worker thread.
    pub kind: ThreadKind,
    /// Display title.
    pub title: String,
    /// Creation time.
    pub created_at: DateTime<Utc>,
}

/// One persisted message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageRecord {
    /// Row id.
    pub id: MessageId,
    /// Thread this message belongs to.
    pub thread_id: ThreadId,
    /// Message role.
    pub role: Role,
    /// Text content.
    pub content: String,
    /// Tool calls (assistant messages).
    pub tool_calls: Option<Vec<ToolCall>>,
    /// Tool call id (tool replies).
    pub tool_call_id: Option<String>,
    /// Tool name (tool replies).
    pub name: Option<String>,
    /// Assistant message this tool reply groups under.
    pub parent_id: Option<MessageId>,
    /// Whether the agent has consumed this message.
    pub processed: bool,
    /// Hidden from the UI when set.
    pub internal: bool,
    /// When the message was stored.
    pub sent_at: DateTime<Utc>,
    /// Optional metadata (token usage and the like).
    pub metadata: Option<serde_json::Value>,
}

impl MessageRecord {
    /// Convert to the wire message shape used by the engine.
    #[must_use]
    pub fn to_chat(&self) -> foreman_types::ChatMessage {
        foreman_types::ChatMessage {
            role: self.role,
            content: self.content.clone(),
            tool_calls: self.tool_calls.clone(),
            tool_call_id: self.tool_call_id.clone(),
            name: self.name.clone(),
        }
    }
}

/// Fields for appending a message.
#[derive(Debug, Clone)]
pub struct NewMessage {
    /// Target thread.
    pub thread_id: ThreadId,
    /// Message role.
    pub role: Role,
    /// Text content.
    pub content: String,
    /// Tool calls (assistant messages).
    pub tool_calls: Option<Vec<ToolCall>>,
    /// Tool call id (tool replies).
    pub tool_call_id: Option<String>,
    /// Tool name (tool replies).
    pub name: Option<String>,
    /// Explicit parent for UI grouping; resolved automatically for tool
    /// replies when absent.
    pub parent_id: Option<MessageId>,
    /// Whether the message is already consumed.
    pub processed: bool,
    /// Hidden from the UI when set.
    pub internal: bool,
    /// Optional metadata.
    pub metadata: Option<serde_json::Value>,
}

impl NewMessage {
    /// A plain message with the given role and content, defaults elsewhere.
    pub fn plain(thread_id: ThreadId, role: Role, content: impl Into<String>) -> Self {
        Self {
            thread_id,
            role,
            content: content.into(),
            tool_calls: None,
            tool_call_id: None,
            name: None,
            parent_id: None,
            processed: false,
            internal: false,
            metadata: None,
        }
    }
}

/// One worker job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerJobRecord {
    /// Row id.
    pub id: JobId,
    /// Owning user.
    pub owner_id: OwnerId,
    /// Supervisor run that spawned this job.
    pub run_id: RunId,
    /// Id of the model's spawn call that created the job. Unique together
    /// with `run_id`.
    pub tool_call_id: String,
    /// Trace correlator inherited from the supervisor.
    pub trace_id: Option<TraceId>,
    /// Task instructions.
    pub task: String,
    /// Model for the worker.
    pub model: String,
    /// Reasoning effort hint.
    pub reasoning_effort: Option<String>,
    /// Current status.
    pub status: JobStatus,
    /// Workspace + resume hints.
    pub config: Option<serde_json::Value>,
    /// Artifact bundle id, set once the worker starts.
    pub worker_id: Option<WorkerId>,
    /// Result text on success.
    pub result: Option<String>,
    /// Error text on failure.
    pub error: Option<String>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// When execution started.
    pub started_at: Option<DateTime<Utc>>,
    /// When the job reached a terminal state.
    pub finished_at: Option<DateTime<Utc>>,
}

/// Fields for creating a worker job.
#[derive(Debug, Clone)]
pub struct NewJob {
    /// Owning user.
    pub owner_id: OwnerId,
    /// Supervisor run spawning the job.
    pub run_id: RunId,
    /// Spawn tool call id.
    pub tool_call_id: String,
    /// Trace correlator.
    pub trace_id: Option<TraceId>,
    /// Task instructions.
    pub task: String,
    /// Model for the worker.
    pub model: String,
    /// Reasoning effort hint.
    pub reasoning_effort: Option<String>,
    /// Workspace + resume hints.
    pub config: Option<serde_json::Value>,
}

/// Per-run coordination record gating supervisor resume.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BarrierRecord {
    /// Row id.
    pub id: BarrierId,
    /// Run this barrier belongs to. Unique.
    pub run_id: RunId,
    /// Number of workers the barrier waits for.
    pub expected_count: u32,
    /// Number of terminal children so far.
    pub completed_count: u32,
    /// Current status.
    pub status: BarrierStatus,
    /// Deadline after which the reaper resolves the barrier.
    pub deadline_at: DateTime<Utc>,
}

/// One child row of a barrier.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BarrierJobRecord {
    /// Row id.
    pub id: i64,
    /// Owning barrier.
    pub barrier_id: BarrierId,
    /// The worker job this child tracks.
    pub job_id: JobId,
    /// Spawn tool call id, echoed on the resume tool message.
    pub tool_call_id: String,
    /// Current status.
    pub status: BarrierJobStatus,
    /// Worker result text.
    pub result: Option<String>,
    /// Worker error text.
    pub error: Option<String>,
    /// When the child resolved.
    pub completed_at: Option<DateTime<Utc>>,
}
