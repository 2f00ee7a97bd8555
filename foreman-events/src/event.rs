//! Event types and the durable record shape.

use chrono::{DateTime, Utc};
use foreman_types::RunId;
use serde::{Deserialize, Serialize};

/// Lifecycle and tool events emitted on a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    /// A supervisor run began.
    SupervisorStarted,
    /// The supervisor is reasoning over the request.
    SupervisorThinking,
    /// The run paused behind a worker barrier.
    SupervisorWaiting,
    /// A barrier resume began.
    SupervisorResumed,
    /// The run was deferred (timeout or acknowledgement turn).
    SupervisorDeferred,
    /// The run finished.
    SupervisorComplete,
    /// A supervisor-side tool call started.
    SupervisorToolStarted,
    /// A supervisor-side tool call completed.
    SupervisorToolCompleted,
    /// A supervisor-side tool call failed.
    SupervisorToolFailed,
    /// The supervisor engine is alive inside a long LLM call.
    SupervisorHeartbeat,
    /// An error surfaced on the run.
    Error,
    /// The run row changed; dashboards refresh on this.
    RunUpdated,
    /// A worker job was queued for execution.
    WorkerSpawned,
    /// A worker began executing.
    WorkerStarted,
    /// A worker-side tool call started.
    WorkerToolStarted,
    /// A worker-side tool call completed.
    WorkerToolCompleted,
    /// A worker-side tool call failed.
    WorkerToolFailed,
    /// The worker engine is alive inside a long LLM call.
    WorkerHeartbeat,
    /// A compressed worker summary became available.
    WorkerSummaryReady,
    /// A worker reached a terminal state.
    WorkerComplete,
}

/// One durable event row. `(run_id, seq)` is unique and `seq` is
/// strictly monotonic per run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventRecord {
    /// Row id.
    pub id: i64,
    /// Run the event belongs to.
    pub run_id: RunId,
    /// Per-run monotonic sequence number.
    pub seq: u64,
    /// Event type.
    pub event_type: EventType,
    /// Event payload. Always carries `owner_id`; tool events carry
    /// previews capped in length.
    pub payload: serde_json::Value,
    /// When the event was stored.
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_types_serialize_snake_case() {
        assert_eq!(
            serde_json::to_string(&EventType::SupervisorDeferred).unwrap(),
            "\"supervisor_deferred\""
        );
        assert_eq!(
            serde_json::to_string(&EventType::WorkerToolCompleted).unwrap(),
            "\"worker_tool_completed\""
        );
    }
}
