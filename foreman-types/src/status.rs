//! Status state machines for runs, worker jobs, and barriers.
//!
//! Transitions are total functions of time: the store only applies a
//! transition when the corresponding predicate here allows it.

use serde::{Deserialize, Serialize};

/// Status of a supervisor run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Actively executing the ReAct loop.
    Running,
    /// Finished with a final assistant message.
    Success,
    /// Finished with an error.
    Failed,
    /// Cancelled by external action.
    Cancelled,
    /// Paused behind a worker barrier.
    Waiting,
    /// Timed out waiting for the turn, or acknowledged and handed off to
    /// workers; a continuation run takes over.
    Deferred,
}

impl RunStatus {
    /// Whether a run in this status will never change again.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Success | Self::Failed | Self::Cancelled)
    }

    /// Whether the transition `self -> next` is allowed.
    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        match self {
            Self::Running => matches!(
                next,
                Self::Success | Self::Failed | Self::Cancelled | Self::Waiting | Self::Deferred
            ),
            Self::Waiting => matches!(next, Self::Running | Self::Failed | Self::Cancelled),
            Self::Deferred => matches!(
                next,
                Self::Running | Self::Success | Self::Failed | Self::Cancelled
            ),
            Self::Success | Self::Failed | Self::Cancelled => false,
        }
    }
}

/// What started a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunTrigger {
    /// A direct user request.
    Api,
    /// A continuation of a deferred run after worker completion.
    Continuation,
}

/// Kind of a message thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThreadKind {
    /// The one long-lived supervisor thread per owner.
    Super,
    /// A transient worker thread.
    Manual,
}

/// Status of a worker job.
///
/// `Created` is the two-phase-commit holding state: a job in `Created`
/// is owned by an in-flight barrier build and must never execute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Row exists but the barrier is not committed yet.
    Created,
    /// Eligible for pickup by the job processor.
    Queued,
    /// Being executed by a worker runner.
    Running,
    /// Finished with a result.
    Success,
    /// Finished with an error.
    Failed,
    /// Cancelled by external action.
    Cancelled,
    /// Deadline exceeded.
    Timeout,
}

impl JobStatus {
    /// Whether a job in this status will never change again.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Success | Self::Failed | Self::Cancelled | Self::Timeout
        )
    }

    /// Whether the transition `self -> next` is allowed.
    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        match self {
            Self::Created => matches!(next, Self::Queued | Self::Failed | Self::Cancelled),
            Self::Queued => matches!(
                next,
                Self::Running | Self::Failed | Self::Cancelled | Self::Timeout
            ),
            Self::Running => matches!(
                next,
                Self::Success | Self::Failed | Self::Cancelled | Self::Timeout
            ),
            _ => false,
        }
    }
}

/// Status of a worker barrier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BarrierStatus {
    /// Counting worker completions.
    Waiting,
    /// The final completion claimed the batch resume.
    Resuming,
    /// The resume finished.
    Completed,
    /// The resume failed.
    Failed,
}

/// Status of one barrier child row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BarrierJobStatus {
    /// Child exists, job still in its two-phase holding state.
    Created,
    /// Child queued for execution.
    Queued,
    /// Worker finished successfully.
    Completed,
    /// Worker failed.
    Failed,
    /// Deadline exceeded before the worker finished.
    Timeout,
}

impl BarrierJobStatus {
    /// Whether this child row counts as resolved.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Timeout)
    }
}
