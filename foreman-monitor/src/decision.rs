//! Decision model for the roundabout loop.

use chrono::{DateTime, Utc};
use foreman_types::{JobId, JobStatus, WorkerId};
use tracing::warn;

/// Literal phrases that suggest the worker already has a final answer
/// (matched case-insensitively against the last tool output preview).
pub const FINAL_ANSWER_PATTERNS: &[&str] = &[
    "result:",
    "summary:",
    "completed successfully",
    "task complete",
    "done.",
];

/// Seconds after which a still-running operation is flagged as stuck.
pub(crate) const STUCK_THRESHOLD_SECS: f64 = 30.0;

/// Consecutive no-progress polls before the monitor warns.
pub(crate) const NO_PROGRESS_POLL_WARN: usize = 6;

/// Max activity entries carried into a decision context.
pub(crate) const ACTIVITY_LOG_MAX: usize = 20;

/// What the monitor does next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Continue monitoring (default).
    Wait,
    /// Seen enough - return with current findings.
    Exit,
    /// Abort the worker. Available to deciders, unused by the default one.
    Cancel,
    /// Return a drill-down pointer. Defined but dormant.
    Peek,
}

/// Lifecycle of one observed tool call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolActivityStatus {
    /// Started, no completion seen yet.
    Started,
    /// Completed.
    Completed,
    /// Failed.
    Failed,
}

/// Record of one tool call observed on the bus.
#[derive(Debug, Clone)]
pub struct ToolActivity {
    /// Tool name.
    pub tool_name: String,
    /// Current lifecycle state.
    pub status: ToolActivityStatus,
    /// When the start event arrived.
    pub started_at: DateTime<Utc>,
    /// Reported duration once completed/failed.
    pub duration_ms: Option<i64>,
    /// Args preview from the start event.
    pub args_preview: Option<String>,
    /// Error from a failure event.
    pub error: Option<String>,
}

/// Everything a decider sees on one tick.
#[derive(Debug, Clone)]
pub struct DecisionContext {
    /// The observed job.
    pub job_id: JobId,
    /// Worker bundle id, once assigned.
    pub worker_id: Option<WorkerId>,
    /// Task text.
    pub task: String,
    /// Current job status.
    pub status: JobStatus,
    /// Seconds since the monitor started.
    pub elapsed_seconds: f64,
    /// Recent tool activity, capped at [`ACTIVITY_LOG_MAX`].
    pub tool_activities: Vec<ToolActivity>,
    /// The last started-but-unfinished operation.
    pub current_operation: Option<ToolActivity>,
    /// Whether the current operation has run past the stuck threshold.
    pub is_stuck: bool,
    /// How long the current operation has been running.
    pub stuck_seconds: f64,
    /// Consecutive polls with no new events.
    pub polls_without_progress: usize,
    /// Preview of the last completed tool output.
    pub last_tool_output: Option<String>,
}

/// Rule-based decision. Retained as a deprecated compatibility path;
/// the default decider is the LLM.
///
/// Timeouts stop waiting, not working: stuck operations and no-progress
/// streaks are warned about, never cancelled - the hard timeout is the
/// safety net.
#[must_use]
pub fn make_heuristic_decision(
    ctx: &DecisionContext,
    cancel_stuck_threshold_secs: f64,
) -> (Decision, String) {
    if ctx.status.is_terminal() {
        return (
            Decision::Exit,
            format!("Worker status changed to {:?}", ctx.status),
        );
    }

    if let Some(output) = &ctx.last_tool_output {
        let lowered = output.to_lowercase();
        for pattern in FINAL_ANSWER_PATTERNS {
            if lowered.contains(pattern) {
                return (
                    Decision::Exit,
                    format!("Final answer pattern detected: {pattern}"),
                );
            }
        }
    }

    if ctx.is_stuck && ctx.stuck_seconds > cancel_stuck_threshold_secs {
        warn!(
            job_id = %ctx.job_id,
            stuck_seconds = ctx.stuck_seconds,
            "operation stuck - continuing, hard timeout is the safety net"
        );
    }

    if ctx.polls_without_progress >= NO_PROGRESS_POLL_WARN {
        warn!(
            job_id = %ctx.job_id,
            polls = ctx.polls_without_progress,
            "no progress - continuing, hard timeout is the safety net"
        );
    }

    (Decision::Wait, "Continuing to monitor".into())
}
