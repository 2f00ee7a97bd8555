//! Engine configuration with the recognized options and their defaults.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// How the roundabout monitor makes its wait/exit decision.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionMode {
    /// A small LLM interprets status and decides.
    #[default]
    Llm,
    /// Pre-programmed rules. Deprecated compatibility path.
    Heuristic,
    /// Heuristic first, LLM for ambiguous cases. Deprecated compatibility path.
    Hybrid,
}

/// Recognized configuration options.
///
/// A `Settings` value is built once and shared read-only. Defaults match
/// production; tests shrink the durations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Hard cap on ReAct loop iterations.
    pub max_react_iterations: u32,
    /// Threshold above which tool output is stored out-of-band.
    pub tool_output_max_chars: usize,
    /// Preview size embedded in the out-of-band marker block.
    pub tool_output_preview_chars: usize,
    /// Interval between heartbeats emitted during an LLM call.
    pub react_heartbeat_interval: Duration,
    /// Interval between roundabout status polls.
    pub roundabout_poll_interval: Duration,
    /// Monitor-only hard timeout; the worker may continue past it.
    pub roundabout_hard_timeout: Duration,
    /// Barrier deadline, after which the reaper resumes with partial results.
    pub barrier_deadline: Duration,
    /// A stuck operation beyond this is warned about, never cancelled.
    pub worker_cancel_stuck_threshold: Duration,
    /// Maximum simultaneous workers per owner.
    pub per_owner_worker_concurrency: usize,
    /// Whether per-token streaming is enabled for runs.
    pub enable_token_stream: bool,
    /// Decision engine for the roundabout monitor.
    pub decision_mode: DecisionMode,
    /// Per-invocation worker timeout.
    pub worker_timeout: Duration,
    /// Supervisor turn timeout; exceeding it defers the run.
    pub run_timeout: Duration,
    /// Orphaned `created` jobs older than this are failed by the reaper.
    pub orphan_job_cutoff: Duration,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            max_react_iterations: 50,
            tool_output_max_chars: 50_000,
            tool_output_preview_chars: 200,
            react_heartbeat_interval: Duration::from_secs(10),
            roundabout_poll_interval: Duration::from_secs(1),
            roundabout_hard_timeout: Duration::from_secs(300),
            barrier_deadline: Duration::from_secs(600),
            worker_cancel_stuck_threshold: Duration::from_secs(60),
            per_owner_worker_concurrency: 4,
            enable_token_stream: false,
            decision_mode: DecisionMode::default(),
            worker_timeout: Duration::from_secs(300),
            run_timeout: Duration::from_secs(60),
            orphan_job_cutoff: Duration::from_secs(300),
        }
    }
}
