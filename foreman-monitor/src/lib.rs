#![deny(missing_docs)]
//! The roundabout - a bounded polling monitor for one running worker.
//!
//! Like glancing at a second screen: the monitor polls the job row,
//! listens to the worker's tool events and heartbeats, and decides each
//! tick whether to keep waiting or return with what it has. It never
//! mutates the worker and never blocks worker execution; the hard
//! timeout bounds the monitor, not the job.

mod decision;
mod llm_decider;
mod monitor;

pub use decision::{
    Decision, DecisionContext, FINAL_ANSWER_PATTERNS, ToolActivity, ToolActivityStatus,
    make_heuristic_decision,
};
pub use llm_decider::{LlmDecider, LlmDeciderStats};
pub use monitor::{
    MonitorOptions, RoundaboutMonitor, RoundaboutResult, RoundaboutStatus, ToolIndexEntry,
    format_roundabout_result,
};
