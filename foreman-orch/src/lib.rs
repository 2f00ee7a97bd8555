#![deny(missing_docs)]
//! Orchestration: the supervisor service, worker runner and job
//! processor, the barrier resume protocol, and the reaper.
//!
//! Everything here composes the lower crates behind one cloneable
//! [`Orchestrator`] handle. The two-phase spawn discipline lives across
//! this crate and the engine: the engine opens jobs in `created`, the
//! orchestrator commits the barrier and flips them to `queued`, and only
//! then can the processor pick them up - so a worker can never finish
//! before its barrier is observable.

mod builder;
mod orchestrator;
mod processor;
mod prompts;
mod reaper;
mod resume;
mod supervisor;
mod tools;
mod worker;

pub use builder::{MessageArrayBuilder, MessageArrayResult};
pub use orchestrator::{OrchError, Orchestrator};
pub use prompts::{RECENT_WORKER_CONTEXT_MARKER, build_supervisor_prompt, build_worker_prompt};
pub use reaper::ReaperStats;
pub use supervisor::{SupervisorRunOptions, SupervisorRunResult};
pub use tools::{
    GetWorkerMetadataTool, ListWorkersTool, ReadWorkerResultTool, SpawnWorkerTool,
    WaitForWorkerTool, SUPERVISOR_TOOL_NAMES, WORKER_TOOL_NAMES,
};
pub use worker::WorkerRunOutcome;
