#![deny(missing_docs)]
//! Shared types for the foreman orchestrator.
//!
//! Everything downstream crates agree on lives here: typed ids, chat
//! messages, the run/job/barrier state machines, token usage, and the
//! engine settings. No I/O, no async - plain data.

pub mod id;
pub mod message;
pub mod settings;
pub mod status;
pub mod usage;

pub use id::{BarrierId, JobId, MessageId, OwnerId, RunId, ThreadId, TraceId, WorkerId};
pub use message::{ChatMessage, Role, ToolCall};
pub use settings::{DecisionMode, Settings};
pub use status::{
    BarrierJobStatus, BarrierStatus, JobStatus, RunStatus, RunTrigger, ThreadKind,
};
pub use usage::TokenUsage;
