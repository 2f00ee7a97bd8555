#![deny(missing_docs)]
//! On-disk evidence left by workers.
//!
//! Each worker owns one append-only bundle directory: config, status,
//! the full conversation, numbered tool outputs, final result, summary,
//! monitoring snapshots, and metrics. Out-of-band tool outputs that are
//! too large for the conversation live under an owner-scoped directory
//! and are referenced inline with a fixed-format marker.

mod bundle;
mod outputs;

pub use bundle::{ArtifactError, ArtifactStore, BundleStatus, ToolCallIndexEntry, WorkerMetadata};
pub use outputs::{GetToolOutputTool, ToolOutputStore, format_marker};
