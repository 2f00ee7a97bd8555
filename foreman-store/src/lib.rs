#![deny(missing_docs)]
//! Relational state for the orchestrator: runs, threads, messages,
//! worker jobs, and barriers.
//!
//! A single [`Database`] handle guards all tables behind one async lock.
//! Every compound operation below runs while the lock is held, which
//! gives each the atomicity that `SELECT … FOR UPDATE` transactions give
//! the same operations against a SQL backend - in particular the barrier
//! completion path, where exactly one caller may observe the final child
//! and claim the resume.

mod db;
mod records;

pub use db::{BarrierOutcome, Database, StoreError, WorkerResult};
pub use records::{
    BarrierJobRecord, BarrierRecord, MessageRecord, NewJob, NewMessage, NewRun, RunRecord,
    ThreadRecord, WorkerJobRecord,
};
