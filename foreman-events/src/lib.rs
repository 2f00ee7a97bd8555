#![deny(missing_docs)]
//! Run events: a durable per-run log with monotonic sequence numbers,
//! an in-memory bus for SSE fan-out, and context-scoped emitters.
//!
//! Events are an output, not the source of truth - runs are never
//! replayed from this log. Writes on auxiliary paths are logged and
//! swallowed; only the durable insert itself assigns `seq`.

mod bus;
mod emitter;
mod event;
mod store;

pub use bus::EventBus;
pub use emitter::{EmitterKind, EventEmitter};
pub use event::{EventRecord, EventType};
pub use store::{EventError, EventStore};
