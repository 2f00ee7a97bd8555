//! Durable event log with per-run sequence assignment.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use foreman_types::RunId;
use thiserror::Error;
use tokio::sync::Mutex;

use crate::bus::EventBus;
use crate::event::{EventRecord, EventType};

/// Errors from the event store.
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum EventError {
    /// The payload could not be serialized.
    #[error("payload serialization failed: {0}")]
    Serialization(String),
}

#[derive(Default)]
struct LogState {
    next_id: i64,
    rows: Vec<EventRecord>,
    seq_by_run: HashMap<i64, u64>,
}

/// The durable event log plus the live bus.
///
/// `append_run_event` assigns the per-run monotonic `seq` under the log
/// lock, inserts the row, then publishes on the bus - in that order, so
/// a bus subscriber can never observe a seq the log does not have.
#[derive(Clone)]
pub struct EventStore {
    state: Arc<Mutex<LogState>>,
    bus: EventBus,
}

impl EventStore {
    /// Create an empty store with its own bus.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(LogState::default())),
            bus: EventBus::new(),
        }
    }

    /// The live bus.
    #[must_use]
    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    /// Append one event to a run's log and publish it.
    pub async fn append_run_event(
        &self,
        run_id: RunId,
        event_type: EventType,
        payload: serde_json::Value,
    ) -> Result<EventRecord, EventError> {
        let record = {
            let mut state = self.state.lock().await;
            state.next_id += 1;
            let next_id = state.next_id;
            let seq = state.seq_by_run.entry(run_id.as_i64()).or_insert(0);
            *seq += 1;
            let record = EventRecord {
                id: next_id,
                run_id,
                seq: *seq,
                event_type,
                payload,
                created_at: Utc::now(),
            };
            state.rows.push(record.clone());
            record
        };
        self.bus.publish(Arc::new(record.clone()));
        Ok(record)
    }

    /// All events of a run, in sequence order.
    pub async fn events_for_run(&self, run_id: RunId) -> Vec<EventRecord> {
        self.state
            .lock()
            .await
            .rows
            .iter()
            .filter(|e| e.run_id == run_id)
            .cloned()
            .collect()
    }

    /// How many events of the given type a run has.
    pub async fn count_for_run(&self, run_id: RunId, event_type: EventType) -> usize {
        self.state
            .lock()
            .await
            .rows
            .iter()
            .filter(|e| e.run_id == run_id && e.event_type == event_type)
            .count()
    }
}

impl Default for EventStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn seq_is_monotonic_per_run() {
        let store = EventStore::new();
        let run_a = RunId::new(1);
        let run_b = RunId::new(2);

        for _ in 0..3 {
            store
                .append_run_event(run_a, EventType::RunUpdated, json!({}))
                .await
                .unwrap();
        }
        store
            .append_run_event(run_b, EventType::RunUpdated, json!({}))
            .await
            .unwrap();

        let events_a = store.events_for_run(run_a).await;
        assert_eq!(
            events_a.iter().map(|e| e.seq).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );
        let events_b = store.events_for_run(run_b).await;
        assert_eq!(events_b[0].seq, 1);
    }

    #[tokio::test]
    async fn concurrent_appends_never_duplicate_seq() {
        let store = EventStore::new();
        let run = RunId::new(1);

        let mut handles = Vec::new();
        for _ in 0..50 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store
                    .append_run_event(run, EventType::WorkerHeartbeat, json!({}))
                    .await
                    .unwrap()
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let mut seqs: Vec<u64> = store
            .events_for_run(run)
            .await
            .iter()
            .map(|e| e.seq)
            .collect();
        seqs.sort_unstable();
        assert_eq!(seqs, (1..=50).collect::<Vec<u64>>());
    }

    #[tokio::test]
    async fn appended_events_reach_the_bus() {
        let store = EventStore::new();
        let mut receiver = store.bus().subscribe();
        store
            .append_run_event(RunId::new(1), EventType::Error, json!({"message": "x"}))
            .await
            .unwrap();
        let event = receiver.recv().await.unwrap();
        assert_eq!(event.seq, 1);
        assert_eq!(event.payload["message"], "x");
    }
}
