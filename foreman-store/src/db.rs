//! The database handle and its compound operations.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use foreman_types::{
    BarrierId, BarrierJobStatus, BarrierStatus, JobId, JobStatus, MessageId, OwnerId, Role, RunId,
    RunStatus, RunTrigger, ThreadId, ThreadKind,
};
use thiserror::Error;
use tokio::sync::Mutex;

use crate::records::{
    BarrierJobRecord, BarrierRecord, MessageRecord, NewJob, NewMessage, NewRun, RunRecord,
    ThreadRecord, WorkerJobRecord,
};

/// Errors from store operations.
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum StoreError {
    /// The referenced row does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// A uniqueness constraint was violated.
    #[error("conflict: {0}")]
    Conflict(String),

    /// The requested status transition is not allowed.
    #[error("invalid transition: {0}")]
    InvalidTransition(String),
}

/// One worker's contribution to a batch resume.
#[derive(Debug, Clone)]
pub struct WorkerResult {
    /// Spawn tool call id the result replies to.
    pub tool_call_id: String,
    /// The worker job.
    pub job_id: JobId,
    /// Final child status.
    pub status: BarrierJobStatus,
    /// Result text.
    pub result: Option<String>,
    /// Error text.
    pub error: Option<String>,
}

/// Outcome of recording one worker completion against a barrier.
#[derive(Debug)]
pub enum BarrierOutcome {
    /// This caller observed the final child and claimed the resume.
    /// Exactly one caller per barrier instance receives this.
    Resume(Vec<WorkerResult>),
    /// More children outstanding.
    Waiting {
        /// Terminal children so far.
        completed: u32,
        /// Total expected.
        expected: u32,
    },
    /// Nothing to do (no barrier, barrier not waiting, or child already
    /// resolved).
    Skipped(&'static str),
}

#[derive(Debug, Default)]
struct State {
    next_id: i64,
    runs: BTreeMap<i64, RunRecord>,
    threads: BTreeMap<i64, ThreadRecord>,
    messages: BTreeMap<i64, MessageRecord>,
    jobs: BTreeMap<i64, WorkerJobRecord>,
    barriers: BTreeMap<i64, BarrierRecord>,
    barrier_jobs: BTreeMap<i64, BarrierJobRecord>,
}

impl State {
    fn allocate(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }
}

/// Cloneable handle to the orchestrator state.
///
/// All compound operations run under one lock; see the crate docs for
/// the atomicity argument.
#[derive(Debug, Clone, Default)]
pub struct Database {
    state: Arc<Mutex<State>>,
}

impl Database {
    /// Create an empty database.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    // ------------------------------------------------------------------
    // Runs
    // ------------------------------------------------------------------

    /// Create a run in `running` status.
    pub async fn create_run(&self, new: NewRun) -> RunRecord {
        let mut state = self.state.lock().await;
        let id = state.allocate();
        let run = RunRecord {
            id: RunId::new(id),
            owner_id: new.owner_id,
            thread_id: new.thread_id,
            status: RunStatus::Running,
            trigger: new.trigger,
            started_at: Some(Utc::now()),
            finished_at: None,
            duration_ms: None,
            model: new.model,
            reasoning_effort: new.reasoning_effort,
            trace_id: new.trace_id,
            total_tokens: 0,
            assistant_message_id: None,
            continuation_of_run_id: None,
            root_run_id: Some(RunId::new(id)),
            summary: None,
            error: None,
        };
        state.runs.insert(id, run.clone());
        run
    }

    /// Fetch a run.
    pub async fn get_run(&self, id: RunId) -> Option<RunRecord> {
        self.state.lock().await.runs.get(&id.as_i64()).cloned()
    }

    /// Mutate a run in place.
    pub async fn update_run(
        &self,
        id: RunId,
        mutate: impl FnOnce(&mut RunRecord),
    ) -> Result<RunRecord, StoreError> {
        let mut state = self.state.lock().await;
        let run = state
            .runs
            .get_mut(&id.as_i64())
            .ok_or_else(|| StoreError::NotFound(format!("run {id}")))?;
        mutate(run);
        Ok(run.clone())
    }

    /// Conditionally transition a run. Returns `true` when the update was
    /// applied - the `waiting → running` resume gate relies on exactly one
    /// caller seeing `true`.
    pub async fn transition_run(
        &self,
        id: RunId,
        from: RunStatus,
        to: RunStatus,
    ) -> Result<bool, StoreError> {
        let mut state = self.state.lock().await;
        let run = state
            .runs
            .get_mut(&id.as_i64())
            .ok_or_else(|| StoreError::NotFound(format!("run {id}")))?;
        if run.status != from {
            return Ok(false);
        }
        if !from.can_transition_to(to) {
            return Err(StoreError::InvalidTransition(format!("{from:?} -> {to:?}")));
        }
        run.status = to;
        Ok(true)
    }

    /// Create a continuation run for a deferred parent.
    ///
    /// The unique constraint on `continuation_of_run_id` is the
    /// authoritative dedup: a second caller gets `Conflict` and should
    /// fetch the existing row.
    pub async fn create_continuation_run(
        &self,
        original_id: RunId,
        trace_id: Option<foreman_types::TraceId>,
    ) -> Result<RunRecord, StoreError> {
        let mut state = self.state.lock().await;
        if state
            .runs
            .values()
            .any(|r| r.continuation_of_run_id == Some(original_id))
        {
            return Err(StoreError::Conflict(format!(
                "continuation of run {original_id} already exists"
            )));
        }
        let original = state
            .runs
            .get(&original_id.as_i64())
            .ok_or_else(|| StoreError::NotFound(format!("run {original_id}")))?
            .clone();

        let id = state.allocate();
        let run = RunRecord {
            id: RunId::new(id),
            owner_id: original.owner_id,
            thread_id: original.thread_id,
            status: RunStatus::Running,
            trigger: RunTrigger::Continuation,
            started_at: Some(Utc::now()),
            finished_at: None,
            duration_ms: None,
            model: original.model.clone(),
            reasoning_effort: original.reasoning_effort.clone(),
            trace_id: trace_id.or(original.trace_id),
            total_tokens: 0,
            assistant_message_id: None,
            continuation_of_run_id: Some(original_id),
            root_run_id: original.root_run_id.or(Some(original_id)),
            summary: None,
            error: None,
        };
        state.runs.insert(id, run.clone());
        Ok(run)
    }

    /// The continuation of a run, if one exists.
    pub async fn find_continuation_of(&self, original_id: RunId) -> Option<RunRecord> {
        self.state
            .lock()
            .await
            .runs
            .values()
            .find(|r| r.continuation_of_run_id == Some(original_id))
            .cloned()
    }

    // ------------------------------------------------------------------
    // Threads & messages
    // ------------------------------------------------------------------

    /// Create a thread.
    pub async fn create_thread(
        &self,
        owner_id: OwnerId,
        kind: ThreadKind,
        title: impl Into<String>,
    ) -> ThreadRecord {
        let mut state = self.state.lock().await;
        let id = state.allocate();
        let thread = ThreadRecord {
            id: ThreadId::new(id),
            owner_id,
            kind,
            title: title.into(),
            created_at: Utc::now(),
        };
        state.threads.insert(id, thread.clone());
        thread
    }

    /// The owner's thread of the given kind, if any. Supervisor threads
    /// are unique per owner by construction.
    pub async fn find_thread(&self, owner_id: OwnerId, kind: ThreadKind) -> Option<ThreadRecord> {
        self.state
            .lock()
            .await
            .threads
            .values()
            .find(|t| t.owner_id == owner_id && t.kind == kind)
            .cloned()
    }

    /// Append a message, enforcing the tool-linkage invariant.
    ///
    /// A tool reply must reference a `tool_calls[].id` on the most recent
    /// preceding assistant message in the thread. When the linkage cannot
    /// be made the reply is stored as an `internal` user-role
    /// notification instead.
    pub async fn append_message(&self, new: NewMessage) -> MessageRecord {
        let mut state = self.state.lock().await;

        let mut role = new.role;
        let mut content = new.content;
        let mut tool_call_id = new.tool_call_id;
        let mut name = new.name;
        let mut internal = new.internal;
        let mut parent_id = new.parent_id;

        if role == Role::Tool {
            let parent = latest_assistant_with_tool_calls_locked(&state, new.thread_id)
                .filter(|assistant| {
                    let wanted = tool_call_id.as_deref();
                    assistant
                        .tool_calls
                        .as_ref()
                        .is_some_and(|calls| calls.iter().any(|tc| Some(tc.id.as_str()) == wanted))
                });
            match parent {
                Some(assistant) => {
                    if parent_id.is_none() {
                        parent_id = Some(assistant.id);
                    }
                }
                None => {
                    role = Role::User;
                    content = format!("SYSTEM NOTIFICATION: {content}");
                    tool_call_id = None;
                    name = None;
                    internal = true;
                    parent_id = None;
                }
            }
        }

        let id = state.allocate();
        let message = MessageRecord {
            id: MessageId::new(id),
            thread_id: new.thread_id,
            role,
            content,
            tool_calls: new.tool_calls,
            tool_call_id,
            name,
            parent_id,
            processed: new.processed,
            internal,
            sent_at: Utc::now(),
            metadata: new.metadata,
        };
        state.messages.insert(id, message.clone());
        message
    }

    /// All messages of a thread, in insertion order.
    pub async fn messages_for_thread(&self, thread_id: ThreadId) -> Vec<MessageRecord> {
        self.state
            .lock()
            .await
            .messages
            .values()
            .filter(|m| m.thread_id == thread_id)
            .cloned()
            .collect()
    }

    /// Unprocessed messages of a thread, in insertion order.
    pub async fn unprocessed_messages(&self, thread_id: ThreadId) -> Vec<MessageRecord> {
        self.state
            .lock()
            .await
            .messages
            .values()
            .filter(|m| m.thread_id == thread_id && !m.processed)
            .cloned()
            .collect()
    }

    /// Mark messages processed.
    pub async fn mark_processed(&self, ids: &[MessageId]) {
        let mut state = self.state.lock().await;
        for id in ids {
            if let Some(message) = state.messages.get_mut(&id.as_i64()) {
                message.processed = true;
            }
        }
    }

    /// Delete messages by id.
    pub async fn delete_messages(&self, ids: &[MessageId]) {
        let mut state = self.state.lock().await;
        for id in ids {
            state.messages.remove(&id.as_i64());
        }
    }

    /// System messages of a thread containing `marker`, newest first.
    pub async fn system_messages_with_marker(
        &self,
        thread_id: ThreadId,
        marker: &str,
    ) -> Vec<MessageRecord> {
        let state = self.state.lock().await;
        let mut found: Vec<MessageRecord> = state
            .messages
            .values()
            .filter(|m| {
                m.thread_id == thread_id && m.role == Role::System && m.content.contains(marker)
            })
            .cloned()
            .collect();
        found.reverse();
        found
    }

    /// The most recent assistant message of the thread carrying tool calls.
    pub async fn latest_assistant_with_tool_calls(
        &self,
        thread_id: ThreadId,
    ) -> Option<MessageRecord> {
        let state = self.state.lock().await;
        latest_assistant_with_tool_calls_locked(&state, thread_id)
    }

    /// Attach metadata to a message.
    pub async fn set_message_metadata(
        &self,
        id: MessageId,
        metadata: serde_json::Value,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let message = state
            .messages
            .get_mut(&id.as_i64())
            .ok_or_else(|| StoreError::NotFound(format!("message {id}")))?;
        message.metadata = Some(metadata);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Worker jobs
    // ------------------------------------------------------------------

    /// Create a worker job in the `created` holding state.
    ///
    /// `(run_id, tool_call_id)` is unique: a replayed spawn returns the
    /// existing row with `false` instead of inserting a duplicate.
    pub async fn create_job(&self, new: NewJob) -> (WorkerJobRecord, bool) {
        let mut state = self.state.lock().await;
        if let Some(existing) = state
            .jobs
            .values()
            .find(|j| j.run_id == new.run_id && j.tool_call_id == new.tool_call_id)
        {
            return (existing.clone(), false);
        }
        let id = state.allocate();
        let job = WorkerJobRecord {
            id: JobId::new(id),
            owner_id: new.owner_id,
            run_id: new.run_id,
            tool_call_id: new.tool_call_id,
            trace_id: new.trace_id,
            task: new.task,
            model: new.model,
            reasoning_effort: new.reasoning_effort,
            status: JobStatus::Created,
            config: new.config,
            worker_id: None,
            result: None,
            error: None,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
        };
        state.jobs.insert(id, job.clone());
        (job, true)
    }

    /// Fetch a job.
    pub async fn get_job(&self, id: JobId) -> Option<WorkerJobRecord> {
        self.state.lock().await.jobs.get(&id.as_i64()).cloned()
    }

    /// Fetch a job, enforcing owner scoping.
    pub async fn get_job_for_owner(
        &self,
        id: JobId,
        owner_id: OwnerId,
    ) -> Option<WorkerJobRecord> {
        self.state
            .lock()
            .await
            .jobs
            .get(&id.as_i64())
            .filter(|j| j.owner_id == owner_id)
            .cloned()
    }

    /// Mutate a job in place.
    pub async fn update_job(
        &self,
        id: JobId,
        mutate: impl FnOnce(&mut WorkerJobRecord),
    ) -> Result<WorkerJobRecord, StoreError> {
        let mut state = self.state.lock().await;
        let job = state
            .jobs
            .get_mut(&id.as_i64())
            .ok_or_else(|| StoreError::NotFound(format!("job {id}")))?;
        mutate(job);
        Ok(job.clone())
    }

    /// Flip jobs from `created` to `queued`. This is the single point at
    /// which workers become eligible to run; it happens only after the
    /// barrier commit. Returns the number of rows flipped.
    pub async fn flip_created_to_queued(&self, ids: &[JobId]) -> usize {
        let mut state = self.state.lock().await;
        let mut flipped = 0;
        for id in ids {
            if let Some(job) = state.jobs.get_mut(&id.as_i64()) {
                if job.status == JobStatus::Created {
                    job.status = JobStatus::Queued;
                    flipped += 1;
                }
            }
        }
        flipped
    }

    /// Claim the oldest `queued` job whose owner is under the concurrency
    /// cap, flipping it to `running`.
    pub async fn claim_next_queued(&self, per_owner_cap: usize) -> Option<WorkerJobRecord> {
        let mut state = self.state.lock().await;
        let candidate = state
            .jobs
            .values()
            .filter(|j| j.status == JobStatus::Queued)
            .find(|j| {
                let running = state
                    .jobs
                    .values()
                    .filter(|other| {
                        other.owner_id == j.owner_id && other.status == JobStatus::Running
                    })
                    .count();
                running < per_owner_cap
            })
            .map(|j| j.id);
        let id = candidate?;
        let job = state.jobs.get_mut(&id.as_i64())?;
        job.status = JobStatus::Running;
        job.started_at = Some(Utc::now());
        Some(job.clone())
    }

    /// Record a job's terminal outcome, unless the row is already
    /// terminal. An externally-`cancelled` job is never overwritten;
    /// the existing row is returned untouched.
    pub async fn finish_job(
        &self,
        id: JobId,
        status: JobStatus,
        result: Option<String>,
        error: Option<String>,
    ) -> Result<WorkerJobRecord, StoreError> {
        let mut state = self.state.lock().await;
        let job = state
            .jobs
            .get_mut(&id.as_i64())
            .ok_or_else(|| StoreError::NotFound(format!("job {id}")))?;
        if job.status.is_terminal() {
            return Ok(job.clone());
        }
        job.status = status;
        if result.is_some() {
            job.result = result;
        }
        if error.is_some() {
            job.error = error;
        }
        job.finished_at = Some(Utc::now());
        Ok(job.clone())
    }

    /// Jobs spawned by a run.
    pub async fn jobs_for_run(&self, run_id: RunId) -> Vec<WorkerJobRecord> {
        self.state
            .lock()
            .await
            .jobs
            .values()
            .filter(|j| j.run_id == run_id)
            .cloned()
            .collect()
    }

    /// Recent jobs for an owner, newest first, capped at `limit`.
    pub async fn recent_jobs_for_owner(
        &self,
        owner_id: OwnerId,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> Vec<WorkerJobRecord> {
        let state = self.state.lock().await;
        let mut jobs: Vec<WorkerJobRecord> = state
            .jobs
            .values()
            .filter(|j| {
                j.owner_id == owner_id
                    && j.created_at >= cutoff
                    && matches!(
                        j.status,
                        JobStatus::Success | JobStatus::Failed | JobStatus::Running
                    )
            })
            .cloned()
            .collect();
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        jobs.truncate(limit);
        jobs
    }

    /// Jobs stuck in `created` past the cutoff with no barrier child -
    /// the barrier commit failed and they will never be flipped.
    pub async fn orphaned_created_jobs(&self, cutoff: DateTime<Utc>) -> Vec<WorkerJobRecord> {
        let state = self.state.lock().await;
        state
            .jobs
            .values()
            .filter(|j| {
                j.status == JobStatus::Created
                    && j.created_at < cutoff
                    && !state.barrier_jobs.values().any(|bj| bj.job_id == j.id)
            })
            .cloned()
            .collect()
    }

    // ------------------------------------------------------------------
    // Barriers
    // ------------------------------------------------------------------

    /// Create the barrier for a run, or reset the existing one in place.
    ///
    /// A prior barrier at the same `run_id` keeps its row: its children
    /// are deleted and its counters reset, so stale results can never
    /// leak into the next resume.
    pub async fn create_or_reset_barrier(
        &self,
        run_id: RunId,
        children: &[(JobId, String)],
        deadline_at: DateTime<Utc>,
    ) -> BarrierRecord {
        let mut state = self.state.lock().await;

        let barrier_id = match state.barriers.values_mut().find(|b| b.run_id == run_id) {
            Some(existing) => {
                existing.expected_count = children.len() as u32;
                existing.completed_count = 0;
                existing.status = BarrierStatus::Waiting;
                existing.deadline_at = deadline_at;
                existing.id
            }
            None => {
                let id = state.allocate();
                let barrier = BarrierRecord {
                    id: BarrierId::new(id),
                    run_id,
                    expected_count: children.len() as u32,
                    completed_count: 0,
                    status: BarrierStatus::Waiting,
                    deadline_at,
                };
                state.barriers.insert(id, barrier);
                BarrierId::new(id)
            }
        };

        state.barrier_jobs.retain(|_, bj| bj.barrier_id != barrier_id);
        for (job_id, tool_call_id) in children {
            let id = state.allocate();
            state.barrier_jobs.insert(
                id,
                BarrierJobRecord {
                    id,
                    barrier_id,
                    job_id: *job_id,
                    tool_call_id: tool_call_id.clone(),
                    status: BarrierJobStatus::Queued,
                    result: None,
                    error: None,
                    completed_at: None,
                },
            );
        }

        BarrierRecord {
            id: barrier_id,
            run_id,
            expected_count: children.len() as u32,
            completed_count: 0,
            status: BarrierStatus::Waiting,
            deadline_at,
        }
    }

    /// The barrier for a run.
    pub async fn get_barrier(&self, run_id: RunId) -> Option<BarrierRecord> {
        self.state
            .lock()
            .await
            .barriers
            .values()
            .find(|b| b.run_id == run_id)
            .cloned()
    }

    /// Child rows of a run's barrier, in creation order.
    pub async fn barrier_children(&self, run_id: RunId) -> Vec<BarrierJobRecord> {
        let state = self.state.lock().await;
        let Some(barrier) = state.barriers.values().find(|b| b.run_id == run_id) else {
            return vec![];
        };
        state
            .barrier_jobs
            .values()
            .filter(|bj| bj.barrier_id == barrier.id)
            .cloned()
            .collect()
    }

    /// Set a barrier's status.
    pub async fn set_barrier_status(
        &self,
        run_id: RunId,
        status: BarrierStatus,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let barrier = state
            .barriers
            .values_mut()
            .find(|b| b.run_id == run_id)
            .ok_or_else(|| StoreError::NotFound(format!("barrier for run {run_id}")))?;
        barrier.status = status;
        Ok(())
    }

    /// Record one worker completion against a run's barrier.
    ///
    /// This is the §4.8 completion transaction: lock, status-guard,
    /// child update, counter bump, and - when the final child resolves -
    /// an atomic claim of the resume. Exactly one caller per barrier
    /// instance receives [`BarrierOutcome::Resume`].
    pub async fn record_barrier_completion(
        &self,
        run_id: RunId,
        job_id: JobId,
        result: Option<String>,
        error: Option<String>,
    ) -> BarrierOutcome {
        let mut state = self.state.lock().await;

        let Some(barrier) = state.barriers.values().find(|b| b.run_id == run_id) else {
            return BarrierOutcome::Skipped("no barrier found");
        };
        let barrier_id = barrier.id;
        if barrier.status != BarrierStatus::Waiting {
            return BarrierOutcome::Skipped("barrier not waiting");
        }

        let Some(child) = state
            .barrier_jobs
            .values_mut()
            .find(|bj| bj.barrier_id == barrier_id && bj.job_id == job_id)
        else {
            return BarrierOutcome::Skipped("no barrier job found");
        };
        if child.status.is_terminal() {
            return BarrierOutcome::Skipped("barrier job already resolved");
        }

        child.status = if error.is_some() {
            BarrierJobStatus::Failed
        } else {
            BarrierJobStatus::Completed
        };
        child.result = result;
        child.error = error;
        child.completed_at = Some(Utc::now());

        let Some(barrier) = state.barriers.get_mut(&barrier_id.as_i64()) else {
            return BarrierOutcome::Skipped("barrier missing");
        };
        barrier.completed_count += 1;
        let completed = barrier.completed_count;
        let expected = barrier.expected_count;

        if completed >= expected {
            barrier.status = BarrierStatus::Resuming;
            let results = state
                .barrier_jobs
                .values()
                .filter(|bj| bj.barrier_id == barrier_id)
                .map(|bj| WorkerResult {
                    tool_call_id: bj.tool_call_id.clone(),
                    job_id: bj.job_id,
                    status: bj.status,
                    result: bj.result.clone(),
                    error: bj.error.clone(),
                })
                .collect();
            return BarrierOutcome::Resume(results);
        }

        BarrierOutcome::Waiting {
            completed,
            expected,
        }
    }

    /// Claim every expired `waiting` barrier: flip it to `resuming`, mark
    /// outstanding children `timeout`, and return all children for the
    /// partial-results resume. The claim is atomic, so a concurrent
    /// worker completion either beat us (barrier no longer waiting) or
    /// sees the `resuming` status and skips.
    pub async fn claim_expired_barriers(
        &self,
        now: DateTime<Utc>,
    ) -> Vec<(BarrierRecord, Vec<WorkerResult>)> {
        let mut state = self.state.lock().await;
        let expired: Vec<BarrierId> = state
            .barriers
            .values()
            .filter(|b| b.status == BarrierStatus::Waiting && b.deadline_at < now)
            .map(|b| b.id)
            .collect();

        let mut claimed = Vec::new();
        for barrier_id in expired {
            if let Some(barrier) = state.barriers.values_mut().find(|b| b.id == barrier_id) {
                barrier.status = BarrierStatus::Resuming;
                let snapshot = barrier.clone();

                for child in state
                    .barrier_jobs
                    .values_mut()
                    .filter(|bj| bj.barrier_id == barrier_id)
                {
                    if !child.status.is_terminal() {
                        child.status = BarrierJobStatus::Timeout;
                        child.error = Some("Worker timed out (deadline exceeded)".into());
                        child.completed_at = Some(now);
                    }
                }

                let results = state
                    .barrier_jobs
                    .values()
                    .filter(|bj| bj.barrier_id == barrier_id)
                    .map(|bj| WorkerResult {
                        tool_call_id: bj.tool_call_id.clone(),
                        job_id: bj.job_id,
                        status: bj.status,
                        result: bj.result.clone(),
                        error: bj.error.clone(),
                    })
                    .collect();
                claimed.push((snapshot, results));
            }
        }
        claimed
    }
}

fn latest_assistant_with_tool_calls_locked(
    state: &State,
    thread_id: ThreadId,
) -> Option<MessageRecord> {
    state
        .messages
        .values()
        .rev()
        .find(|m| {
            m.thread_id == thread_id
                && m.role == Role::Assistant
                && m.tool_calls.as_ref().is_some_and(|calls| !calls.is_empty())
        })
        .cloned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use foreman_types::ToolCall;
    use serde_json::json;

    fn new_run(owner: i64, thread: i64) -> NewRun {
        NewRun {
            owner_id: OwnerId::new(owner),
            thread_id: ThreadId::new(thread),
            trigger: RunTrigger::Api,
            model: "scripted".into(),
            reasoning_effort: None,
            trace_id: None,
        }
    }

    fn new_job(db_run: RunId, tool_call_id: &str) -> NewJob {
        NewJob {
            owner_id: OwnerId::new(1),
            run_id: db_run,
            tool_call_id: tool_call_id.into(),
            trace_id: None,
            task: "do the thing".into(),
            model: "scripted".into(),
            reasoning_effort: None,
            config: None,
        }
    }

    async fn run_with_barrier(db: &Database, tool_call_ids: &[&str]) -> (RunRecord, Vec<JobId>) {
        let run = db.create_run(new_run(1, 1)).await;
        let mut children = Vec::new();
        let mut job_ids = Vec::new();
        for tc in tool_call_ids {
            let (job, _) = db.create_job(new_job(run.id, tc)).await;
            children.push((job.id, (*tc).to_string()));
            job_ids.push(job.id);
        }
        let deadline = Utc::now() + ChronoDuration::minutes(10);
        db.create_or_reset_barrier(run.id, &children, deadline).await;
        (run, job_ids)
    }

    #[tokio::test]
    async fn transition_run_is_conditional() {
        let db = Database::new();
        let run = db.create_run(new_run(1, 1)).await;

        assert!(db
            .transition_run(run.id, RunStatus::Running, RunStatus::Waiting)
            .await
            .unwrap());
        // Second caller loses the gate
        assert!(!db
            .transition_run(run.id, RunStatus::Running, RunStatus::Waiting)
            .await
            .unwrap());
        assert!(db
            .transition_run(run.id, RunStatus::Waiting, RunStatus::Running)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn invalid_transitions_are_rejected() {
        let db = Database::new();
        let run = db.create_run(new_run(1, 1)).await;
        db.transition_run(run.id, RunStatus::Running, RunStatus::Waiting)
            .await
            .unwrap();
        let err = db
            .transition_run(run.id, RunStatus::Waiting, RunStatus::Success)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidTransition(_)));
    }

    #[tokio::test]
    async fn continuation_is_unique_and_inherits_root() {
        let db = Database::new();
        let original = db.create_run(new_run(1, 1)).await;

        let first = db.create_continuation_run(original.id, None).await.unwrap();
        assert_eq!(first.continuation_of_run_id, Some(original.id));
        assert_eq!(first.root_run_id, Some(original.id));
        assert_eq!(first.trigger, RunTrigger::Continuation);

        let err = db.create_continuation_run(original.id, None).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
        assert_eq!(
            db.find_continuation_of(original.id).await.unwrap().id,
            first.id
        );

        // A continuation of the continuation keeps the original root.
        db.update_run(first.id, |r| r.status = RunStatus::Deferred)
            .await
            .unwrap();
        let second = db.create_continuation_run(first.id, None).await.unwrap();
        assert_eq!(second.root_run_id, Some(original.id));
    }

    #[tokio::test]
    async fn concurrent_continuation_attempts_yield_one_row() {
        let db = Database::new();
        let original = db.create_run(new_run(1, 1)).await;

        let mut handles = Vec::new();
        for _ in 0..8 {
            let db = db.clone();
            let id = original.id;
            handles.push(tokio::spawn(
                async move { db.create_continuation_run(id, None).await },
            ));
        }
        let mut created = 0;
        for handle in handles {
            if handle.await.unwrap().is_ok() {
                created += 1;
            }
        }
        assert_eq!(created, 1);
    }

    #[tokio::test]
    async fn tool_reply_links_to_issuing_assistant() {
        let db = Database::new();
        let thread = db.create_thread(OwnerId::new(1), ThreadKind::Super, "t").await;

        let assistant = db
            .append_message(NewMessage {
                tool_calls: Some(vec![ToolCall::new("tc1", "spawn_worker", json!({}))]),
                ..NewMessage::plain(thread.id, Role::Assistant, "")
            })
            .await;

        let reply = db
            .append_message(NewMessage {
                tool_call_id: Some("tc1".into()),
                name: Some("spawn_worker".into()),
                ..NewMessage::plain(thread.id, Role::Tool, "Worker completed:\n\nok")
            })
            .await;
        assert_eq!(reply.role, Role::Tool);
        assert_eq!(reply.parent_id, Some(assistant.id));
    }

    #[tokio::test]
    async fn unlinkable_tool_reply_becomes_internal_notification() {
        let db = Database::new();
        let thread = db.create_thread(OwnerId::new(1), ThreadKind::Super, "t").await;

        let reply = db
            .append_message(NewMessage {
                tool_call_id: Some("tc-unknown".into()),
                name: Some("spawn_worker".into()),
                ..NewMessage::plain(thread.id, Role::Tool, "Worker completed")
            })
            .await;
        assert_eq!(reply.role, Role::User);
        assert!(reply.internal);
        assert!(reply.content.starts_with("SYSTEM NOTIFICATION:"));
        assert!(reply.tool_call_id.is_none());
    }

    #[tokio::test]
    async fn duplicate_spawn_returns_existing_job() {
        let db = Database::new();
        let run = db.create_run(new_run(1, 1)).await;
        let (first, created) = db.create_job(new_job(run.id, "tc1")).await;
        assert!(created);
        let (second, created) = db.create_job(new_job(run.id, "tc1")).await;
        assert!(!created);
        assert_eq!(first.id, second.id);
    }

    #[tokio::test]
    async fn created_jobs_are_not_claimable_until_flipped() {
        let db = Database::new();
        let run = db.create_run(new_run(1, 1)).await;
        let (job, _) = db.create_job(new_job(run.id, "tc1")).await;
        assert_eq!(job.status, JobStatus::Created);

        assert!(db.claim_next_queued(4).await.is_none());

        assert_eq!(db.flip_created_to_queued(&[job.id]).await, 1);
        let claimed = db.claim_next_queued(4).await.unwrap();
        assert_eq!(claimed.id, job.id);
        assert_eq!(claimed.status, JobStatus::Running);
    }

    #[tokio::test]
    async fn per_owner_concurrency_cap_is_enforced() {
        let db = Database::new();
        let run = db.create_run(new_run(1, 1)).await;
        for tc in ["a", "b", "c"] {
            let (job, _) = db.create_job(new_job(run.id, tc)).await;
            db.flip_created_to_queued(&[job.id]).await;
        }
        assert!(db.claim_next_queued(2).await.is_some());
        assert!(db.claim_next_queued(2).await.is_some());
        // Third job stays queued until a slot frees up
        assert!(db.claim_next_queued(2).await.is_none());
    }

    #[tokio::test]
    async fn cancelled_job_is_not_overwritten() {
        let db = Database::new();
        let run = db.create_run(new_run(1, 1)).await;
        let (job, _) = db.create_job(new_job(run.id, "tc1")).await;
        db.flip_created_to_queued(&[job.id]).await;
        db.claim_next_queued(4).await.unwrap();

        db.update_job(job.id, |j| {
            j.status = JobStatus::Cancelled;
            j.error = Some("cancelled externally".into());
        })
        .await
        .unwrap();

        let after = db
            .finish_job(job.id, JobStatus::Success, Some("done".into()), None)
            .await
            .unwrap();
        assert_eq!(after.status, JobStatus::Cancelled);
        assert_eq!(after.error.as_deref(), Some("cancelled externally"));
        assert!(after.result.is_none());
    }

    #[tokio::test]
    async fn barrier_waits_then_resumes_exactly_once() {
        let db = Database::new();
        let (run, job_ids) = run_with_barrier(&db, &["a", "b", "c"]).await;

        let outcome = db
            .record_barrier_completion(run.id, job_ids[0], Some("A ok".into()), None)
            .await;
        assert!(matches!(
            outcome,
            BarrierOutcome::Waiting { completed: 1, expected: 3 }
        ));

        let outcome = db
            .record_barrier_completion(run.id, job_ids[1], None, Some("boom".into()))
            .await;
        assert!(matches!(outcome, BarrierOutcome::Waiting { completed: 2, .. }));

        let outcome = db
            .record_barrier_completion(run.id, job_ids[2], Some("C ok".into()), None)
            .await;
        let BarrierOutcome::Resume(results) = outcome else {
            panic!("final completion must claim the resume");
        };
        assert_eq!(results.len(), 3);
        let failed = results.iter().find(|r| r.tool_call_id == "b").unwrap();
        assert_eq!(failed.status, BarrierJobStatus::Failed);
        assert_eq!(failed.error.as_deref(), Some("boom"));

        // Barrier is now resuming; further completions are skipped.
        let outcome = db
            .record_barrier_completion(run.id, job_ids[0], Some("again".into()), None)
            .await;
        assert!(matches!(outcome, BarrierOutcome::Skipped(_)));
    }

    #[tokio::test]
    async fn concurrent_completions_trigger_one_resume() {
        for _ in 0..20 {
            let db = Database::new();
            let (run, job_ids) = run_with_barrier(&db, &["a", "b", "c", "d"]).await;

            let mut handles = Vec::new();
            for job_id in job_ids {
                let db = db.clone();
                handles.push(tokio::spawn(async move {
                    db.record_barrier_completion(run.id, job_id, Some("ok".into()), None)
                        .await
                }));
            }
            let mut resumes = 0;
            for handle in handles {
                if matches!(handle.await.unwrap(), BarrierOutcome::Resume(_)) {
                    resumes += 1;
                }
            }
            assert_eq!(resumes, 1);
        }
    }

    #[tokio::test]
    async fn duplicate_completion_for_same_child_is_skipped() {
        let db = Database::new();
        let (run, job_ids) = run_with_barrier(&db, &["a", "b"]).await;

        let first = db
            .record_barrier_completion(run.id, job_ids[0], Some("ok".into()), None)
            .await;
        assert!(matches!(first, BarrierOutcome::Waiting { .. }));
        let dup = db
            .record_barrier_completion(run.id, job_ids[0], Some("ok again".into()), None)
            .await;
        assert!(matches!(dup, BarrierOutcome::Skipped(_)));
    }

    #[tokio::test]
    async fn reset_barrier_prunes_stale_children() {
        let db = Database::new();
        let (run, job_ids) = run_with_barrier(&db, &["a", "b"]).await;
        db.record_barrier_completion(run.id, job_ids[0], Some("ok".into()), None)
            .await;

        let (job_c, _) = db.create_job(new_job(run.id, "c")).await;
        let deadline = Utc::now() + ChronoDuration::minutes(10);
        let barrier = db
            .create_or_reset_barrier(run.id, &[(job_c.id, "c".into())], deadline)
            .await;
        assert_eq!(barrier.expected_count, 1);
        assert_eq!(barrier.completed_count, 0);

        let children = db.barrier_children(run.id).await;
        assert_eq!(children.len(), 1);
        assert_eq!(children[0].tool_call_id, "c");
    }

    #[tokio::test]
    async fn expired_barriers_are_claimed_with_timeouts() {
        let db = Database::new();
        let run = db.create_run(new_run(1, 1)).await;
        let (job_a, _) = db.create_job(new_job(run.id, "a")).await;
        let (job_b, _) = db.create_job(new_job(run.id, "b")).await;
        let past = Utc::now() - ChronoDuration::minutes(1);
        db.create_or_reset_barrier(
            run.id,
            &[(job_a.id, "a".into()), (job_b.id, "b".into())],
            past,
        )
        .await;
        db.record_barrier_completion(run.id, job_a.id, Some("ok".into()), None)
            .await;

        let claimed = db.claim_expired_barriers(Utc::now()).await;
        assert_eq!(claimed.len(), 1);
        let (_, results) = &claimed[0];
        let timed_out = results.iter().find(|r| r.job_id == job_b.id).unwrap();
        assert_eq!(timed_out.status, BarrierJobStatus::Timeout);
        assert!(timed_out.error.as_deref().unwrap().contains("timed out"));

        // Claim is exclusive: a second pass finds nothing.
        assert!(db.claim_expired_barriers(Utc::now()).await.is_empty());
        assert_eq!(
            db.get_barrier(run.id).await.unwrap().status,
            BarrierStatus::Resuming
        );
    }

    #[tokio::test]
    async fn orphaned_created_jobs_are_found() {
        let db = Database::new();
        let run = db.create_run(new_run(1, 1)).await;
        let (orphan, _) = db.create_job(new_job(run.id, "orphan")).await;
        let (covered, _) = db.create_job(new_job(run.id, "covered")).await;
        let deadline = Utc::now() + ChronoDuration::minutes(10);
        db.create_or_reset_barrier(run.id, &[(covered.id, "covered".into())], deadline)
            .await;

        let future_cutoff = Utc::now() + ChronoDuration::minutes(1);
        let orphans = db.orphaned_created_jobs(future_cutoff).await;
        assert_eq!(orphans.len(), 1);
        assert_eq!(orphans[0].id, orphan.id);
    }
}

