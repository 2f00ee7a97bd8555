//! Barrier resume: exactly one batch continuation per barrier instance.

use chrono::Utc;
use foreman_events::{EventEmitter, EventType};
use foreman_react::{AgentProfile, Interrupt, RunContext};
use foreman_store::{BarrierOutcome, NewMessage, RunRecord, WorkerJobRecord, WorkerResult};
use foreman_types::{
    BarrierJobStatus, BarrierStatus, ChatMessage, JobStatus, MessageId, Role, RunId, RunStatus,
    ThreadId, TokenUsage,
};
use serde_json::json;
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::builder::MessageArrayBuilder;
use crate::orchestrator::{OrchError, Orchestrator};
use crate::prompts::build_supervisor_prompt;
use crate::tools::SUPERVISOR_TOOL_NAMES;

impl Orchestrator {
    /// Entry point of the resume fiber scheduled after every worker
    /// termination. Routes through the barrier when the run is waiting,
    /// and through the continuation path when it was deferred.
    pub(crate) async fn resume_after_worker(&self, job: WorkerJobRecord, summary: String) {
        let Some(run) = self.db.get_run(job.run_id).await else {
            return;
        };

        let (result_text, job_error) = worker_result_text(&job, &summary);

        match run.status {
            RunStatus::Waiting => {
                if self.db.get_barrier(run.id).await.is_some() {
                    let outcome = self
                        .db
                        .record_barrier_completion(
                            run.id,
                            job.id,
                            Some(result_text),
                            job_error,
                        )
                        .await;
                    match outcome {
                        BarrierOutcome::Resume(results) => {
                            info!(
                                run_id = %run.id,
                                results = results.len(),
                                "barrier complete, triggering batch resume"
                            );
                            if let Err(err) = self.resume_supervisor_batch(run.id, results).await {
                                error!(run_id = %run.id, %err, "batch resume failed");
                            }
                        }
                        BarrierOutcome::Waiting { completed, expected } => {
                            info!(run_id = %run.id, completed, expected, "barrier waiting");
                        }
                        BarrierOutcome::Skipped(reason) => {
                            debug!(run_id = %run.id, reason, "barrier completion skipped");
                        }
                    }
                } else {
                    // Sequential single-worker path: no barrier, one reply.
                    let single = WorkerResult {
                        tool_call_id: job.tool_call_id.clone(),
                        job_id: job.id,
                        status: match job.status {
                            JobStatus::Success => BarrierJobStatus::Completed,
                            JobStatus::Timeout => BarrierJobStatus::Timeout,
                            _ => BarrierJobStatus::Failed,
                        },
                        result: Some(result_text),
                        error: job_error,
                    };
                    if let Err(err) = self.resume_supervisor_batch(run.id, vec![single]).await {
                        error!(run_id = %run.id, %err, "single-worker resume failed");
                    }
                }
            }
            RunStatus::Deferred => {
                if let Err(err) = self.run_continuation(run.id, &job, &result_text).await {
                    error!(run_id = %run.id, %err, "continuation after deferral failed");
                }
            }
            other => {
                debug!(run_id = %run.id, status = ?other, "nothing to resume");
            }
        }
    }

    /// Resume a waiting run with the full batch of worker results.
    ///
    /// The `waiting → running` gate makes this idempotent: a second
    /// caller (reaper racing a completion) observes `false` and leaves.
    pub async fn resume_supervisor_batch(
        &self,
        run_id: RunId,
        worker_results: Vec<WorkerResult>,
    ) -> Result<(), OrchError> {
        let run = self
            .db
            .get_run(run_id)
            .await
            .ok_or_else(|| OrchError::InvalidState(format!("run {run_id} not found")))?;

        if run.assistant_message_id.is_none() {
            self.db
                .update_run(run_id, |r| {
                    r.assistant_message_id = Some(Uuid::new_v4().to_string());
                })
                .await?;
        }

        if !self
            .db
            .transition_run(run_id, RunStatus::Waiting, RunStatus::Running)
            .await?
        {
            info!(%run_id, "skipping batch resume: run no longer waiting");
            return Ok(());
        }

        let run = self
            .db
            .get_run(run_id)
            .await
            .ok_or_else(|| OrchError::InvalidState(format!("run {run_id} not found")))?;
        let message_id = run.assistant_message_id.clone();

        let _ = self
            .events
            .append_run_event(
                run_id,
                EventType::SupervisorResumed,
                json!({
                    "thread_id": run.thread_id,
                    "owner_id": run.owner_id,
                    "message_id": message_id,
                    "batch_size": worker_results.len(),
                    "trace_id": run.trace_id,
                }),
            )
            .await;

        // Persist one tool reply per worker, grouped under the assistant
        // message that issued the matching tool_call id. Replays are
        // skipped by tool_call_id.
        let existing = self.db.messages_for_thread(run.thread_id).await;
        for wr in &worker_results {
            let already = existing
                .iter()
                .any(|m| m.role == Role::Tool && m.tool_call_id.as_deref() == Some(&wr.tool_call_id));
            if already {
                debug!(tool_call_id = %wr.tool_call_id, "tool reply already persisted");
                continue;
            }
            self.db
                .append_message(NewMessage {
                    tool_call_id: Some(wr.tool_call_id.clone()),
                    name: Some("spawn_worker".into()),
                    processed: true,
                    ..NewMessage::plain(
                        run.thread_id,
                        Role::Tool,
                        worker_tool_message_content(wr),
                    )
                })
                .await;
        }

        // Reconstruct the full history with fresh system context and
        // continue the loop on the same trace.
        let assembled = MessageArrayBuilder::new(self.db.clone())
            .with_system_prompt(build_supervisor_prompt(&format!("owner {}", run.owner_id)))?
            .with_conversation(run.thread_id)
            .await?
            .build()?;
        let assembled_len = assembled.assembled_len;

        let profile = AgentProfile {
            model: run.model.clone(),
            reasoning_effort: run.reasoning_effort.clone(),
        };
        let allowlist: Vec<String> = SUPERVISOR_TOOL_NAMES.iter().map(|s| (*s).to_string()).collect();
        let tools = self.resolver.filter_by_allowlist(Some(&allowlist));
        let emitter = EventEmitter::supervisor(
            self.events.clone(),
            run_id,
            run.owner_id,
            message_id.clone(),
            run.trace_id.clone(),
        );
        let ctx = RunContext::new(emitter, Some(run_id), Some(run.owner_id), run.trace_id.clone());

        let engine_result = self
            .engine
            .run_loop(assembled.messages, &profile, &tools, &ctx)
            .await;

        let react = match engine_result {
            Ok(react) => react,
            Err(err) => {
                self.fail_run(&run, &err.to_string()).await;
                let _ = self.db.set_barrier_status(run_id, BarrierStatus::Failed).await;
                return Ok(());
            }
        };

        self.persist_new_messages(run.thread_id, &react.messages, assembled_len, &react.usage)
            .await;

        if let Some(interrupt) = react.interrupt {
            // Re-interrupt: more workers. Rebuild the barrier in place
            // and park the run again.
            self.commit_spawn_interrupt(&run, &interrupt, &react.usage).await?;
            return Ok(());
        }

        if let Some(critical) = ctx.emitter.critical_error() {
            self.fail_run(&run, &critical).await;
            let _ = self.db.set_barrier_status(run_id, BarrierStatus::Failed).await;
            return Ok(());
        }

        let final_response = react
            .messages
            .iter()
            .rev()
            .find(|m| m.role == Role::Assistant && m.text_content().is_some())
            .and_then(|m| m.text_content().map(str::to_string));

        let finished_at = Utc::now();
        let duration_ms = run
            .started_at
            .map(|s| (finished_at - s).num_milliseconds().max(0))
            .unwrap_or(0);
        self.db
            .update_run(run_id, |r| {
                r.status = RunStatus::Success;
                r.finished_at = Some(finished_at);
                r.duration_ms = Some(duration_ms);
                r.total_tokens += react.usage.total_tokens;
            })
            .await?;
        let _ = self.db.set_barrier_status(run_id, BarrierStatus::Completed).await;

        let _ = self
            .events
            .append_run_event(
                run_id,
                EventType::SupervisorComplete,
                json!({
                    "thread_id": run.thread_id,
                    "result": final_response.as_deref().unwrap_or("(No result)"),
                    "status": "success",
                    "duration_ms": duration_ms,
                    "owner_id": run.owner_id,
                    "message_id": message_id,
                    "usage": usage_payload(&react.usage),
                    "batch_size": worker_results.len(),
                    "trace_id": run.trace_id,
                }),
            )
            .await;
        self.emit_run_updated(&run, "success", Some(duration_ms)).await;

        info!(%run_id, "batch resume completed");
        Ok(())
    }

    /// Commit a spawn interrupt: barrier first, then the `queued` flip,
    /// then the run parks. This ordering is the two-phase commit - a
    /// worker can only run once its barrier row exists.
    pub(crate) async fn commit_spawn_interrupt(
        &self,
        run: &RunRecord,
        interrupt: &Interrupt,
        usage: &TokenUsage,
    ) -> Result<(), OrchError> {
        let Interrupt::WorkersPending { job_ids, created_jobs } = interrupt;

        let children: Vec<(foreman_types::JobId, String)> = created_jobs
            .iter()
            .map(|j| (j.job_id, j.tool_call_id.clone()))
            .collect();
        let deadline = Utc::now()
            + chrono::Duration::from_std(self.settings.barrier_deadline)
                .unwrap_or_else(|_| chrono::Duration::minutes(10));
        self.db
            .create_or_reset_barrier(run.id, &children, deadline)
            .await;
        self.db.flip_created_to_queued(job_ids).await;

        self.db
            .update_run(run.id, |r| {
                r.status = RunStatus::Waiting;
                r.total_tokens += usage.total_tokens;
            })
            .await?;

        for spawned in created_jobs {
            let job = self.db.get_job(spawned.job_id).await;
            let _ = self
                .events
                .append_run_event(
                    run.id,
                    EventType::WorkerSpawned,
                    json!({
                        "job_id": spawned.job_id,
                        "tool_call_id": spawned.tool_call_id,
                        "task": spawned.task_preview,
                        "model": job.as_ref().map(|j| j.model.clone()),
                        "owner_id": run.owner_id,
                        "trace_id": run.trace_id,
                    }),
                )
                .await;
        }

        let _ = self
            .events
            .append_run_event(
                run.id,
                EventType::SupervisorWaiting,
                json!({
                    "thread_id": run.thread_id,
                    "job_ids": job_ids,
                    "message": format!(
                        "Working on {} task(s) in the background...",
                        job_ids.len()
                    ),
                    "owner_id": run.owner_id,
                    "message_id": run.assistant_message_id,
                    "close_stream": false,
                    "trace_id": run.trace_id,
                }),
            )
            .await;
        self.emit_run_updated(run, "waiting", None).await;

        info!(run_id = %run.id, jobs = job_ids.len(), "run parked behind worker barrier");
        Ok(())
    }

    /// Persist the messages the engine appended beyond the assembled
    /// history. Ephemeral system messages are never stored; usage lands
    /// as metadata on the final assistant row.
    pub(crate) async fn persist_new_messages(
        &self,
        thread_id: ThreadId,
        messages: &[ChatMessage],
        assembled_len: usize,
        usage: &TokenUsage,
    ) -> Vec<MessageId> {
        let mut created: Vec<MessageId> = Vec::new();
        let mut last_assistant: Option<MessageId> = None;
        for message in messages.iter().skip(assembled_len) {
            if message.role == Role::System {
                continue;
            }
            let record = self
                .db
                .append_message(NewMessage {
                    tool_calls: message.tool_calls.clone(),
                    tool_call_id: message.tool_call_id.clone(),
                    name: message.name.clone(),
                    processed: true,
                    ..NewMessage::plain(thread_id, message.role, message.content.clone())
                })
                .await;
            if record.role == Role::Assistant {
                last_assistant = Some(record.id);
            }
            created.push(record.id);
        }

        if !usage.is_empty() {
            if let Some(id) = last_assistant {
                let _ = self
                    .db
                    .set_message_metadata(id, json!({"usage": usage_payload(usage)}))
                    .await;
            }
        }
        created
    }

    pub(crate) async fn fail_run(&self, run: &RunRecord, error: &str) {
        let finished_at = Utc::now();
        let duration_ms = run
            .started_at
            .map(|s| (finished_at - s).num_milliseconds().max(0))
            .unwrap_or(0);
        let _ = self
            .db
            .update_run(run.id, |r| {
                r.status = RunStatus::Failed;
                r.error = Some(error.to_string());
                r.finished_at = Some(finished_at);
                r.duration_ms = Some(duration_ms);
            })
            .await;

        let _ = self
            .events
            .append_run_event(
                run.id,
                EventType::Error,
                json!({
                    "thread_id": run.thread_id,
                    "message": error,
                    "status": "error",
                    "owner_id": run.owner_id,
                    "trace_id": run.trace_id,
                }),
            )
            .await;
        self.emit_run_updated(run, "failed", Some(duration_ms)).await;
        error!(run_id = %run.id, error, "run failed");
    }

    pub(crate) async fn emit_run_updated(
        &self,
        run: &RunRecord,
        status: &str,
        duration_ms: Option<i64>,
    ) {
        let _ = self
            .events
            .append_run_event(
                run.id,
                EventType::RunUpdated,
                json!({
                    "status": status,
                    "thread_id": run.thread_id,
                    "owner_id": run.owner_id,
                    "duration_ms": duration_ms,
                }),
            )
            .await;
    }
}

/// The text carried into the barrier for one worker.
fn worker_result_text(job: &WorkerJobRecord, summary: &str) -> (String, Option<String>) {
    match job.status {
        JobStatus::Success => {
            let text = if summary.is_empty() {
                job.result
                    .clone()
                    .unwrap_or_else(|| "(No result summary)".into())
            } else {
                summary.to_string()
            };
            (text, None)
        }
        _ => {
            let error = job
                .error
                .clone()
                .unwrap_or_else(|| "Unknown error".into());
            (job.result.clone().unwrap_or_default(), Some(error))
        }
    }
}

/// The tool-message body for one worker result.
fn worker_tool_message_content(wr: &WorkerResult) -> String {
    match wr.status {
        BarrierJobStatus::Completed => {
            format!(
                "Worker completed:\n\n{}",
                wr.result.as_deref().unwrap_or("(No result)")
            )
        }
        _ => format!(
            "Worker failed:\n\nError: {}\n\nPartial result: {}",
            wr.error.as_deref().unwrap_or("Unknown error"),
            wr.result.as_deref().unwrap_or("")
        ),
    }
}

fn usage_payload(usage: &TokenUsage) -> serde_json::Value {
    json!({
        "prompt_tokens": usage.prompt_tokens,
        "completion_tokens": usage.completion_tokens,
        "total_tokens": usage.total_tokens,
        "reasoning_tokens": usage.reasoning_tokens,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn worker_result(status: BarrierJobStatus) -> WorkerResult {
        WorkerResult {
            tool_call_id: "tc1".into(),
            job_id: foreman_types::JobId::new(1),
            status,
            result: Some("partial".into()),
            error: Some("boom".into()),
        }
    }

    #[test]
    fn completed_and_failed_message_bodies() {
        let completed = worker_tool_message_content(&WorkerResult {
            error: None,
            ..worker_result(BarrierJobStatus::Completed)
        });
        assert_eq!(completed, "Worker completed:\n\npartial");

        let failed = worker_tool_message_content(&worker_result(BarrierJobStatus::Failed));
        assert_eq!(failed, "Worker failed:\n\nError: boom\n\nPartial result: partial");

        let timeout = worker_tool_message_content(&worker_result(BarrierJobStatus::Timeout));
        assert!(timeout.starts_with("Worker failed:"));
    }
}
