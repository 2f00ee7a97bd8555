//! Two-phase commit for spawn-worker calls.
//!
//! Phase 1 (here): every spawn call opens a worker-job row in the
//! `created` holding state, keyed `(run_id, tool_call_id)` for
//! idempotency. Phase 2 belongs to the orchestrator: it builds the
//! barrier, flips the jobs to `queued`, and parks the run - all in one
//! commit, so no worker can finish before its barrier is observable.

use std::time::Instant;

use foreman_tool::envelope::safe_preview;
use foreman_types::{ChatMessage, JobId, JobStatus, ToolCall};
use serde_json::{Value, json};
use tracing::info;

use crate::context::{AgentProfile, RunContext};
use crate::engine::{EngineError, ReactEngine};
use foreman_store::NewJob;

/// The spawn tool's name. The engine intercepts calls to it by name;
/// the registry entry only supplies the schema shown to the model.
pub const SPAWN_TOOL_NAME: &str = "spawn_worker";

/// One job opened by a spawn batch, carried on the interrupt for the
/// orchestrator's barrier commit.
#[derive(Debug, Clone)]
pub struct SpawnedJob {
    /// The job row, still in `created`.
    pub job_id: JobId,
    /// The spawn call that opened it.
    pub tool_call_id: String,
    /// Short task preview for events and logs.
    pub task_preview: String,
}

/// A designed early return from the loop: the run must pause until
/// external work completes.
#[derive(Debug, Clone)]
pub enum Interrupt {
    /// One or more workers were opened and await the barrier commit.
    WorkersPending {
        /// Jobs to flip to `queued` after the barrier exists.
        job_ids: Vec<JobId>,
        /// Per-job detail for barrier children and `worker_spawned`
        /// events.
        created_jobs: Vec<SpawnedJob>,
    },
}

/// Handle the spawn calls of one batch. Returns the indexed tool
/// messages plus the interrupt when new jobs await the barrier commit.
pub(crate) async fn handle_spawn_calls(
    engine: &ReactEngine,
    calls: &[(usize, ToolCall)],
    profile: &AgentProfile,
    ctx: &RunContext,
) -> Result<(Vec<(usize, ChatMessage)>, Option<Interrupt>), EngineError> {
    let mut messages: Vec<(usize, ChatMessage)> = Vec::with_capacity(calls.len());

    let (Some(run_id), Some(owner_id)) = (ctx.run_id, ctx.owner_id) else {
        for (index, call) in calls {
            messages.push((
                *index,
                ChatMessage::tool(
                    "<tool-error> Cannot spawn worker - no run context",
                    &call.id,
                    SPAWN_TOOL_NAME,
                ),
            ));
        }
        return Ok((messages, None));
    };

    let mut created_jobs: Vec<SpawnedJob> = Vec::new();

    for (index, call) in calls {
        let started = Instant::now();
        let task = call
            .args
            .get("task")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let task_preview = safe_preview(&task, 100);
        let model_override = call.args.get("model").and_then(Value::as_str);
        let config = build_job_config(&call.args);

        ctx.emitter
            .emit_tool_started(SPAWN_TOOL_NAME, &call.id, &call.args)
            .await;

        let (job, created_new) = engine
            .db
            .create_job(NewJob {
                owner_id,
                run_id,
                tool_call_id: call.id.clone(),
                trace_id: ctx.trace_id.clone(),
                task: task.clone(),
                model: model_override.unwrap_or(&profile.model).to_string(),
                reasoning_effort: profile.reasoning_effort.clone(),
                config,
            })
            .await;
        let duration_ms = started.elapsed().as_millis() as i64;

        match job.status {
            // Replayed spawn against a finished worker: synthesize the
            // cached result inline, no new job, no barrier entry.
            JobStatus::Success => {
                let cached = cached_result(engine, &job).await;
                ctx.emitter
                    .emit_tool_completed(
                        SPAWN_TOOL_NAME,
                        &call.id,
                        duration_ms,
                        &format!("Cached result for job {}", job.id),
                    )
                    .await;
                messages.push((
                    *index,
                    ChatMessage::tool(
                        format!("Worker job {} completed:\n\n{cached}", job.id),
                        &call.id,
                        SPAWN_TOOL_NAME,
                    ),
                ));
            }
            JobStatus::Failed | JobStatus::Cancelled | JobStatus::Timeout => {
                let error = job.error.as_deref().unwrap_or("Unknown error");
                ctx.emitter
                    .emit_tool_completed(
                        SPAWN_TOOL_NAME,
                        &call.id,
                        duration_ms,
                        &format!("Job {} already {}", job.id, status_name(job.status)),
                    )
                    .await;
                messages.push((
                    *index,
                    ChatMessage::tool(
                        format!("Worker job {} failed:\n\nError: {error}", job.id),
                        &call.id,
                        SPAWN_TOOL_NAME,
                    ),
                ));
            }
            // New row, or an in-flight one we can re-attach to. No tool
            // reply yet: the real reply is the worker result the batch
            // resume injects under this tool_call_id. An acknowledgement
            // here would shadow it.
            JobStatus::Created | JobStatus::Queued | JobStatus::Running => {
                let preview = if created_new {
                    format!("Created job {}", job.id)
                } else {
                    format!("Reusing existing job {}", job.id)
                };
                info!(job_id = %job.id, status = ?job.status, created_new, "spawn call opened job");
                ctx.emitter
                    .emit_tool_completed(SPAWN_TOOL_NAME, &call.id, duration_ms, &preview)
                    .await;
                created_jobs.push(SpawnedJob {
                    job_id: job.id,
                    tool_call_id: call.id.clone(),
                    task_preview: task_preview.clone(),
                });
            }
        }
    }

    if created_jobs.is_empty() {
        return Ok((messages, None));
    }

    info!(
        count = created_jobs.len(),
        %run_id,
        "spawn batch interrupting for barrier creation"
    );
    let interrupt = Interrupt::WorkersPending {
        job_ids: created_jobs.iter().map(|j| j.job_id).collect(),
        created_jobs,
    };
    Ok((messages, Some(interrupt)))
}

/// Workspace + resume hints from the spawn arguments.
fn build_job_config(args: &Value) -> Option<Value> {
    let git_repo = args.get("git_repo").and_then(Value::as_str);
    let resume_session_id = args.get("resume_session_id").and_then(Value::as_str);
    match (git_repo, resume_session_id) {
        (Some(repo), Some(session)) => Some(json!({
            "execution_mode": "workspace",
            "git_repo": repo,
            "resume_session_id": session,
        })),
        (Some(repo), None) => Some(json!({
            "execution_mode": "workspace",
            "git_repo": repo,
        })),
        (None, Some(session)) => Some(json!({"resume_session_id": session})),
        (None, None) => None,
    }
}

/// The best available cached result for a finished job: the compressed
/// summary when present, else the stored result, else the job row's.
async fn cached_result(engine: &ReactEngine, job: &foreman_store::WorkerJobRecord) -> String {
    if let Some(worker_id) = &job.worker_id {
        if let Ok(metadata) = engine.artifacts.worker_metadata(worker_id).await {
            if let Some(summary) = metadata.summary {
                return summary;
            }
        }
        if let Ok(result) = engine.artifacts.worker_result(worker_id).await {
            return result;
        }
    }
    job.result.clone().unwrap_or_else(|| "(result unavailable)".into())
}

fn status_name(status: JobStatus) -> &'static str {
    match status {
        JobStatus::Created => "created",
        JobStatus::Queued => "queued",
        JobStatus::Running => "running",
        JobStatus::Success => "success",
        JobStatus::Failed => "failed",
        JobStatus::Cancelled => "cancelled",
        JobStatus::Timeout => "timeout",
    }
}
