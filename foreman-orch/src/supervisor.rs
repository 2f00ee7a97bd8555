//! The supervisor service: one long-lived brain per owner.

use std::time::Duration;

use chrono::{Duration as ChronoDuration, Utc};
use foreman_events::{EventEmitter, EventType};
use foreman_react::{AgentProfile, RunContext};
use foreman_store::{NewMessage, NewRun, RunRecord, StoreError, WorkerJobRecord};
use foreman_tool::envelope::safe_preview;
use foreman_types::{
    ChatMessage, MessageId, OwnerId, Role, RunId, RunStatus, RunTrigger, ThreadId, ThreadKind,
    TraceId,
};
use serde_json::json;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::builder::MessageArrayBuilder;
use crate::orchestrator::{OrchError, Orchestrator};
use crate::prompts::{RECENT_WORKER_CONTEXT_MARKER, build_supervisor_prompt};
use crate::tools::SUPERVISOR_TOOL_NAMES;

/// Recent workers shown in the injected context.
const RECENT_WORKER_HISTORY_LIMIT: usize = 5;
/// Lookback window for the injected context.
const RECENT_WORKER_HISTORY_MINUTES: i64 = 10;
/// A context message younger than this many seconds survives cleanup,
/// protecting a concurrent request that just injected it.
const CONTEXT_PROTECT_SECONDS: i64 = 5;
/// Timeout for continuation turns; the result is already available, the
/// model only synthesizes.
const CONTINUATION_TIMEOUT: Duration = Duration::from_secs(120);

/// Options for one supervisor turn.
#[derive(Debug, Clone, Default)]
pub struct SupervisorRunOptions {
    /// Reuse an existing run row instead of creating one.
    pub run_id: Option<RunId>,
    /// Turn timeout override; defaults to the settings value.
    pub timeout: Option<Duration>,
    /// Model override for this turn.
    pub model_override: Option<String>,
    /// Reasoning effort override.
    pub reasoning_effort: Option<String>,
    /// When false, a deferred turn is awaited to completion in-line
    /// instead of in a background task.
    pub detach_on_deferred: bool,
}

impl SupervisorRunOptions {
    /// The defaults used by the chat surface: detach when deferred.
    #[must_use]
    pub fn detached() -> Self {
        Self {
            detach_on_deferred: true,
            ..Self::default()
        }
    }
}

/// Result of one supervisor turn.
#[derive(Debug, Clone)]
pub struct SupervisorRunResult {
    /// The run.
    pub run_id: RunId,
    /// The supervisor thread.
    pub thread_id: ThreadId,
    /// Run status when this result was produced.
    pub status: RunStatus,
    /// Final (or intermediate, for deferrals) response text.
    pub result: Option<String>,
    /// Error text on failure.
    pub error: Option<String>,
    /// Wall-clock duration in milliseconds.
    pub duration_ms: i64,
    /// Dashboard deep link.
    pub debug_url: String,
}

impl Orchestrator {
    /// The owner's supervisor thread, created on first use.
    pub async fn supervisor_thread(&self, owner_id: OwnerId) -> foreman_store::ThreadRecord {
        match self.db.find_thread(owner_id, ThreadKind::Super).await {
            Some(thread) => thread,
            None => {
                info!(%owner_id, "creating supervisor thread");
                self.db
                    .create_thread(owner_id, ThreadKind::Super, "Supervisor")
                    .await
            }
        }
    }

    /// Run the supervisor with a user task.
    ///
    /// The timeout stops waiting, not working: on deadline the run is
    /// marked deferred and the engine task keeps going; its eventual
    /// completion finalizes the run in the background.
    pub async fn run_supervisor(
        &self,
        owner_id: OwnerId,
        task: &str,
        opts: SupervisorRunOptions,
    ) -> Result<SupervisorRunResult, OrchError> {
        let thread = self.supervisor_thread(owner_id).await;

        let run = match opts.run_id {
            Some(run_id) => {
                let run = self
                    .db
                    .get_run(run_id)
                    .await
                    .ok_or_else(|| OrchError::InvalidState(format!("run {run_id} not found")))?;
                if run.started_at.is_none() {
                    self.db
                        .update_run(run_id, |r| r.started_at = Some(Utc::now()))
                        .await?
                } else {
                    run
                }
            }
            None => {
                self.db
                    .create_run(NewRun {
                        owner_id,
                        thread_id: thread.id,
                        trigger: RunTrigger::Api,
                        model: opts
                            .model_override
                            .clone()
                            .unwrap_or_else(|| self.default_model.clone()),
                        reasoning_effort: opts.reasoning_effort.clone(),
                        trace_id: Some(TraceId::new(Uuid::new_v4().to_string())),
                    })
                    .await
            }
        };
        let run_id = run.id;
        info!(%run_id, %owner_id, task = %safe_preview(task, 50), "starting supervisor run");

        // Stable assistant id for every event emitted on this run.
        let message_id = Uuid::new_v4().to_string();
        let run = self
            .db
            .update_run(run_id, |r| {
                r.assistant_message_id = Some(message_id.clone());
            })
            .await?;

        // Continuations render as a new bubble: the event carries the
        // original run's message id while the trace stays stable.
        let is_continuation = run.continuation_of_run_id.is_some();
        let continuation_of_message_id = match run.continuation_of_run_id {
            Some(original_id) => Some(
                self.db
                    .get_run(original_id)
                    .await
                    .and_then(|original| original.assistant_message_id)
                    .unwrap_or_else(|| Uuid::new_v4().to_string()),
            ),
            None => None,
        };

        let mut started_payload = json!({
            "thread_id": thread.id,
            "task": task,
            "owner_id": owner_id,
            "message_id": message_id,
            "trace_id": run.trace_id,
        });
        if let Some(continuation_id) = &continuation_of_message_id {
            started_payload["continuation_of_message_id"] = json!(continuation_id);
        }
        let _ = self
            .events
            .append_run_event(run_id, EventType::SupervisorStarted, started_payload)
            .await;

        // Refresh the recent-worker context: drop stale copies, inject a
        // fresh listing so the supervisor sees work it already did.
        self.cleanup_stale_worker_context(thread.id).await;
        let recent_context = self.build_recent_worker_context(owner_id).await;
        if let Some(context) = &recent_context {
            debug!(%owner_id, "injecting recent worker context");
            self.db
                .append_message(NewMessage {
                    processed: true,
                    ..NewMessage::plain(thread.id, Role::System, context.clone())
                })
                .await;
        }

        // Continuation prompts are orchestration plumbing, hidden from
        // the UI but visible to the model.
        self.db
            .append_message(NewMessage {
                internal: is_continuation,
                ..NewMessage::plain(thread.id, Role::User, task.to_string())
            })
            .await;

        let _ = self
            .events
            .append_run_event(
                run_id,
                EventType::SupervisorThinking,
                json!({"message": "Analyzing your request...", "owner_id": owner_id}),
            )
            .await;

        let mut builder = MessageArrayBuilder::new(self.db.clone())
            .with_system_prompt(build_supervisor_prompt(&format!("owner {owner_id}")))?
            .with_conversation(thread.id)
            .await?;
        if let Some(context) = recent_context {
            builder = builder.with_dynamic_context(vec![ChatMessage::system(context)])?;
        }
        let assembled = builder.build()?;
        let assembled_len = assembled.assembled_len;

        let unprocessed: Vec<MessageId> = self
            .db
            .unprocessed_messages(thread.id)
            .await
            .iter()
            .map(|m| m.id)
            .collect();

        let profile = AgentProfile {
            model: run.model.clone(),
            reasoning_effort: run.reasoning_effort.clone(),
        };
        let allowlist: Vec<String> = SUPERVISOR_TOOL_NAMES.iter().map(|s| (*s).to_string()).collect();
        let tools = self.resolver.filter_by_allowlist(Some(&allowlist));
        let emitter = EventEmitter::supervisor(
            self.events.clone(),
            run_id,
            owner_id,
            Some(message_id.clone()),
            run.trace_id.clone(),
        );
        let ctx = RunContext::new(emitter, Some(run_id), Some(owner_id), run.trace_id.clone());

        // The engine runs as its own task so a timeout stops our wait
        // without cancelling the work.
        let engine = self.engine.clone();
        let engine_ctx = ctx.clone();
        let messages = assembled.messages;
        let mut engine_task = tokio::spawn(async move {
            engine
                .run_loop(messages, &profile, &tools, &engine_ctx)
                .await
        });

        let timeout = opts.timeout.unwrap_or(self.settings.run_timeout);
        match tokio::time::timeout(timeout, &mut engine_task).await {
            Ok(joined) => {
                let engine_result = joined
                    .map_err(|e| OrchError::InvalidState(format!("engine task panicked: {e}")))
                    .and_then(|r| r.map_err(OrchError::Engine));
                self.finalize_supervisor_turn(
                    run_id,
                    thread.id,
                    &message_id,
                    engine_result,
                    assembled_len,
                    &unprocessed,
                    &ctx,
                )
                .await
            }
            Err(_) => {
                // Deadline: defer the run, keep the task alive.
                let run = self
                    .db
                    .get_run(run_id)
                    .await
                    .ok_or_else(|| OrchError::InvalidState(format!("run {run_id} lost")))?;
                let duration_ms = elapsed_ms(&run);
                self.db
                    .update_run(run_id, |r| {
                        r.status = RunStatus::Deferred;
                        r.duration_ms = Some(duration_ms);
                    })
                    .await?;
                let _ = self
                    .events
                    .append_run_event(
                        run_id,
                        EventType::SupervisorDeferred,
                        json!({
                            "thread_id": thread.id,
                            "message": "Still working on this in the background. I'll continue when ready.",
                            "timeout_seconds": timeout.as_secs(),
                            "attach_url": format!("/api/runs/{run_id}/stream"),
                            "owner_id": owner_id,
                            "message_id": message_id,
                        }),
                    )
                    .await;
                self.emit_run_updated(&run, "deferred", Some(duration_ms)).await;
                info!(%run_id, timeout_secs = timeout.as_secs(), "run deferred; engine continues in background");

                if opts.detach_on_deferred {
                    let orch = self.clone();
                    let thread_id = thread.id;
                    let message_id_bg = message_id.clone();
                    let ctx_bg = ctx.clone();
                    let unprocessed_bg = unprocessed.clone();
                    tokio::spawn(async move {
                        let engine_result = engine_task
                            .await
                            .map_err(|e| {
                                OrchError::InvalidState(format!("engine task panicked: {e}"))
                            })
                            .and_then(|r| r.map_err(OrchError::Engine));
                        if let Err(err) = orch
                            .finalize_supervisor_turn(
                                run_id,
                                thread_id,
                                &message_id_bg,
                                engine_result,
                                assembled_len,
                                &unprocessed_bg,
                                &ctx_bg,
                            )
                            .await
                        {
                            warn!(%run_id, %err, "deferred finalization failed");
                        }
                    });
                    return Ok(SupervisorRunResult {
                        run_id,
                        thread_id: thread.id,
                        status: RunStatus::Deferred,
                        result: Some(
                            "Still working on this in the background. I'll let you know when it's done."
                                .into(),
                        ),
                        error: None,
                        duration_ms,
                        debug_url: format!("/supervisor/{run_id}"),
                    });
                }

                // Background mode: keep awaiting the work to completion.
                let engine_result = engine_task
                    .await
                    .map_err(|e| OrchError::InvalidState(format!("engine task panicked: {e}")))
                    .and_then(|r| r.map_err(OrchError::Engine));
                self.finalize_supervisor_turn(
                    run_id,
                    thread.id,
                    &message_id,
                    engine_result,
                    assembled_len,
                    &unprocessed,
                    &ctx,
                )
                .await
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn finalize_supervisor_turn(
        &self,
        run_id: RunId,
        thread_id: ThreadId,
        message_id: &str,
        engine_result: Result<foreman_react::ReactResult, OrchError>,
        assembled_len: usize,
        unprocessed: &[MessageId],
        ctx: &RunContext,
    ) -> Result<SupervisorRunResult, OrchError> {
        let run = self
            .db
            .get_run(run_id)
            .await
            .ok_or_else(|| OrchError::InvalidState(format!("run {run_id} not found")))?;

        let react = match engine_result {
            Ok(react) => react,
            Err(err) => {
                self.fail_run(&run, &err.to_string()).await;
                return Ok(self.result_for(&run, RunStatus::Failed, None, Some(err.to_string())));
            }
        };

        self.persist_new_messages(thread_id, &react.messages, assembled_len, &react.usage)
            .await;
        self.db.mark_processed(unprocessed).await;

        if let Some(interrupt) = react.interrupt {
            self.commit_spawn_interrupt(&run, &interrupt, &react.usage).await?;
            return Ok(self.result_for(
                &run,
                RunStatus::Waiting,
                Some("Working on this in the background...".into()),
                None,
            ));
        }

        if let Some(critical) = ctx.emitter.critical_error() {
            self.fail_run(&run, &critical).await;
            return Ok(self.result_for(&run, RunStatus::Failed, None, Some(critical)));
        }

        let final_response = react
            .messages
            .iter()
            .rev()
            .find(|m| m.role == Role::Assistant && m.text_content().is_some())
            .and_then(|m| m.text_content().map(str::to_string));
        let duration_ms = elapsed_ms(&run);

        // Acknowledgement turn: the model answered but workers it spawned
        // this turn are still out. Defer instead of closing the response,
        // so the continuation can deliver the synthesis.
        let outstanding = self
            .db
            .jobs_for_run(run_id)
            .await
            .iter()
            .any(|j| !j.status.is_terminal());
        if outstanding {
            self.db
                .update_run(run_id, |r| {
                    r.status = RunStatus::Deferred;
                    r.duration_ms = Some(duration_ms);
                    r.summary = final_response.as_deref().map(|t| safe_preview(t, 500));
                })
                .await?;
            let _ = self
                .events
                .append_run_event(
                    run_id,
                    EventType::SupervisorDeferred,
                    json!({
                        "thread_id": thread_id,
                        "message": final_response
                            .as_deref()
                            .unwrap_or("Delegating this to a worker now. I'll report back when it finishes."),
                        "reason": "waiting_for_worker",
                        "close_stream": false,
                        "owner_id": run.owner_id,
                        "message_id": message_id,
                    }),
                )
                .await;
            self.emit_run_updated(&run, "deferred", Some(duration_ms)).await;
            info!(%run_id, "acknowledgement turn deferred until workers complete");
            return Ok(self.result_for(&run, RunStatus::Deferred, final_response, None));
        }

        let finished_at = Utc::now();
        self.db
            .update_run(run_id, |r| {
                r.status = RunStatus::Success;
                r.finished_at = Some(finished_at);
                r.duration_ms = Some(duration_ms);
                r.total_tokens += react.usage.total_tokens;
            })
            .await?;
        let _ = self
            .events
            .append_run_event(
                run_id,
                EventType::SupervisorComplete,
                json!({
                    "thread_id": thread_id,
                    "result": final_response.as_deref().unwrap_or("(No result)"),
                    "status": "success",
                    "duration_ms": duration_ms,
                    "debug_url": format!("/supervisor/{run_id}"),
                    "owner_id": run.owner_id,
                    "message_id": message_id,
                    "usage": {
                        "prompt_tokens": react.usage.prompt_tokens,
                        "completion_tokens": react.usage.completion_tokens,
                        "total_tokens": react.usage.total_tokens,
                        "reasoning_tokens": react.usage.reasoning_tokens,
                    },
                }),
            )
            .await;
        self.emit_run_updated(&run, "success", Some(duration_ms)).await;
        info!(%run_id, duration_ms, "supervisor run completed");

        Ok(self.result_for(&run, RunStatus::Success, final_response, None))
    }

    /// Continue a deferred run after a worker completes.
    ///
    /// Idempotent and race-safe: the unique constraint on the
    /// continuation link is the authoritative dedup, so concurrent
    /// callers converge on one continuation run.
    pub async fn run_continuation(
        &self,
        original_run_id: RunId,
        job: &WorkerJobRecord,
        result_summary: &str,
    ) -> Result<SupervisorRunResult, OrchError> {
        // Fast path: someone already continued this run.
        if let Some(existing) = self.db.find_continuation_of(original_run_id).await {
            return Ok(self.result_for(
                &existing,
                existing.status,
                Some(format!("Continuation already exists (run {})", existing.id)),
                None,
            ));
        }

        let original = self
            .db
            .get_run(original_run_id)
            .await
            .ok_or_else(|| {
                OrchError::InvalidState(format!("original run {original_run_id} not found"))
            })?;
        if original.status != RunStatus::Deferred {
            return Err(OrchError::InvalidState(format!(
                "run {original_run_id} is {:?}, not deferred",
                original.status
            )));
        }

        let continuation = match self
            .db
            .create_continuation_run(original_run_id, original.trace_id.clone())
            .await
        {
            Ok(run) => run,
            Err(StoreError::Conflict(_)) => {
                let existing = self
                    .db
                    .find_continuation_of(original_run_id)
                    .await
                    .ok_or_else(|| {
                        OrchError::InvalidState("continuation conflict without row".into())
                    })?;
                return Ok(self.result_for(
                    &existing,
                    existing.status,
                    Some(format!("Continuation already exists (run {})", existing.id)),
                    None,
                ));
            }
            Err(err) => return Err(err.into()),
        };
        info!(
            original_run = %original_run_id,
            continuation_run = %continuation.id,
            job_id = %job.id,
            "starting continuation"
        );

        // Inject the worker result as a tool reply. When the spawn call
        // cannot be located the store downgrades this to an internal
        // user-role notification, keeping the thread valid.
        let worker_label = job
            .worker_id
            .as_ref()
            .map_or_else(|| "unknown".to_string(), ToString::to_string);
        self.db
            .append_message(NewMessage {
                tool_call_id: Some(job.tool_call_id.clone()),
                name: Some("spawn_worker".into()),
                processed: true,
                ..NewMessage::plain(
                    original.thread_id,
                    Role::Tool,
                    format!(
                        "[Worker job {} completed]\n\nWorker ID: {worker_label}\nResult:\n{result_summary}",
                        job.id
                    ),
                )
            })
            .await;

        self.run_supervisor(
            original.owner_id,
            "[CONTINUATION] Process the worker result above and provide the final answer \
             to the user's original request.",
            SupervisorRunOptions {
                run_id: Some(continuation.id),
                timeout: Some(CONTINUATION_TIMEOUT),
                model_override: Some(original.model.clone()),
                reasoning_effort: original.reasoning_effort.clone(),
                detach_on_deferred: false,
            },
        )
        .await
    }

    /// Delete stale recent-worker context messages, keeping the newest
    /// only when it is fresh enough to belong to a concurrent request.
    pub(crate) async fn cleanup_stale_worker_context(&self, thread_id: ThreadId) -> usize {
        let marked = self
            .db
            .system_messages_with_marker(thread_id, RECENT_WORKER_CONTEXT_MARKER)
            .await;
        if marked.is_empty() {
            return 0;
        }

        let cutoff = Utc::now() - ChronoDuration::seconds(CONTEXT_PROTECT_SECONDS);
        let doomed: Vec<MessageId> = if marked[0].sent_at >= cutoff {
            marked.iter().skip(1).map(|m| m.id).collect()
        } else {
            marked.iter().map(|m| m.id).collect()
        };
        let count = doomed.len();
        if count > 0 {
            self.db.delete_messages(&doomed).await;
            debug!(%thread_id, count, "cleaned up stale worker context");
        }
        count
    }

    /// Compact marker-tagged listing of the owner's recent workers, so
    /// the supervisor checks existing results before spawning duplicates.
    pub(crate) async fn build_recent_worker_context(&self, owner_id: OwnerId) -> Option<String> {
        let cutoff = Utc::now() - ChronoDuration::minutes(RECENT_WORKER_HISTORY_MINUTES);
        let jobs = self
            .db
            .recent_jobs_for_owner(owner_id, cutoff, RECENT_WORKER_HISTORY_LIMIT)
            .await;
        if jobs.is_empty() {
            return None;
        }

        let mut lines = vec![
            RECENT_WORKER_CONTEXT_MARKER.to_string(),
            "## Recent Worker Activity (last 10 minutes)".to_string(),
            "Check if any of these results already answer the user's question before spawning new workers:\n"
                .to_string(),
        ];
        for job in &jobs {
            let elapsed = Utc::now() - job.created_at;
            let elapsed_str = if elapsed.num_seconds() >= 60 {
                format!("{}m ago", elapsed.num_minutes())
            } else {
                format!("{}s ago", elapsed.num_seconds().max(0))
            };

            let summary = match &job.worker_id {
                Some(worker_id) if job.status.is_terminal() => self
                    .artifacts
                    .worker_metadata(worker_id)
                    .await
                    .ok()
                    .and_then(|m| m.summary),
                _ => None,
            }
            .unwrap_or_else(|| safe_preview(&job.task, 100));

            lines.push(format!(
                "- Job {} [{:?}] ({elapsed_str})\n  {summary}\n",
                job.id, job.status
            ));
        }
        lines.push("Use read_worker_result(job_id) to get full details from any of these.".into());
        Some(lines.join("\n"))
    }

    fn result_for(
        &self,
        run: &RunRecord,
        status: RunStatus,
        result: Option<String>,
        error: Option<String>,
    ) -> SupervisorRunResult {
        SupervisorRunResult {
            run_id: run.id,
            thread_id: run.thread_id,
            status,
            result,
            error,
            duration_ms: elapsed_ms(run),
            debug_url: format!("/supervisor/{}", run.id),
        }
    }
}

fn elapsed_ms(run: &RunRecord) -> i64 {
    run.started_at
        .map(|s| (Utc::now() - s).num_milliseconds().max(0))
        .unwrap_or(0)
}
