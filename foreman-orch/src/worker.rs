//! The worker runner: one disposable agent, fully persisted.

use std::time::Instant;

use chrono::Utc;
use foreman_events::{EventEmitter, EventType};
use foreman_provider::CompletionRequest;
use foreman_react::{AgentProfile, RunContext};
use foreman_store::{NewMessage, WorkerJobRecord};
use foreman_tool::envelope::safe_preview;
use foreman_types::{ChatMessage, JobStatus, Role, ThreadKind, WorkerId};
use serde_json::{Value, json};
use tracing::{info, warn};
use uuid::Uuid;

use crate::orchestrator::Orchestrator;
use crate::prompts::build_worker_prompt;
use crate::tools::WORKER_TOOL_NAMES;

/// Summary length cap, in characters.
const SUMMARY_MAX_CHARS: usize = 150;
/// Hard timeout on the summary-extraction LLM call.
const SUMMARY_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(5);
const SUMMARY_VERSION: u32 = 1;

/// Outcome of one worker execution, before job-row reconciliation.
#[derive(Debug, Clone)]
pub struct WorkerRunOutcome {
    /// The bundle the worker wrote.
    pub worker_id: WorkerId,
    /// `Success` or `Failed`.
    pub status: JobStatus,
    /// Full result text.
    pub result: String,
    /// Compressed summary (empty when unavailable).
    pub summary: String,
    /// Error message on failure.
    pub error: Option<String>,
    /// Wall-clock duration in milliseconds.
    pub duration_ms: i64,
}

impl Orchestrator {
    /// Execute one claimed job as a disposable worker.
    ///
    /// Persists the artifact bundle, extracts result and summary, emits
    /// the worker lifecycle events, and returns the outcome. Job-row
    /// reconciliation and the resume fiber belong to the caller.
    pub async fn run_worker_job(&self, job: &WorkerJobRecord) -> WorkerRunOutcome {
        let started = Instant::now();
        let task_preview = safe_preview(&job.task, 100);

        let bundle_config = json!({
            "model": job.model,
            "reasoning_effort": job.reasoning_effort,
            "owner_id": job.owner_id,
            "job_config": job.config,
        });
        let worker_id = match self.artifacts.create_worker(&job.task, &bundle_config).await {
            Ok(worker_id) => worker_id,
            Err(err) => {
                warn!(job_id = %job.id, %err, "failed to create worker bundle");
                return WorkerRunOutcome {
                    worker_id: WorkerId::new(format!("worker-{}", Uuid::new_v4().simple())),
                    status: JobStatus::Failed,
                    result: String::new(),
                    summary: String::new(),
                    error: Some(format!("artifact bundle creation failed: {err}")),
                    duration_ms: started.elapsed().as_millis() as i64,
                };
            }
        };
        if let Err(err) = self
            .db
            .update_job(job.id, |j| j.worker_id = Some(worker_id.clone()))
            .await
        {
            warn!(job_id = %job.id, %err, "failed to record worker id on job");
        }

        let emitter = EventEmitter::worker(
            self.events.clone(),
            Some(job.run_id),
            Some(job.owner_id),
            Some(job.id),
            worker_id.clone(),
            job.trace_id.clone(),
        );
        let ctx = RunContext::new(
            emitter,
            Some(job.run_id),
            Some(job.owner_id),
            job.trace_id.clone(),
        );

        if let Err(err) = self.artifacts.start_worker(&worker_id).await {
            warn!(%worker_id, %err, "failed to mark bundle running");
        }
        let _ = self
            .events
            .append_run_event(
                job.run_id,
                EventType::WorkerStarted,
                json!({
                    "job_id": job.id,
                    "worker_id": worker_id,
                    "owner_id": job.owner_id,
                    "task": task_preview,
                    "trace_id": job.trace_id,
                }),
            )
            .await;

        // Transient thread: system prompt is injected fresh, the task is
        // the one user message.
        let thread = self
            .db
            .create_thread(
                job.owner_id,
                ThreadKind::Manual,
                format!("Worker: {}", safe_preview(&job.task, 50)),
            )
            .await;
        self.db
            .append_message(NewMessage {
                processed: true,
                ..NewMessage::plain(thread.id, Role::User, job.task.clone())
            })
            .await;

        let profile = AgentProfile {
            model: job.model.clone(),
            reasoning_effort: job.reasoning_effort.clone(),
        };
        let allowlist: Vec<String> = WORKER_TOOL_NAMES.iter().map(|s| (*s).to_string()).collect();
        let tools = self.resolver.filter_by_allowlist(Some(&allowlist));
        let messages = vec![
            ChatMessage::system(build_worker_prompt(&format!("owner {}", job.owner_id))),
            ChatMessage::user(job.task.clone()),
        ];

        let engine_outcome = tokio::time::timeout(
            self.settings.worker_timeout,
            self.engine.run_loop(messages, &profile, &tools, &ctx),
        )
        .await;

        let react = match engine_outcome {
            Err(_) => {
                let error = format!(
                    "Worker execution timed out after {} seconds",
                    self.settings.worker_timeout.as_secs()
                );
                return self
                    .fail_worker(job, &worker_id, started, String::new(), error)
                    .await;
            }
            Ok(Err(err)) => {
                return self
                    .fail_worker(job, &worker_id, started, String::new(), err.to_string())
                    .await;
            }
            Ok(Ok(react)) => react,
        };

        // Persist the full conversation (injected system included) and
        // each tool call's output as a numbered file.
        for message in &react.messages {
            let record = message_artifact(message);
            if let Err(err) = self.artifacts.save_message(&worker_id, &record).await {
                warn!(%worker_id, %err, "failed to persist message");
            }
        }
        let mut sequence: u32 = 0;
        for message in &react.messages {
            if message.role == Role::Tool {
                sequence += 1;
                let tool_name = message.name.as_deref().unwrap_or("unknown_tool");
                if let Err(err) = self
                    .artifacts
                    .save_tool_output(&worker_id, tool_name, &message.content, sequence)
                    .await
                {
                    warn!(%worker_id, sequence, %err, "failed to persist tool output");
                }
            }
        }
        for message in react.messages.iter().skip(2) {
            if message.role == Role::System {
                continue;
            }
            self.db
                .append_message(NewMessage {
                    tool_calls: message.tool_calls.clone(),
                    tool_call_id: message.tool_call_id.clone(),
                    name: message.name.clone(),
                    processed: true,
                    ..NewMessage::plain(thread.id, message.role, message.content.clone())
                })
                .await;
        }

        let result_text = extract_result(&react.messages)
            .or_else(|| synthesize_from_tool_outputs(&react.messages));

        // Critical tool errors override a nominally successful loop.
        if let Some(critical) = ctx.emitter.critical_error() {
            let error_result = result_text.unwrap_or_else(|| critical.clone());
            return self
                .fail_worker(job, &worker_id, started, error_result, critical)
                .await;
        }

        let saved_result = result_text.unwrap_or_else(|| "(No result generated)".into());
        if let Err(err) = self.artifacts.save_result(&worker_id, &saved_result).await {
            warn!(%worker_id, %err, "failed to persist result");
        }
        let duration_ms = started.elapsed().as_millis() as i64;

        // Status first, then the summary: the bundle must already read as
        // terminal if summary extraction dies.
        if let Err(err) = self.artifacts.complete_worker(&worker_id, "success", None).await {
            warn!(%worker_id, %err, "failed to mark bundle complete");
        }
        let (summary, summary_meta) = self.extract_summary(&job.task, &saved_result).await;
        if let Err(err) = self
            .artifacts
            .update_summary(&worker_id, &summary, &summary_meta)
            .await
        {
            warn!(%worker_id, %err, "failed to persist summary");
        }

        let _ = self
            .events
            .append_run_event(
                job.run_id,
                EventType::WorkerComplete,
                json!({
                    "job_id": job.id,
                    "worker_id": worker_id,
                    "status": "success",
                    "duration_ms": duration_ms,
                    "owner_id": job.owner_id,
                    "trace_id": job.trace_id,
                }),
            )
            .await;
        if !summary.is_empty() {
            let _ = self
                .events
                .append_run_event(
                    job.run_id,
                    EventType::WorkerSummaryReady,
                    json!({
                        "job_id": job.id,
                        "worker_id": worker_id,
                        "summary": summary,
                        "owner_id": job.owner_id,
                        "trace_id": job.trace_id,
                    }),
                )
                .await;
        }

        let metric = json!({
            "phase": "run",
            "duration_ms": duration_ms,
            "prompt_tokens": react.usage.prompt_tokens,
            "completion_tokens": react.usage.completion_tokens,
            "total_tokens": react.usage.total_tokens,
        });
        if let Err(err) = self.artifacts.append_metric(&worker_id, &metric).await {
            warn!(%worker_id, %err, "failed to flush metrics");
        }

        info!(job_id = %job.id, %worker_id, duration_ms, "worker completed");
        WorkerRunOutcome {
            worker_id,
            status: JobStatus::Success,
            result: saved_result,
            summary,
            error: None,
            duration_ms,
        }
    }

    async fn fail_worker(
        &self,
        job: &WorkerJobRecord,
        worker_id: &WorkerId,
        started: Instant,
        result: String,
        error: String,
    ) -> WorkerRunOutcome {
        let duration_ms = started.elapsed().as_millis() as i64;
        if !result.is_empty() {
            if let Err(err) = self.artifacts.save_result(worker_id, &result).await {
                warn!(%worker_id, %err, "failed to persist result on failure path");
            }
        }
        if let Err(err) = self
            .artifacts
            .complete_worker(worker_id, "failed", Some(&error))
            .await
        {
            warn!(%worker_id, %err, "failed to mark bundle failed");
        }
        let _ = self
            .events
            .append_run_event(
                job.run_id,
                EventType::WorkerComplete,
                json!({
                    "job_id": job.id,
                    "worker_id": worker_id,
                    "status": "failed",
                    "error": error,
                    "duration_ms": duration_ms,
                    "owner_id": job.owner_id,
                    "trace_id": job.trace_id,
                }),
            )
            .await;

        warn!(job_id = %job.id, %worker_id, duration_ms, %error, "worker failed");
        WorkerRunOutcome {
            worker_id: worker_id.clone(),
            status: JobStatus::Failed,
            result,
            summary: String::new(),
            error: Some(error),
            duration_ms,
        }
    }

    /// Compress a result to ≤ 150 chars with a small model call; fall
    /// back to truncation when the call fails or times out.
    async fn extract_summary(&self, task: &str, result: &str) -> (String, Value) {
        let result_excerpt: String = result.chars().take(1000).collect();
        let prompt = format!(
            "Task: {task}\nResult: {result_excerpt}\n\n\
             Provide a {SUMMARY_MAX_CHARS}-character summary focusing on outcomes, not actions.\n\
             Be factual and concise. Do NOT add status judgments.\n\n\
             Example: \"Backup completed 157GB in 17s, no errors found\"\n"
        );
        let request =
            CompletionRequest::new(self.default_model.clone(), vec![ChatMessage::user(prompt)]);

        match tokio::time::timeout(SUMMARY_TIMEOUT, self.provider.complete(request)).await {
            Ok(Ok(response)) => {
                let summary = truncate_summary(response.message.content.trim());
                (
                    summary,
                    json!({
                        "version": SUMMARY_VERSION,
                        "model": self.default_model,
                        "generated_at": Utc::now().to_rfc3339(),
                    }),
                )
            }
            Ok(Err(err)) => truncation_fallback(result, &err.to_string()),
            Err(_) => truncation_fallback(result, "summary extraction timed out"),
        }
    }
}

fn truncation_fallback(result: &str, error: &str) -> (String, Value) {
    warn!(error, "summary extraction failed; falling back to truncation");
    (
        truncate_summary(result),
        json!({
            "version": SUMMARY_VERSION,
            "model": "truncation-fallback",
            "generated_at": Utc::now().to_rfc3339(),
            "error": error,
        }),
    )
}

fn truncate_summary(text: &str) -> String {
    if text.chars().count() <= SUMMARY_MAX_CHARS {
        return text.to_string();
    }
    let head: String = text.chars().take(SUMMARY_MAX_CHARS - 3).collect();
    format!("{head}...")
}

/// The last assistant message with real text.
fn extract_result(messages: &[ChatMessage]) -> Option<String> {
    messages
        .iter()
        .rev()
        .find(|m| m.role == Role::Assistant && m.text_content().is_some())
        .and_then(|m| m.text_content().map(str::to_string))
}

/// Fallback when the model produced tool calls but no final text:
/// surface the last few tool outputs under a clearly-marked header.
fn synthesize_from_tool_outputs(messages: &[ChatMessage]) -> Option<String> {
    let mut outputs: Vec<(&str, String)> = Vec::new();
    for message in messages.iter().rev() {
        if message.role == Role::Tool && !message.content.trim().is_empty() {
            let truncated: String = message.content.chars().take(2000).collect();
            outputs.push((message.name.as_deref().unwrap_or("tool"), truncated));
            if outputs.len() >= 3 {
                break;
            }
        }
    }
    if outputs.is_empty() {
        return None;
    }

    let mut parts =
        vec!["[Worker completed task but produced no final summary. Tool outputs below:]".to_string()];
    for (tool_name, output) in outputs.into_iter().rev() {
        parts.push(format!("\n--- {tool_name} ---\n{output}"));
    }
    Some(parts.join("\n"))
}

fn message_artifact(message: &ChatMessage) -> Value {
    let mut record = json!({
        "role": message.role,
        "content": message.content,
        "timestamp": Utc::now().to_rfc3339(),
    });
    if let Value::Object(map) = &mut record {
        if let Some(tool_calls) = &message.tool_calls {
            if let Ok(value) = serde_json::to_value(tool_calls) {
                map.insert("tool_calls".into(), value);
            }
        }
        if let Some(tool_call_id) = &message.tool_call_id {
            map.insert("tool_call_id".into(), Value::String(tool_call_id.clone()));
        }
        if let Some(name) = &message.name {
            map.insert("name".into(), Value::String(name.clone()));
        }
    }
    record
}
