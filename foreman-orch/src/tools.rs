//! Supervisor-facing tools over the job table and artifact store.

use std::sync::Arc;
use std::time::Duration;

use chrono::{Duration as ChronoDuration, Utc};
use foreman_artifacts::ArtifactStore;
use foreman_events::EventStore;
use foreman_monitor::{LlmDecider, MonitorOptions, RoundaboutMonitor, format_roundabout_result};
use foreman_provider::Provider;
use foreman_store::Database;
use foreman_tool::envelope::safe_preview;
use foreman_tool::{ToolDyn, ToolError, ToolFuture};
use foreman_types::{DecisionMode, JobId, OwnerId, RunId, Settings};
use serde_json::{Value, json};

/// Tools available to the supervisor agent.
pub const SUPERVISOR_TOOL_NAMES: &[&str] = &[
    "spawn_worker",
    "wait_for_worker",
    "list_workers",
    "read_worker_result",
    "get_worker_metadata",
    "get_tool_output",
    "get_current_time",
    "http_request",
    "send_email",
    "knowledge_search",
    "web_search",
    "web_fetch",
];

/// Infrastructure tools granted to workers.
pub const WORKER_TOOL_NAMES: &[&str] = &[
    "runner_exec",
    "ssh_exec",
    "http_request",
    "get_current_time",
    "send_email",
    "contact_user",
    "knowledge_search",
    "web_search",
    "web_fetch",
    "get_tool_output",
];

fn require_owner(input: &Value) -> Result<OwnerId, ToolError> {
    input
        .get("_owner_id")
        .and_then(Value::as_i64)
        .map(OwnerId::new)
        .ok_or_else(|| ToolError::InvalidInput("no owner context".into()))
}

fn require_job_id(input: &Value) -> Result<JobId, ToolError> {
    input
        .get("job_id")
        .and_then(Value::as_i64)
        .map(JobId::new)
        .ok_or_else(|| ToolError::InvalidInput("job_id is required".into()))
}

/// Hand a task to a disposable worker.
///
/// The registry entry exists for its schema; calls to this name are
/// intercepted by the engine, which opens the job row itself as phase
/// one of the two-phase commit. A direct call means the engine was
/// bypassed.
pub struct SpawnWorkerTool;

impl ToolDyn for SpawnWorkerTool {
    fn name(&self) -> &str {
        "spawn_worker"
    }

    fn description(&self) -> &str {
        "Delegate a task to a disposable background worker. Returns once the \
         worker is queued; results arrive when the worker completes."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "task": {"type": "string", "description": "Task instructions for the worker"},
                "model": {"type": "string", "description": "Optional model override"},
                "git_repo": {"type": "string", "description": "Repository for workspace execution"},
                "resume_session_id": {"type": "string", "description": "Prior session to resume"}
            },
            "required": ["task"]
        })
    }

    fn call(&self, _input: Value) -> ToolFuture<'_> {
        Box::pin(async move {
            Ok(json!({
                "ok": false,
                "user_message": "spawn_worker is executed by the run engine",
            }))
        })
    }
}

/// Watch one running worker through the roundabout monitor and return
/// the formatted status report.
pub struct WaitForWorkerTool {
    db: Database,
    events: EventStore,
    artifacts: ArtifactStore,
    provider: Arc<dyn Provider>,
    settings: Arc<Settings>,
    decider_model: String,
}

impl WaitForWorkerTool {
    /// Create the tool over shared dependencies.
    #[must_use]
    pub fn new(
        db: Database,
        events: EventStore,
        artifacts: ArtifactStore,
        provider: Arc<dyn Provider>,
        settings: Arc<Settings>,
        decider_model: impl Into<String>,
    ) -> Self {
        Self {
            db,
            events,
            artifacts,
            provider,
            settings,
            decider_model: decider_model.into(),
        }
    }
}

impl ToolDyn for WaitForWorkerTool {
    fn name(&self) -> &str {
        "wait_for_worker"
    }

    fn description(&self) -> &str {
        "Monitor a running worker job until it completes, produces a final \
         answer, or the monitoring window closes. Returns a status report."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "job_id": {"type": "integer", "description": "Worker job id to watch"},
                "timeout_seconds": {"type": "number", "description": "Optional monitoring window override"}
            },
            "required": ["job_id"]
        })
    }

    fn call(&self, input: Value) -> ToolFuture<'_> {
        Box::pin(async move {
            let job_id = require_job_id(&input)?;
            let owner_id = require_owner(&input)?;
            let run_id = input.get("_run_id").and_then(Value::as_i64).map(RunId::new);

            let mut options = MonitorOptions::from_settings(&self.settings);
            if let Some(seconds) = input.get("timeout_seconds").and_then(Value::as_f64) {
                options.hard_timeout = Duration::from_secs_f64(seconds.max(1.0));
            }

            let mut monitor = RoundaboutMonitor::new(
                self.db.clone(),
                &self.events,
                self.artifacts.clone(),
                job_id,
                owner_id,
                run_id,
                options,
            );
            if matches!(
                self.settings.decision_mode,
                DecisionMode::Llm | DecisionMode::Hybrid
            ) {
                monitor = monitor.with_decider(LlmDecider::new(
                    Arc::clone(&self.provider),
                    self.decider_model.clone(),
                ));
            }

            let result = monitor.wait_for_completion().await;
            Ok(Value::String(format_roundabout_result(&result)))
        })
    }
}

/// Compact listing of the owner's recent workers.
pub struct ListWorkersTool {
    db: Database,
}

impl ListWorkersTool {
    /// Create the tool over the job table.
    #[must_use]
    pub fn new(db: Database) -> Self {
        Self { db }
    }
}

impl ToolDyn for ListWorkersTool {
    fn name(&self) -> &str {
        "list_workers"
    }

    fn description(&self) -> &str {
        "List recent worker jobs with status and task previews."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "limit": {"type": "integer", "description": "Max entries (default 10)"},
                "minutes": {"type": "integer", "description": "Lookback window (default 60)"}
            }
        })
    }

    fn call(&self, input: Value) -> ToolFuture<'_> {
        Box::pin(async move {
            let owner_id = require_owner(&input)?;
            let limit = input
                .get("limit")
                .and_then(Value::as_u64)
                .unwrap_or(10)
                .min(50) as usize;
            let minutes = input.get("minutes").and_then(Value::as_i64).unwrap_or(60);
            let cutoff = Utc::now() - ChronoDuration::minutes(minutes);

            let jobs = self.db.recent_jobs_for_owner(owner_id, cutoff, limit).await;
            let entries: Vec<Value> = jobs
                .iter()
                .map(|job| {
                    json!({
                        "job_id": job.id,
                        "status": job.status,
                        "task": safe_preview(&job.task, 100),
                        "worker_id": job.worker_id,
                        "created_at": job.created_at.to_rfc3339(),
                    })
                })
                .collect();
            Ok(json!({"ok": true, "data": {"workers": entries}}))
        })
    }
}

/// Fetch a finished worker's full result text.
pub struct ReadWorkerResultTool {
    db: Database,
    artifacts: ArtifactStore,
}

impl ReadWorkerResultTool {
    /// Create the tool over the job table and bundle store.
    #[must_use]
    pub fn new(db: Database, artifacts: ArtifactStore) -> Self {
        Self { db, artifacts }
    }
}

impl ToolDyn for ReadWorkerResultTool {
    fn name(&self) -> &str {
        "read_worker_result"
    }

    fn description(&self) -> &str {
        "Read the full result text a worker produced."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "job_id": {"type": "integer", "description": "Worker job id"}
            },
            "required": ["job_id"]
        })
    }

    fn call(&self, input: Value) -> ToolFuture<'_> {
        Box::pin(async move {
            let job_id = require_job_id(&input)?;
            let owner_id = require_owner(&input)?;
            let job = self
                .db
                .get_job_for_owner(job_id, owner_id)
                .await
                .ok_or_else(|| ToolError::ExecutionFailed(format!("job {job_id} not found")))?;

            if let Some(worker_id) = &job.worker_id {
                if let Ok(result) = self.artifacts.worker_result(worker_id).await {
                    return Ok(Value::String(result));
                }
            }
            match job.result {
                Some(result) => Ok(Value::String(result)),
                None => Ok(json!({
                    "ok": false,
                    "user_message": format!("job {job_id} has no result yet"),
                })),
            }
        })
    }
}

/// Status + summary metadata for one worker job.
pub struct GetWorkerMetadataTool {
    db: Database,
    artifacts: ArtifactStore,
}

impl GetWorkerMetadataTool {
    /// Create the tool over the job table and bundle store.
    #[must_use]
    pub fn new(db: Database, artifacts: ArtifactStore) -> Self {
        Self { db, artifacts }
    }
}

impl ToolDyn for GetWorkerMetadataTool {
    fn name(&self) -> &str {
        "get_worker_metadata"
    }

    fn description(&self) -> &str {
        "Get a worker job's status, timing, and compressed summary."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "job_id": {"type": "integer", "description": "Worker job id"}
            },
            "required": ["job_id"]
        })
    }

    fn call(&self, input: Value) -> ToolFuture<'_> {
        Box::pin(async move {
            let job_id = require_job_id(&input)?;
            let owner_id = require_owner(&input)?;
            let job = self
                .db
                .get_job_for_owner(job_id, owner_id)
                .await
                .ok_or_else(|| ToolError::ExecutionFailed(format!("job {job_id} not found")))?;

            let summary = match &job.worker_id {
                Some(worker_id) => self
                    .artifacts
                    .worker_metadata(worker_id)
                    .await
                    .ok()
                    .and_then(|m| m.summary),
                None => None,
            };
            Ok(json!({
                "ok": true,
                "data": {
                    "job_id": job.id,
                    "status": job.status,
                    "task": safe_preview(&job.task, 100),
                    "worker_id": job.worker_id,
                    "error": job.error,
                    "summary": summary,
                    "created_at": job.created_at.to_rfc3339(),
                    "finished_at": job.finished_at.map(|t| t.to_rfc3339()),
                }
            }))
        })
    }
}
