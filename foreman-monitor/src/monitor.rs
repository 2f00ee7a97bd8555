//! The roundabout polling loop.

use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use chrono::Utc;
use foreman_artifacts::ArtifactStore;
use foreman_events::{EventBus, EventRecord, EventStore, EventType};
use foreman_store::Database;
use foreman_types::{
    DecisionMode, JobId, JobStatus, OwnerId, RunId, Settings, WorkerId,
};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::decision::{
    ACTIVITY_LOG_MAX, Decision, DecisionContext, STUCK_THRESHOLD_SECS, ToolActivity,
    ToolActivityStatus, make_heuristic_decision,
};
use crate::llm_decider::LlmDecider;

/// Knobs for one monitoring session.
#[derive(Debug, Clone)]
pub struct MonitorOptions {
    /// Interval between status polls.
    pub poll_interval: Duration,
    /// Monitor-only hard timeout; the worker may continue past it.
    pub hard_timeout: Duration,
    /// Stuck threshold for warnings (never cancels).
    pub cancel_stuck_threshold: Duration,
    /// Decision engine selection.
    pub decision_mode: DecisionMode,
}

impl MonitorOptions {
    /// Options from the shared settings.
    #[must_use]
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            poll_interval: settings.roundabout_poll_interval,
            hard_timeout: settings.roundabout_hard_timeout,
            cancel_stuck_threshold: settings.worker_cancel_stuck_threshold,
            decision_mode: settings.decision_mode,
        }
    }
}

/// How a monitoring session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoundaboutStatus {
    /// The worker finished successfully.
    Complete,
    /// The worker finished in failure (or was cancelled / timed out).
    Failed,
    /// A final answer was detected before the worker finished.
    EarlyExit,
    /// The decider aborted the worker.
    Cancelled,
    /// The monitor gave up watching; the worker may still be running.
    MonitorTimeout,
    /// The decider asked for a drill-down pointer.
    Peek,
}

/// Execution metadata for one tool call, merged from the artifact index
/// and the live activity log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolIndexEntry {
    /// 1-based call order.
    pub sequence: u32,
    /// Tool name.
    pub tool_name: String,
    /// Exit code when extractable from the output envelope.
    pub exit_code: Option<i64>,
    /// Duration when the activity log saw the completion event.
    pub duration_ms: Option<i64>,
    /// Output size in bytes.
    pub output_bytes: u64,
    /// Whether the call failed.
    pub failed: bool,
}

/// Structured result of one monitoring session.
#[derive(Debug, Clone)]
pub struct RoundaboutResult {
    /// How the session ended.
    pub status: RoundaboutStatus,
    /// The observed job.
    pub job_id: JobId,
    /// Worker bundle id, when known.
    pub worker_id: Option<WorkerId>,
    /// Wall-clock monitoring duration in seconds.
    pub duration_seconds: f64,
    /// True on monitor timeout while the worker continues.
    pub worker_still_running: bool,
    /// Worker result text, when available.
    pub result: Option<String>,
    /// Compressed summary, when available.
    pub summary: Option<String>,
    /// Error text, when the session ended on one.
    pub error: Option<String>,
    /// Aggregated activity counters.
    pub activity_summary: Value,
    /// The decision that ended the session, when one did.
    pub decision: Option<Decision>,
    /// Drill-down hint for peek results.
    pub drill_down_hint: Option<String>,
    /// Per-tool execution metadata.
    pub tool_index: Vec<ToolIndexEntry>,
    /// Supervisor run id for evidence correlation.
    pub run_id: Option<RunId>,
}

#[derive(Default)]
struct ActivityLog {
    activities: Vec<ToolActivity>,
    last_tool_output: Option<String>,
    /// Bumped on every observed event, heartbeats included; the poll
    /// loop derives the no-progress streak from it.
    event_count: u64,
}

/// Bounded polling monitor for one worker job.
pub struct RoundaboutMonitor {
    db: Database,
    bus: EventBus,
    artifacts: ArtifactStore,
    job_id: JobId,
    owner_id: OwnerId,
    supervisor_run_id: Option<RunId>,
    options: MonitorOptions,
    decider: Option<LlmDecider>,
    check_count: u64,
}

impl RoundaboutMonitor {
    /// Create a monitor for one job.
    #[must_use]
    pub fn new(
        db: Database,
        events: &EventStore,
        artifacts: ArtifactStore,
        job_id: JobId,
        owner_id: OwnerId,
        supervisor_run_id: Option<RunId>,
        options: MonitorOptions,
    ) -> Self {
        Self {
            db,
            bus: events.bus().clone(),
            artifacts,
            job_id,
            owner_id,
            supervisor_run_id,
            options,
            decider: None,
            check_count: 0,
        }
    }

    /// Attach an LLM decider (used by the `llm` and `hybrid` modes).
    #[must_use]
    pub fn with_decider(mut self, decider: LlmDecider) -> Self {
        self.decider = Some(decider);
        self
    }

    /// Enter the roundabout and watch until the worker completes, a
    /// decision ends the session, or the hard timeout trips.
    pub async fn wait_for_completion(&mut self) -> RoundaboutResult {
        let started = Instant::now();
        info!(job_id = %self.job_id, "entering roundabout");

        let log: Arc<StdMutex<ActivityLog>> = Arc::default();
        let cancel = CancellationToken::new();
        let listener = tokio::spawn(listen_for_events(
            self.bus.subscribe(),
            self.job_id,
            Arc::clone(&log),
            cancel.clone(),
        ));

        let result = self.poll_until_done(started, &log).await;

        cancel.cancel();
        if tokio::time::timeout(Duration::from_secs(1), listener)
            .await
            .is_err()
        {
            warn!(job_id = %self.job_id, "event listener did not stop within the join bound");
        }

        result
    }

    async fn poll_until_done(
        &mut self,
        started: Instant,
        log: &Arc<StdMutex<ActivityLog>>,
    ) -> RoundaboutResult {
        let mut last_event_count: u64 = 0;
        let mut polls_without_progress: usize = 0;

        loop {
            self.check_count += 1;
            let elapsed = started.elapsed().as_secs_f64();

            if started.elapsed() > self.options.hard_timeout {
                warn!(
                    job_id = %self.job_id,
                    elapsed,
                    "roundabout monitor timeout (worker may still be running)"
                );
                let job = self.db.get_job_for_owner(self.job_id, self.owner_id).await;
                let worker_running = job
                    .as_ref()
                    .is_some_and(|j| matches!(j.status, JobStatus::Queued | JobStatus::Running));
                return self.timeout_result(
                    elapsed,
                    job.and_then(|j| j.worker_id),
                    worker_running,
                    log,
                );
            }

            let Some(job) = self.db.get_job_for_owner(self.job_id, self.owner_id).await else {
                return self.error_result(elapsed, "Job not found", log);
            };

            self.log_monitoring_check(&job, elapsed, log).await;

            if job.status.is_terminal() {
                info!(job_id = %self.job_id, status = ?job.status, elapsed, "roundabout exit");
                return self.completion_result(&job, elapsed, log).await;
            }

            let (ctx, event_count) = self.build_decision_context(&job, elapsed, polls_without_progress, log);
            let (decision, reason) = self.decide(&ctx).await;

            match decision {
                Decision::Exit => {
                    info!(job_id = %self.job_id, reason, "roundabout early exit");
                    return self.early_exit_result(&job, elapsed, &reason, log).await;
                }
                Decision::Cancel => {
                    warn!(job_id = %self.job_id, reason, "roundabout cancelling job");
                    return self.cancel_result(&job, elapsed, &reason, log).await;
                }
                Decision::Peek => {
                    info!(job_id = %self.job_id, reason, "roundabout peek");
                    return self.peek_result(&job, elapsed, &reason, log);
                }
                Decision::Wait => {}
            }

            if event_count > last_event_count {
                polls_without_progress = 0;
                last_event_count = event_count;
            } else {
                polls_without_progress += 1;
            }

            if self.check_count % 20 == 0 {
                debug!(
                    job_id = %self.job_id,
                    check = self.check_count,
                    status = ?job.status,
                    elapsed,
                    no_progress_polls = polls_without_progress,
                    "roundabout check"
                );
            }

            tokio::time::sleep(self.options.poll_interval).await;
        }
    }

    async fn decide(&mut self, ctx: &DecisionContext) -> (Decision, String) {
        let stuck_secs = self.options.cancel_stuck_threshold.as_secs_f64();
        match self.options.decision_mode {
            DecisionMode::Heuristic => make_heuristic_decision(ctx, stuck_secs),
            DecisionMode::Llm => match self.decider.as_mut() {
                Some(decider) => decider.decide(ctx, self.check_count).await,
                None => make_heuristic_decision(ctx, stuck_secs),
            },
            DecisionMode::Hybrid => {
                let (decision, reason) = make_heuristic_decision(ctx, stuck_secs);
                if decision != Decision::Wait {
                    return (decision, format!("[heuristic] {reason}"));
                }
                match self.decider.as_mut() {
                    Some(decider) => {
                        let (decision, reason) = decider.decide(ctx, self.check_count).await;
                        if decision != Decision::Wait {
                            (decision, format!("[llm] {reason}"))
                        } else {
                            (Decision::Wait, format!("[hybrid] {reason}"))
                        }
                    }
                    None => (Decision::Wait, reason),
                }
            }
        }
    }

    fn build_decision_context(
        &self,
        job: &foreman_store::WorkerJobRecord,
        elapsed: f64,
        polls_without_progress: usize,
        log: &Arc<StdMutex<ActivityLog>>,
    ) -> (DecisionContext, u64) {
        let guard = log.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let activities: Vec<ToolActivity> = guard
            .activities
            .iter()
            .rev()
            .take(ACTIVITY_LOG_MAX)
            .rev()
            .cloned()
            .collect();

        let mut current_operation = None;
        let mut is_stuck = false;
        let mut stuck_seconds = 0.0;
        if let Some(last) = activities.last() {
            if last.status == ToolActivityStatus::Started {
                stuck_seconds = (Utc::now() - last.started_at).num_milliseconds() as f64 / 1000.0;
                is_stuck = stuck_seconds > STUCK_THRESHOLD_SECS;
                current_operation = Some(last.clone());
            }
        }

        let ctx = DecisionContext {
            job_id: self.job_id,
            worker_id: job.worker_id.clone(),
            task: job.task.clone(),
            status: job.status,
            elapsed_seconds: elapsed,
            tool_activities: activities,
            current_operation,
            is_stuck,
            stuck_seconds,
            polls_without_progress,
            last_tool_output: guard.last_tool_output.clone(),
        };
        (ctx, guard.event_count)
    }

    fn activity_summary(&self, log: &Arc<StdMutex<ActivityLog>>, extra: Value) -> Value {
        let guard = log.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let completed = guard
            .activities
            .iter()
            .filter(|a| a.status == ToolActivityStatus::Completed)
            .count();
        let failed = guard
            .activities
            .iter()
            .filter(|a| a.status == ToolActivityStatus::Failed)
            .count();
        let mut tools_used: Vec<&str> = guard
            .activities
            .iter()
            .map(|a| a.tool_name.as_str())
            .collect();
        tools_used.sort_unstable();
        tools_used.dedup();

        let mut summary = json!({
            "tool_calls_total": guard.activities.len(),
            "tool_calls_completed": completed,
            "tool_calls_failed": failed,
            "tools_used": tools_used,
            "monitoring_checks": self.check_count,
            "decision_mode": self.options.decision_mode,
        });
        if let (Value::Object(target), Value::Object(extras)) = (&mut summary, extra) {
            for (key, value) in extras {
                target.insert(key, value);
            }
        }
        summary
    }

    async fn log_monitoring_check(
        &self,
        job: &foreman_store::WorkerJobRecord,
        elapsed: f64,
        log: &Arc<StdMutex<ActivityLog>>,
    ) {
        let Some(worker_id) = &job.worker_id else {
            return;
        };
        let (count, recent): (usize, Vec<String>) = {
            let guard = log.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            (
                guard.activities.len(),
                guard
                    .activities
                    .iter()
                    .rev()
                    .take(5)
                    .map(|a| a.tool_name.clone())
                    .collect(),
            )
        };
        let data = json!({
            "check_number": self.check_count,
            "elapsed_seconds": elapsed,
            "timestamp": Utc::now().to_rfc3339(),
            "job_status": job.status,
            "tool_activities": count,
            "tool_names": recent,
        });
        if let Err(err) = self
            .artifacts
            .save_monitoring_check(worker_id, elapsed as u64, &data)
            .await
        {
            debug!(job_id = %self.job_id, %err, "failed to write monitoring check");
        }
    }

    async fn build_tool_index(
        &self,
        worker_id: &WorkerId,
        log: &Arc<StdMutex<ActivityLog>>,
    ) -> Vec<ToolIndexEntry> {
        let entries = match self.artifacts.tool_call_index(worker_id).await {
            Ok(entries) => entries,
            Err(err) => {
                warn!(job_id = %self.job_id, %err, "failed to build tool index");
                return vec![];
            }
        };
        let guard = log.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        entries
            .into_iter()
            .map(|entry| {
                let duration_ms = guard
                    .activities
                    .iter()
                    .find(|a| a.tool_name == entry.tool_name && a.duration_ms.is_some())
                    .and_then(|a| a.duration_ms);
                ToolIndexEntry {
                    sequence: entry.sequence,
                    tool_name: entry.tool_name,
                    exit_code: entry.exit_code,
                    duration_ms,
                    output_bytes: entry.output_bytes,
                    failed: entry.failed,
                }
            })
            .collect()
    }

    async fn completion_result(
        &mut self,
        job: &foreman_store::WorkerJobRecord,
        elapsed: f64,
        log: &Arc<StdMutex<ActivityLog>>,
    ) -> RoundaboutResult {
        let mut result_text = None;
        let mut summary = None;
        let mut tool_index = vec![];

        if let Some(worker_id) = &job.worker_id {
            if job.status == JobStatus::Success {
                result_text = self.artifacts.worker_result(worker_id).await.ok();
                summary = self
                    .artifacts
                    .worker_metadata(worker_id)
                    .await
                    .ok()
                    .and_then(|m| m.summary);
            }
            tool_index = self.build_tool_index(worker_id, log).await;
        }

        RoundaboutResult {
            status: if job.status == JobStatus::Success {
                RoundaboutStatus::Complete
            } else {
                RoundaboutStatus::Failed
            },
            job_id: self.job_id,
            worker_id: job.worker_id.clone(),
            duration_seconds: elapsed,
            worker_still_running: false,
            result: result_text,
            summary,
            error: if job.status == JobStatus::Success {
                None
            } else {
                job.error.clone()
            },
            activity_summary: self.activity_summary(log, json!({})),
            decision: None,
            drill_down_hint: None,
            tool_index,
            run_id: self.supervisor_run_id,
        }
    }

    async fn early_exit_result(
        &mut self,
        job: &foreman_store::WorkerJobRecord,
        elapsed: f64,
        reason: &str,
        log: &Arc<StdMutex<ActivityLog>>,
    ) -> RoundaboutResult {
        let partial = match &job.worker_id {
            Some(worker_id) => self.artifacts.worker_result(worker_id).await.ok(),
            None => None,
        };
        RoundaboutResult {
            status: RoundaboutStatus::EarlyExit,
            job_id: self.job_id,
            worker_id: job.worker_id.clone(),
            duration_seconds: elapsed,
            worker_still_running: matches!(job.status, JobStatus::Queued | JobStatus::Running),
            result: partial,
            summary: Some(format!("Early exit: {reason}")),
            error: None,
            activity_summary: self.activity_summary(log, json!({"exit_reason": reason})),
            decision: Some(Decision::Exit),
            drill_down_hint: None,
            tool_index: vec![],
            run_id: self.supervisor_run_id,
        }
    }

    async fn cancel_result(
        &mut self,
        job: &foreman_store::WorkerJobRecord,
        elapsed: f64,
        reason: &str,
        log: &Arc<StdMutex<ActivityLog>>,
    ) -> RoundaboutResult {
        let cancel_error = format!("Cancelled by roundabout: {reason}");
        if let Err(err) = self
            .db
            .update_job(job.id, |j| {
                if !j.status.is_terminal() {
                    j.status = JobStatus::Cancelled;
                    j.error = Some(cancel_error.clone());
                }
            })
            .await
        {
            warn!(job_id = %self.job_id, %err, "failed to mark job cancelled");
        }

        RoundaboutResult {
            status: RoundaboutStatus::Cancelled,
            job_id: self.job_id,
            worker_id: job.worker_id.clone(),
            duration_seconds: elapsed,
            worker_still_running: false,
            result: None,
            summary: None,
            error: Some(reason.to_string()),
            activity_summary: self.activity_summary(log, json!({"cancel_reason": reason})),
            decision: Some(Decision::Cancel),
            drill_down_hint: None,
            tool_index: vec![],
            run_id: self.supervisor_run_id,
        }
    }

    fn peek_result(
        &mut self,
        job: &foreman_store::WorkerJobRecord,
        elapsed: f64,
        reason: &str,
        log: &Arc<StdMutex<ActivityLog>>,
    ) -> RoundaboutResult {
        let hint = format!(
            "For more details, use:\n\
             \x20 read_worker_file({job}, 'messages.jsonl')  # Full conversation\n\
             \x20 read_worker_result({job})  # Final result (when complete)",
            job = self.job_id
        );
        RoundaboutResult {
            status: RoundaboutStatus::Peek,
            job_id: self.job_id,
            worker_id: job.worker_id.clone(),
            duration_seconds: elapsed,
            worker_still_running: matches!(job.status, JobStatus::Queued | JobStatus::Running),
            result: None,
            summary: Some(format!("Peek requested: {reason}")),
            error: None,
            activity_summary: self.activity_summary(log, json!({"peek_reason": reason})),
            decision: Some(Decision::Peek),
            drill_down_hint: Some(hint),
            tool_index: vec![],
            run_id: self.supervisor_run_id,
        }
    }

    fn timeout_result(
        &mut self,
        elapsed: f64,
        worker_id: Option<WorkerId>,
        worker_still_running: bool,
        log: &Arc<StdMutex<ActivityLog>>,
    ) -> RoundaboutResult {
        RoundaboutResult {
            status: RoundaboutStatus::MonitorTimeout,
            job_id: self.job_id,
            worker_id,
            duration_seconds: elapsed,
            worker_still_running,
            result: None,
            summary: None,
            error: Some(format!("Monitor timeout after {elapsed:.0}s")),
            activity_summary: self.activity_summary(log, json!({})),
            decision: None,
            drill_down_hint: None,
            tool_index: vec![],
            run_id: self.supervisor_run_id,
        }
    }

    fn error_result(
        &mut self,
        elapsed: f64,
        error: &str,
        log: &Arc<StdMutex<ActivityLog>>,
    ) -> RoundaboutResult {
        RoundaboutResult {
            status: RoundaboutStatus::Failed,
            job_id: self.job_id,
            worker_id: None,
            duration_seconds: elapsed,
            worker_still_running: false,
            result: None,
            summary: None,
            error: Some(error.to_string()),
            activity_summary: self.activity_summary(log, json!({})),
            decision: None,
            drill_down_hint: None,
            tool_index: vec![],
            run_id: self.supervisor_run_id,
        }
    }
}

async fn listen_for_events(
    mut receiver: tokio::sync::broadcast::Receiver<Arc<EventRecord>>,
    job_id: JobId,
    log: Arc<StdMutex<ActivityLog>>,
    cancel: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            () = cancel.cancelled() => return,
            event = receiver.recv() => event,
        };
        let event = match event {
            Ok(event) => event,
            Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                debug!(%job_id, skipped, "roundabout listener lagged");
                continue;
            }
            Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
        };

        if event.payload.get("job_id").and_then(Value::as_i64) != Some(job_id.as_i64()) {
            continue;
        }

        let mut guard = log.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        match event.event_type {
            EventType::WorkerToolStarted => {
                guard.event_count += 1;
                guard.activities.push(ToolActivity {
                    tool_name: event
                        .payload
                        .get("tool_name")
                        .and_then(Value::as_str)
                        .unwrap_or("unknown")
                        .to_string(),
                    status: ToolActivityStatus::Started,
                    started_at: Utc::now(),
                    duration_ms: None,
                    args_preview: event
                        .payload
                        .get("args_preview")
                        .and_then(Value::as_str)
                        .map(str::to_string),
                    error: None,
                });
            }
            EventType::WorkerToolCompleted | EventType::WorkerToolFailed => {
                guard.event_count += 1;
                let failed = event.event_type == EventType::WorkerToolFailed;
                let tool_name = event
                    .payload
                    .get("tool_name")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown");
                if let Some(activity) = guard
                    .activities
                    .iter_mut()
                    .rev()
                    .find(|a| a.tool_name == tool_name && a.status == ToolActivityStatus::Started)
                {
                    activity.status = if failed {
                        ToolActivityStatus::Failed
                    } else {
                        ToolActivityStatus::Completed
                    };
                    activity.duration_ms =
                        event.payload.get("duration_ms").and_then(Value::as_i64);
                    if failed {
                        activity.error = event
                            .payload
                            .get("error")
                            .and_then(Value::as_str)
                            .map(str::to_string);
                    }
                }
                if !failed {
                    if let Some(preview) = event
                        .payload
                        .get("result_preview")
                        .and_then(Value::as_str)
                    {
                        let capped: String = preview.chars().take(500).collect();
                        guard.last_tool_output = Some(capped);
                    }
                }
            }
            EventType::WorkerHeartbeat => {
                // The worker is reasoning; counts as progress.
                guard.event_count += 1;
            }
            _ => {}
        }
    }
}

/// Render a roundabout result for the supervisor's thread.
///
/// Completed (and failed / timed-out) sessions carry an evidence marker
/// that downstream tooling expands into the bundle listing.
#[must_use]
pub fn format_roundabout_result(result: &RoundaboutResult) -> String {
    let mut lines: Vec<String> = Vec::new();

    match result.status {
        RoundaboutStatus::Complete => {
            lines.push(format!("Worker job {} completed successfully.", result.job_id));
            lines.push(format!(
                "Duration: {:.1}s | Worker ID: {}",
                result.duration_seconds,
                result
                    .worker_id
                    .as_ref()
                    .map_or("unknown", |w| w.as_str())
            ));
            lines.push(String::new());

            if !result.tool_index.is_empty() {
                lines.push("Tool Index:".into());
                for entry in &result.tool_index {
                    let status = if entry.failed {
                        "FAILED".to_string()
                    } else if let Some(code) = entry.exit_code {
                        format!("exit={code}")
                    } else {
                        "ok".to_string()
                    };
                    let duration = entry
                        .duration_ms
                        .map_or_else(|| "?ms".to_string(), |d| format!("{d}ms"));
                    lines.push(format!(
                        "  {}. {} [{}, {}, {}B]",
                        entry.sequence, entry.tool_name, status, duration, entry.output_bytes
                    ));
                }
                lines.push(String::new());
            }

            if let Some(summary) = result.summary.as_deref().or(result.result.as_deref()) {
                let capped: String = summary.chars().take(500).collect();
                lines.push(format!("Summary: {capped}"));
                lines.push(String::new());
            }

            push_evidence_marker(&mut lines, result);
        }
        RoundaboutStatus::Failed => {
            lines.push(format!("Worker job {} failed.", result.job_id));
            lines.push(format!("Duration: {:.1}s", result.duration_seconds));
            if let Some(error) = &result.error {
                lines.push(format!("Error: {error}"));
            }
            lines.push(String::new());
            lines.push("Check worker artifacts for details:".into());
            lines.push(format!("  read_worker_file({}, 'messages.jsonl')", result.job_id));
            lines.push(String::new());
            push_evidence_marker(&mut lines, result);
        }
        RoundaboutStatus::MonitorTimeout => {
            lines.push(format!(
                "Monitor timeout: stopped watching job {} after {:.1}s.",
                result.job_id, result.duration_seconds
            ));
            if result.worker_still_running {
                lines.push("NOTE: The worker is STILL RUNNING in the background.".into());
                lines.push("It may complete successfully - check status periodically:".into());
            } else {
                lines.push("The worker appears to have stopped.".into());
            }
            lines.push(format!("  get_worker_metadata({})", result.job_id));
            lines.push(format!("  read_worker_result({})  # when complete", result.job_id));
            lines.push(String::new());
            push_evidence_marker(&mut lines, result);
        }
        RoundaboutStatus::EarlyExit => {
            lines.push(format!(
                "Exited monitoring of worker job {} early.",
                result.job_id
            ));
            lines.push(format!("Elapsed: {:.1}s", result.duration_seconds));
            if let Some(summary) = &result.summary {
                lines.push(format!("Partial findings: {summary}"));
            }
        }
        RoundaboutStatus::Cancelled => {
            lines.push(format!("Worker job {} was cancelled.", result.job_id));
            lines.push(format!("Elapsed: {:.1}s", result.duration_seconds));
            if let Some(error) = &result.error {
                lines.push(format!("Reason: {error}"));
            }
            if result.worker_still_running {
                lines.push("NOTE: Worker may still be running - cancellation is best-effort.".into());
            }
        }
        RoundaboutStatus::Peek => {
            lines.push(format!("Peek requested for worker job {}.", result.job_id));
            lines.push(format!("Elapsed: {:.1}s", result.duration_seconds));
            if let Some(summary) = &result.summary {
                lines.push(format!("Reason: {summary}"));
            }
            if result.worker_still_running {
                lines.push("Worker is still running in background.".into());
            }
            lines.push(String::new());
            if let Some(hint) = &result.drill_down_hint {
                lines.push(hint.clone());
            }
        }
    }

    if let Value::Object(summary) = &result.activity_summary {
        if !summary.is_empty() {
            lines.push(String::new());
            lines.push("Activity summary:".into());
            for (key, value) in summary {
                lines.push(format!("  {key}: {value}"));
            }
        }
    }

    lines.join("\n")
}

fn push_evidence_marker(lines: &mut Vec<String>, result: &RoundaboutResult) {
    if let (Some(run_id), Some(worker_id)) = (result.run_id, &result.worker_id) {
        lines.push(format!(
            "[EVIDENCE:run_id={run_id},job_id={},worker_id={worker_id}]",
            result.job_id
        ));
    }
}
