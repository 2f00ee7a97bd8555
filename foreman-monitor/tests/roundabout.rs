//! Roundabout monitor behavior against a live store and event bus.

use std::time::Duration;

use foreman_artifacts::ArtifactStore;
use foreman_events::{EventStore, EventType};
use foreman_monitor::{
    MonitorOptions, RoundaboutMonitor, RoundaboutStatus, format_roundabout_result,
};
use foreman_store::{Database, NewJob, NewRun};
use foreman_types::{
    DecisionMode, JobStatus, OwnerId, RunId, RunTrigger, ThreadId, WorkerId,
};
use serde_json::json;

struct Fixture {
    db: Database,
    events: EventStore,
    artifacts: ArtifactStore,
    run_id: RunId,
    _dir: tempfile::TempDir,
}

async fn fixture() -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let db = Database::new();
    let run = db
        .create_run(NewRun {
            owner_id: OwnerId::new(1),
            thread_id: ThreadId::new(1),
            trigger: RunTrigger::Api,
            model: "m".into(),
            reasoning_effort: None,
            trace_id: None,
        })
        .await;
    Fixture {
        db,
        events: EventStore::new(),
        artifacts: ArtifactStore::new(dir.path()),
        run_id: run.id,
        _dir: dir,
    }
}

fn options(hard_timeout_ms: u64) -> MonitorOptions {
    MonitorOptions {
        poll_interval: Duration::from_millis(10),
        hard_timeout: Duration::from_millis(hard_timeout_ms),
        cancel_stuck_threshold: Duration::from_secs(60),
        decision_mode: DecisionMode::Heuristic,
    }
}

async fn running_job(fixture: &Fixture, worker_id: Option<&WorkerId>) -> foreman_store::WorkerJobRecord {
    let (job, _) = fixture
        .db
        .create_job(NewJob {
            owner_id: OwnerId::new(1),
            run_id: fixture.run_id,
            tool_call_id: "tc1".into(),
            trace_id: None,
            task: "inspect the deploy".into(),
            model: "m".into(),
            reasoning_effort: None,
            config: None,
        })
        .await;
    fixture.db.flip_created_to_queued(&[job.id]).await;
    fixture.db.claim_next_queued(4).await.unwrap();
    if let Some(worker_id) = worker_id {
        fixture
            .db
            .update_job(job.id, |j| j.worker_id = Some(worker_id.clone()))
            .await
            .unwrap();
    }
    fixture.db.get_job(job.id).await.unwrap()
}

#[tokio::test]
async fn completion_is_detected_with_result_and_tool_index() {
    let f = fixture().await;
    let worker_id = f.artifacts.create_worker("inspect", &json!({})).await.unwrap();
    let job = running_job(&f, Some(&worker_id)).await;

    f.artifacts
        .save_tool_output(
            &worker_id,
            "ssh_exec",
            &json!({"ok": true, "data": {"exit_code": 0}}).to_string(),
            1,
        )
        .await
        .unwrap();
    f.artifacts.save_result(&worker_id, "157GB backed up").await.unwrap();
    f.artifacts.complete_worker(&worker_id, "success", None).await.unwrap();
    f.artifacts
        .update_summary(&worker_id, "Backup completed, no errors", &json!({"version": 1}))
        .await
        .unwrap();

    // The worker finishes shortly after the monitor starts watching.
    let db = f.db.clone();
    let job_id = job.id;
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(40)).await;
        db.finish_job(job_id, JobStatus::Success, Some("157GB backed up".into()), None)
            .await
            .unwrap();
    });

    let mut monitor = RoundaboutMonitor::new(
        f.db.clone(),
        &f.events,
        f.artifacts.clone(),
        job.id,
        OwnerId::new(1),
        Some(f.run_id),
        options(5_000),
    );
    let result = monitor.wait_for_completion().await;

    assert_eq!(result.status, RoundaboutStatus::Complete);
    assert!(!result.worker_still_running);
    assert_eq!(result.result.as_deref(), Some("157GB backed up"));
    assert_eq!(result.summary.as_deref(), Some("Backup completed, no errors"));
    assert_eq!(result.tool_index.len(), 1);
    assert_eq!(result.tool_index[0].exit_code, Some(0));

    let formatted = format_roundabout_result(&result);
    assert!(formatted.contains("completed successfully"));
    assert!(formatted.contains(&format!(
        "[EVIDENCE:run_id={},job_id={},worker_id={}]",
        f.run_id, job.id, worker_id
    )));
    assert!(formatted.contains("Tool Index:"));
}

#[tokio::test]
async fn final_answer_in_tool_output_causes_early_exit() {
    let f = fixture().await;
    let worker_id = f.artifacts.create_worker("inspect", &json!({})).await.unwrap();
    let job = running_job(&f, Some(&worker_id)).await;

    // A completed tool event carrying a final-answer preview arrives
    // while the job itself is still running.
    let events = f.events.clone();
    let job_id = job.id;
    let run_id = f.run_id;
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(30)).await;
        events
            .append_run_event(
                run_id,
                EventType::WorkerToolStarted,
                json!({"job_id": job_id, "tool_name": "ssh_exec", "args_preview": "{}"}),
            )
            .await
            .unwrap();
        events
            .append_run_event(
                run_id,
                EventType::WorkerToolCompleted,
                json!({
                    "job_id": job_id,
                    "tool_name": "ssh_exec",
                    "duration_ms": 12,
                    "result_preview": "Result: 42 deploys found",
                }),
            )
            .await
            .unwrap();
    });

    let mut monitor = RoundaboutMonitor::new(
        f.db.clone(),
        &f.events,
        f.artifacts.clone(),
        job.id,
        OwnerId::new(1),
        Some(f.run_id),
        options(5_000),
    );
    let result = monitor.wait_for_completion().await;

    assert_eq!(result.status, RoundaboutStatus::EarlyExit);
    assert!(result.worker_still_running);
    assert!(result.summary.as_deref().unwrap().contains("Final answer pattern"));
    assert_eq!(result.decision, Some(foreman_monitor::Decision::Exit));
}

#[tokio::test]
async fn monitor_timeout_preserves_worker_still_running() {
    let f = fixture().await;
    let job = running_job(&f, None).await;

    let mut monitor = RoundaboutMonitor::new(
        f.db.clone(),
        &f.events,
        f.artifacts.clone(),
        job.id,
        OwnerId::new(1),
        Some(f.run_id),
        options(80),
    );
    let result = monitor.wait_for_completion().await;

    assert_eq!(result.status, RoundaboutStatus::MonitorTimeout);
    assert!(result.worker_still_running);
    assert!(result.error.as_deref().unwrap().contains("Monitor timeout"));

    let formatted = format_roundabout_result(&result);
    assert!(formatted.contains("STILL RUNNING"));
}

#[tokio::test]
async fn failed_worker_reports_error_and_artifact_hint() {
    let f = fixture().await;
    let job = running_job(&f, None).await;
    f.db.finish_job(job.id, JobStatus::Failed, None, Some("boom".into()))
        .await
        .unwrap();

    let mut monitor = RoundaboutMonitor::new(
        f.db.clone(),
        &f.events,
        f.artifacts.clone(),
        job.id,
        OwnerId::new(1),
        Some(f.run_id),
        options(5_000),
    );
    let result = monitor.wait_for_completion().await;

    assert_eq!(result.status, RoundaboutStatus::Failed);
    assert_eq!(result.error.as_deref(), Some("boom"));
    let formatted = format_roundabout_result(&result);
    assert!(formatted.contains("failed"));
    assert!(formatted.contains("read_worker_file"));
}

#[tokio::test]
async fn unknown_job_fails_fast() {
    let f = fixture().await;
    let mut monitor = RoundaboutMonitor::new(
        f.db.clone(),
        &f.events,
        f.artifacts.clone(),
        foreman_types::JobId::new(999),
        OwnerId::new(1),
        Some(f.run_id),
        options(5_000),
    );
    let result = monitor.wait_for_completion().await;
    assert_eq!(result.status, RoundaboutStatus::Failed);
    assert_eq!(result.error.as_deref(), Some("Job not found"));
}

#[tokio::test]
async fn owner_scoping_hides_other_owners_jobs() {
    let f = fixture().await;
    let job = running_job(&f, None).await;

    // A different owner monitoring the same job id sees nothing.
    let mut monitor = RoundaboutMonitor::new(
        f.db.clone(),
        &f.events,
        f.artifacts.clone(),
        job.id,
        OwnerId::new(42),
        Some(f.run_id),
        options(5_000),
    );
    let result = monitor.wait_for_completion().await;
    assert_eq!(result.status, RoundaboutStatus::Failed);
    assert_eq!(result.error.as_deref(), Some("Job not found"));
}
