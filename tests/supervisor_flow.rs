//! End-to-end supervisor flows: happy path, parallel mixed outcomes,
//! timeout deferral, empty responses, and the cancellation race.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{Reply, RouterProvider, harness, harness_with_settings, test_settings, wait_for_run_status};
use foreman_events::EventType;
use foreman_orch::SupervisorRunOptions;
use foreman_types::{
    BarrierStatus, JobStatus, OwnerId, Role, RunStatus, Settings, ToolCall,
};
use serde_json::json;

#[tokio::test]
async fn scenario_single_worker_happy_path() {
    let provider = Arc::new(
        RouterProvider::new()
            .route("Worker completed:", vec![Reply::Text("All clean.")])
            .route("character summary", vec![Reply::Text("3 deploys fetched, none failed")])
            .route("Fetch deploys", vec![Reply::Text("Deploys fetched: 3 today, none failed.")])
            .route(
                "Summarize today's deploys",
                vec![Reply::ToolCalls(vec![ToolCall::new(
                    "tc1",
                    "spawn_worker",
                    json!({"task": "Fetch deploys", "model": "m"}),
                )])],
            ),
    );
    let h = harness(provider);
    let owner = OwnerId::new(1);

    let turn = h
        .orch
        .run_supervisor(owner, "Summarize today's deploys", SupervisorRunOptions::default())
        .await
        .unwrap();
    assert_eq!(turn.status, RunStatus::Waiting);
    let run_id = turn.run_id;

    // One job, keyed by the spawn call, eligible only after the commit.
    let jobs = h.db.jobs_for_run(run_id).await;
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].tool_call_id, "tc1");
    assert_eq!(jobs[0].status, JobStatus::Queued);
    assert_eq!(jobs[0].model, "m");

    let barrier = h.db.get_barrier(run_id).await.unwrap();
    assert_eq!(barrier.expected_count, 1);
    assert_eq!(barrier.status, BarrierStatus::Waiting);

    assert_eq!(h.orch.process_queued_jobs_once().await, 1);
    wait_for_run_status(&h.db, run_id, RunStatus::Success).await;

    let barrier = h.db.get_barrier(run_id).await.unwrap();
    assert_eq!(barrier.completed_count, 1);
    assert_eq!(barrier.status, BarrierStatus::Completed);

    // Thread tail: user, assistant(tool_calls=[tc1]), tool reply, final.
    let messages = h.db.messages_for_thread(turn.thread_id).await;
    let tail: Vec<_> = messages.iter().rev().take(4).collect();
    assert_eq!(tail[3].role, Role::User);
    assert_eq!(tail[3].content, "Summarize today's deploys");
    assert_eq!(tail[2].role, Role::Assistant);
    assert_eq!(tail[2].tool_calls.as_ref().unwrap()[0].id, "tc1");
    assert_eq!(tail[1].role, Role::Tool);
    assert_eq!(tail[1].tool_call_id.as_deref(), Some("tc1"));
    assert_eq!(tail[1].name.as_deref(), Some("spawn_worker"));
    assert!(tail[1].content.starts_with("Worker completed:"));
    assert_eq!(tail[0].role, Role::Assistant);
    assert_eq!(tail[0].content, "All clean.");
    // The tool reply groups under its issuing assistant message.
    assert_eq!(tail[1].parent_id, Some(tail[2].id));

    // Lifecycle events landed, including the worker bundle evidence.
    for event_type in [
        EventType::SupervisorStarted,
        EventType::SupervisorWaiting,
        EventType::WorkerSpawned,
        EventType::WorkerStarted,
        EventType::WorkerComplete,
        EventType::SupervisorResumed,
        EventType::SupervisorComplete,
    ] {
        assert_eq!(
            h.events.count_for_run(run_id, event_type).await,
            1,
            "expected exactly one {event_type:?}"
        );
    }

    // The worker's bundle holds the result.
    let job = h.db.get_job(jobs[0].id).await.unwrap();
    let worker_id = job.worker_id.unwrap();
    let result = h.artifacts.worker_result(&worker_id).await.unwrap();
    assert_eq!(result, "Deploys fetched: 3 today, none failed.");
    let metadata = h.artifacts.worker_metadata(&worker_id).await.unwrap();
    assert_eq!(metadata.status.status, "success");
    assert_eq!(metadata.summary.as_deref(), Some("3 deploys fetched, none failed"));
}

#[tokio::test]
async fn scenario_parallel_workers_with_mixed_outcomes() {
    let provider = Arc::new(
        RouterProvider::new()
            .route("Worker completed:", vec![Reply::Text("Combined the three reports.")])
            .route(
                "character summary",
                vec![Reply::Text("A ok"), Reply::Text("C ok")],
            )
            .route("Fetch alpha", vec![Reply::Text("A ok")])
            .route("Check beta", vec![Reply::Fail("boom")])
            .route("Scan gamma", vec![Reply::Text("C ok")])
            .route(
                "run the three probes",
                vec![Reply::ToolCalls(vec![
                    ToolCall::new("a", "spawn_worker", json!({"task": "Fetch alpha"})),
                    ToolCall::new("b", "spawn_worker", json!({"task": "Check beta"})),
                    ToolCall::new("c", "spawn_worker", json!({"task": "Scan gamma"})),
                ])],
            ),
    );
    let h = harness(provider);
    let owner = OwnerId::new(1);

    let turn = h
        .orch
        .run_supervisor(owner, "run the three probes", SupervisorRunOptions::default())
        .await
        .unwrap();
    assert_eq!(turn.status, RunStatus::Waiting);
    let run_id = turn.run_id;

    assert_eq!(h.db.barrier_children(run_id).await.len(), 3);
    assert_eq!(h.orch.process_queued_jobs_once().await, 3);
    wait_for_run_status(&h.db, run_id, RunStatus::Success).await;

    // Exactly one batch resume regardless of completion interleaving.
    assert_eq!(
        h.events.count_for_run(run_id, EventType::SupervisorResumed).await,
        1
    );

    // Tool replies appended in the assistant's call order a, b, c.
    let messages = h.db.messages_for_thread(turn.thread_id).await;
    let tool_replies: Vec<_> = messages.iter().filter(|m| m.role == Role::Tool).collect();
    assert_eq!(tool_replies.len(), 3);
    let ids: Vec<&str> = tool_replies
        .iter()
        .filter_map(|m| m.tool_call_id.as_deref())
        .collect();
    assert_eq!(ids, vec!["a", "b", "c"]);
    assert!(tool_replies[0].content.starts_with("Worker completed:"));
    assert!(tool_replies[1].content.starts_with("Worker failed:\n\nError:"));
    assert!(tool_replies[1].content.contains("Partial result:"));
    assert!(tool_replies[2].content.starts_with("Worker completed:"));

    assert_eq!(
        messages.last().unwrap().content,
        "Combined the three reports."
    );

    // Per-run event sequence is strictly monotonic and unique.
    let events = h.events.events_for_run(run_id).await;
    for pair in events.windows(2) {
        assert!(pair[1].seq > pair[0].seq, "seq must strictly increase");
    }
}

#[tokio::test]
async fn scenario_timeout_defers_then_finishes_in_background() {
    let provider = Arc::new(RouterProvider::new().route_delayed(
        "slow question",
        Duration::from_millis(300),
        vec![Reply::Text("Took a while, but here it is.")],
    ));
    let settings = Settings {
        run_timeout: Duration::from_millis(80),
        ..test_settings()
    };
    let h = harness_with_settings(provider, settings);
    let owner = OwnerId::new(1);

    let turn = h
        .orch
        .run_supervisor(owner, "slow question", SupervisorRunOptions::detached())
        .await
        .unwrap();
    assert_eq!(turn.status, RunStatus::Deferred);
    let run_id = turn.run_id;

    // The deferral event carries the attach url and keeps identity.
    let deferred = h.events.events_for_run(run_id).await;
    let deferred_event = deferred
        .iter()
        .find(|e| e.event_type == EventType::SupervisorDeferred)
        .unwrap();
    assert!(
        deferred_event.payload["attach_url"]
            .as_str()
            .unwrap()
            .contains(&format!("{run_id}"))
    );

    // The work was not cancelled: the run finalizes on its own.
    wait_for_run_status(&h.db, run_id, RunStatus::Success).await;
    assert_eq!(
        h.events.count_for_run(run_id, EventType::SupervisorComplete).await,
        1
    );
    let messages = h.db.messages_for_thread(turn.thread_id).await;
    assert_eq!(
        messages.last().unwrap().content,
        "Took a while, but here it is."
    );
}

#[tokio::test]
async fn scenario_empty_llm_response_twice_is_not_a_system_failure() {
    let provider = Arc::new(
        RouterProvider::new().route("say nothing", vec![Reply::Text(""), Reply::Text("")]),
    );
    let h = harness(provider);
    let owner = OwnerId::new(1);

    let turn = h
        .orch
        .run_supervisor(owner, "say nothing", SupervisorRunOptions::default())
        .await
        .unwrap();

    // By design this completes the run; the synthetic assistant message
    // carries the explanation.
    assert_eq!(turn.status, RunStatus::Success);
    let messages = h.db.messages_for_thread(turn.thread_id).await;
    assert!(
        messages
            .last()
            .unwrap()
            .content
            .contains("empty response twice")
    );
}

#[tokio::test]
async fn scenario_external_cancellation_is_not_overwritten() {
    let provider = Arc::new(
        RouterProvider::new()
            .route("Worker failed:", vec![Reply::Text("Noted the cancellation.")])
            .route("character summary", vec![Reply::Text("long haul done")])
            .route_delayed(
                "long haul",
                Duration::from_millis(150),
                vec![Reply::Text("Finished the long haul.")],
            )
            .route(
                "start the long job",
                vec![Reply::ToolCalls(vec![ToolCall::new(
                    "tc1",
                    "spawn_worker",
                    json!({"task": "long haul"}),
                )])],
            ),
    );
    let h = harness(provider);
    let owner = OwnerId::new(1);

    let turn = h
        .orch
        .run_supervisor(owner, "start the long job", SupervisorRunOptions::default())
        .await
        .unwrap();
    let run_id = turn.run_id;
    let job_id = h.db.jobs_for_run(run_id).await[0].id;

    h.orch.process_queued_jobs_once().await;
    // Cancel externally while the worker's LLM call is still in flight.
    tokio::time::sleep(Duration::from_millis(40)).await;
    h.db.update_job(job_id, |j| {
        j.status = JobStatus::Cancelled;
        j.error = Some("cancelled by user".into());
    })
    .await
    .unwrap();

    wait_for_run_status(&h.db, run_id, RunStatus::Success).await;

    // Cleanup observed the cancellation and kept it.
    let job = h.db.get_job(job_id).await.unwrap();
    assert_eq!(job.status, JobStatus::Cancelled);
    assert_eq!(job.error.as_deref(), Some("cancelled by user"));

    // The supervisor received a failed-equivalent reply carrying the
    // cancellation and resumed normally.
    let messages = h.db.messages_for_thread(turn.thread_id).await;
    let reply = messages
        .iter()
        .find(|m| m.role == Role::Tool && m.tool_call_id.as_deref() == Some("tc1"))
        .unwrap();
    assert!(reply.content.starts_with("Worker failed:"));
    assert!(reply.content.contains("cancelled by user"));
    assert_eq!(messages.last().unwrap().content, "Noted the cancellation.");
}

#[tokio::test]
async fn recursive_interrupt_rebuilds_the_barrier() {
    let provider = Arc::new(
        RouterProvider::new()
            .route(
                "Worker completed:",
                vec![
                    Reply::ToolCalls(vec![ToolCall::new(
                        "w2",
                        "spawn_worker",
                        json!({"task": "second probe"}),
                    )]),
                    Reply::Text("Both probes done."),
                ],
            )
            .route(
                "character summary",
                vec![Reply::Text("probe one fine"), Reply::Text("probe two fine")],
            )
            .route("first probe", vec![Reply::Text("Probe one done.")])
            .route("second probe", vec![Reply::Text("Probe two done.")])
            .route(
                "round two please",
                vec![Reply::ToolCalls(vec![ToolCall::new(
                    "w1",
                    "spawn_worker",
                    json!({"task": "first probe"}),
                )])],
            ),
    );
    let h = harness(provider);
    let owner = OwnerId::new(1);

    let turn = h
        .orch
        .run_supervisor(owner, "round two please", SupervisorRunOptions::default())
        .await
        .unwrap();
    let run_id = turn.run_id;
    assert_eq!(turn.status, RunStatus::Waiting);

    // A background dispatcher picks up each batch as its barrier commit
    // makes it eligible; the resume of worker one spawns worker two.
    let processor = h.orch.spawn_job_processor(Duration::from_millis(10));
    wait_for_run_status(&h.db, run_id, RunStatus::Success).await;
    processor.abort();

    assert_eq!(h.db.jobs_for_run(run_id).await.len(), 2);

    // The rebuilt barrier tracks only the second batch's child.
    let children = h.db.barrier_children(run_id).await;
    assert_eq!(children.len(), 1);
    assert_eq!(children[0].tool_call_id, "w2");

    assert_eq!(
        h.events.count_for_run(run_id, EventType::SupervisorResumed).await,
        2
    );
    assert_eq!(
        h.events.count_for_run(run_id, EventType::SupervisorWaiting).await,
        2
    );
    let messages = h.db.messages_for_thread(turn.thread_id).await;
    assert_eq!(messages.last().unwrap().content, "Both probes done.");
}
