//! The worker job processor: claims queued jobs and runs them.

use std::time::Duration;

use foreman_store::WorkerJobRecord;
use foreman_types::JobStatus;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::orchestrator::Orchestrator;

impl Orchestrator {
    /// Claim and dispatch every currently-eligible queued job. Each job
    /// runs as its own task; returns how many were dispatched.
    ///
    /// Jobs only become claimable after the barrier commit flips them to
    /// `queued`, and the per-owner concurrency cap bounds how many run
    /// at once.
    pub async fn process_queued_jobs_once(&self) -> usize {
        let mut dispatched = 0;
        while let Some(job) = self
            .db
            .claim_next_queued(self.settings.per_owner_worker_concurrency)
            .await
        {
            dispatched += 1;
            info!(job_id = %job.id, run_id = %job.run_id, "dispatching worker job");
            let orch = self.clone();
            tokio::spawn(async move {
                orch.run_claimed_job(job).await;
            });
        }
        dispatched
    }

    /// Background dispatcher polling for queued jobs.
    #[must_use]
    pub fn spawn_job_processor(&self, poll_interval: Duration) -> JoinHandle<()> {
        let orch = self.clone();
        tokio::spawn(async move {
            loop {
                orch.process_queued_jobs_once().await;
                tokio::time::sleep(poll_interval).await;
            }
        })
    }

    /// Run one claimed job end to end: worker execution, idempotent
    /// job-row reconciliation, then the resume fiber.
    pub(crate) async fn run_claimed_job(&self, job: WorkerJobRecord) {
        let outcome = self.run_worker_job(&job).await;

        // Reconciliation never overwrites a terminal row - a job
        // cancelled externally mid-run keeps its cancellation.
        let final_job = match self
            .db
            .finish_job(
                job.id,
                outcome.status,
                Some(outcome.result.clone()),
                outcome.error.clone(),
            )
            .await
        {
            Ok(final_job) => final_job,
            Err(err) => {
                debug!(job_id = %job.id, %err, "job vanished before reconciliation");
                return;
            }
        };
        if final_job.status == JobStatus::Cancelled {
            debug!(job_id = %job.id, "job was cancelled externally; keeping cancellation");
        }

        // The resume fiber runs as a fresh task with its own context -
        // the worker's identity must not leak into the supervisor's
        // subsequent events.
        let orch = self.clone();
        let summary = outcome.summary.clone();
        tokio::spawn(async move {
            orch.resume_after_worker(final_job, summary).await;
        });
    }
}
