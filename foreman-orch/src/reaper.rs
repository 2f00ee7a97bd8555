//! The reaper: barrier deadlines and orphaned jobs.

use std::time::Duration;

use chrono::Utc;
use foreman_types::JobStatus;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::orchestrator::Orchestrator;

/// What one reaper pass did.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReaperStats {
    /// Expired barriers resolved with partial results.
    pub reaped: usize,
    /// Orphaned `created` jobs failed.
    pub orphans_cleaned: usize,
}

impl Orchestrator {
    /// One reaper pass: resolve expired barriers with partial results
    /// and fail orphaned `created` jobs whose barrier never committed.
    pub async fn reap_once(&self) -> ReaperStats {
        let now = Utc::now();
        let mut stats = ReaperStats::default();

        // Claiming flips the barrier to `resuming` and times out the
        // outstanding children atomically, so a concurrent completion
        // either beat us or sees the claim and skips.
        let claimed = self.db.claim_expired_barriers(now).await;
        for (barrier, results) in claimed {
            let timed_out = results
                .iter()
                .filter(|r| r.status == foreman_types::BarrierJobStatus::Timeout)
                .count();
            info!(
                run_id = %barrier.run_id,
                timed_out,
                total = results.len(),
                "reaping expired barrier"
            );
            if let Err(err) = self.resume_supervisor_batch(barrier.run_id, results).await {
                error!(run_id = %barrier.run_id, %err, "reaper resume failed");
            }
            stats.reaped += 1;
        }

        // Orphans: `created` jobs past the cutoff with no barrier child.
        // The barrier commit failed, so nothing will ever flip them.
        let cutoff = now
            - chrono::Duration::from_std(self.settings.orphan_job_cutoff)
                .unwrap_or_else(|_| chrono::Duration::minutes(5));
        for job in self.db.orphaned_created_jobs(cutoff).await {
            warn!(job_id = %job.id, "failing orphaned job stuck in created");
            if let Err(err) = self
                .db
                .finish_job(
                    job.id,
                    JobStatus::Failed,
                    None,
                    Some("Orphaned job - barrier creation failed".into()),
                )
                .await
            {
                warn!(job_id = %job.id, %err, "failed to fail orphaned job");
                continue;
            }
            stats.orphans_cleaned += 1;
        }

        stats
    }

    /// Background reaper loop.
    #[must_use]
    pub fn spawn_reaper(&self, interval: Duration) -> JoinHandle<()> {
        let orch = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                orch.reap_once().await;
            }
        })
    }
}
