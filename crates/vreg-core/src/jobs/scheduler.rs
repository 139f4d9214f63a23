//! Periodic triggers for cleanup and reclaim

use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, info, warn};

use crate::cleanup::CleanupService;
use crate::error::CoreError;
use crate::jobs::{Job, JobQueue};

/// Enqueue one cleanup job per due policy.
///
/// Interrupted runs are failed first so their policies become due again.
/// Returns the number of jobs enqueued.
pub async fn schedule_due_cleanups(
    cleanup: &CleanupService,
    queue: &JobQueue,
) -> Result<usize, CoreError> {
    cleanup.recover_stale_runs().await?;

    let mut scheduled = 0;
    for registry_id in cleanup.due_registries(Utc::now()).await? {
        if queue.enqueue(Job::ExecuteCleanupPolicy { registry_id }) {
            scheduled += 1;
        }
    }
    Ok(scheduled)
}

/// Spawn a background task that enqueues due cleanup runs
pub fn spawn_cleanup_scheduler(
    cleanup: CleanupService,
    queue: JobQueue,
    period: Duration,
) -> JoinHandle<()> {
    info!("Starting cleanup scheduler (interval: {:?})", period);

    tokio::spawn(async move {
        let mut ticker = interval(period);

        // Skip the first tick (which fires immediately)
        ticker.tick().await;

        loop {
            ticker.tick().await;

            match schedule_due_cleanups(&cleanup, &queue).await {
                Ok(0) => {}
                Ok(scheduled) => info!("Scheduled {} cleanup runs", scheduled),
                Err(e) => warn!("Error scheduling cleanup runs: {}", e),
            }
        }
    })
}

/// Spawn a background task that periodically reclaims pending entries
pub fn spawn_reclaimer(queue: JobQueue, period: Duration) -> JoinHandle<()> {
    info!("Starting cache reclaimer (interval: {:?})", period);

    tokio::spawn(async move {
        let mut ticker = interval(period);
        ticker.tick().await;

        loop {
            ticker.tick().await;
            if !queue.enqueue(Job::DestroyPendingEntries) {
                debug!("Reclaim still in progress, skipping tick");
            }
        }
    })
}
