//! Background jobs
//!
//! An in-process, at-least-once queue. A job with a dedup key is dropped
//! on enqueue while an equal job is still queued or running; the key is
//! released once the job finishes, so a later miss can trigger it again.

mod fetch;
mod purge;
mod reclaim;
mod scheduler;

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use metrics::counter;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};
use vreg_db::Database;
use vreg_proxy::UpstreamClient;
use vreg_storage::StorageBackend;

use crate::cache::{CacheEntryService, DownloadCounter};
use crate::cleanup::CleanupService;
use crate::error::CoreError;
use crate::settings::{CoreSettings, MAX_JOB_ATTEMPTS};

pub use scheduler::{schedule_due_cleanups, spawn_cleanup_scheduler, spawn_reclaimer};

/// Work the background workers know how to do
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Job {
    /// Download one object from an upstream and cache it
    FetchObject {
        upstream_id: i64,
        relative_path: String,
    },
    /// Mark every live entry of a removed upstream for destruction
    PurgeUpstreamCache { upstream_id: i64, group_id: i64 },
    /// Run a registry's cleanup policy
    ExecuteCleanupPolicy { registry_id: i64 },
    /// Write buffered download counts
    FlushDownloadCounters,
    /// Remove blobs and rows of entries pending destruction
    DestroyPendingEntries,
}

impl Job {
    /// Key under which concurrent duplicates collapse
    pub fn dedup_key(&self) -> Option<String> {
        match self {
            Job::FetchObject {
                upstream_id,
                relative_path,
            } => Some(format!("fetch:{}:{}", upstream_id, relative_path)),
            Job::PurgeUpstreamCache { upstream_id, .. } => Some(format!("purge:{}", upstream_id)),
            Job::ExecuteCleanupPolicy { registry_id } => Some(format!("cleanup:{}", registry_id)),
            Job::FlushDownloadCounters => None,
            Job::DestroyPendingEntries => Some("reclaim".to_string()),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Job::FetchObject { .. } => "fetch_object",
            Job::PurgeUpstreamCache { .. } => "purge_upstream_cache",
            Job::ExecuteCleanupPolicy { .. } => "execute_cleanup_policy",
            Job::FlushDownloadCounters => "flush_download_counters",
            Job::DestroyPendingEntries => "destroy_pending_entries",
        }
    }

    /// Whether a failed run is re-enqueued.
    ///
    /// Fetches are best effort and the next miss retries them; cleanup
    /// records its own failure; the counter reschedules its own flush.
    fn is_retryable(&self) -> bool {
        matches!(
            self,
            Job::PurgeUpstreamCache { .. } | Job::DestroyPendingEntries
        )
    }
}

/// A job as it travels through the queue
#[derive(Debug)]
pub struct QueuedJob {
    pub job: Job,
    pub attempt: u32,
    dedup_key: Option<String>,
}

struct QueueInner {
    sender: mpsc::UnboundedSender<QueuedJob>,
    in_flight: Mutex<HashSet<String>>,
    pending: AtomicUsize,
}

/// Producer side of the job queue
#[derive(Clone)]
pub struct JobQueue {
    inner: Arc<QueueInner>,
}

/// Consumer side of the job queue
pub struct JobReceiver {
    receiver: mpsc::UnboundedReceiver<QueuedJob>,
}

impl JobReceiver {
    pub async fn recv(&mut self) -> Option<QueuedJob> {
        self.receiver.recv().await
    }

    /// Take the next job if one is already queued
    pub fn try_recv(&mut self) -> Option<QueuedJob> {
        self.receiver.try_recv().ok()
    }
}

impl JobQueue {
    pub fn new() -> (Self, JobReceiver) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let queue = Self {
            inner: Arc::new(QueueInner {
                sender,
                in_flight: Mutex::new(HashSet::new()),
                pending: AtomicUsize::new(0),
            }),
        };
        (queue, JobReceiver { receiver })
    }

    /// Enqueue a job. Returns `false` when an equal job is already in
    /// flight or the workers are gone.
    pub fn enqueue(&self, job: Job) -> bool {
        self.enqueue_attempt(job, 1)
    }

    fn enqueue_attempt(&self, job: Job, attempt: u32) -> bool {
        let dedup_key = job.dedup_key();
        if let Some(key) = &dedup_key {
            if !self.inner.in_flight.lock().insert(key.clone()) {
                debug!(job = job.name(), key = %key, "Dropping duplicate job");
                counter!("vreg_jobs_deduplicated_total", "job" => job.name()).increment(1);
                return false;
            }
        }

        let name = job.name();
        let queued = QueuedJob {
            job,
            attempt,
            dedup_key,
        };
        self.inner.pending.fetch_add(1, Ordering::SeqCst);

        if let Err(mpsc::error::SendError(rejected)) = self.inner.sender.send(queued) {
            warn!(job = name, "Job queue is closed, dropping job");
            self.complete(&rejected);
            return false;
        }
        true
    }

    /// Enqueue a job after `delay`
    pub fn enqueue_delayed(&self, job: Job, delay: Duration) {
        self.schedule(job, 1, delay);
    }

    fn schedule(&self, job: Job, attempt: u32, delay: Duration) {
        let queue = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.enqueue_attempt(job, attempt);
        });
    }

    /// Jobs queued or running
    pub fn pending(&self) -> usize {
        self.inner.pending.load(Ordering::SeqCst)
    }

    /// Release a finished job's dedup key
    pub fn complete(&self, queued: &QueuedJob) {
        if let Some(key) = &queued.dedup_key {
            self.inner.in_flight.lock().remove(key);
        }
        self.inner.pending.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Executes jobs against the database, storage and upstreams
pub struct JobRunner {
    db: Database,
    storage: Arc<dyn StorageBackend>,
    client: Arc<UpstreamClient>,
    queue: JobQueue,
    counter: Arc<DownloadCounter>,
    entries: CacheEntryService,
    cleanup: CleanupService,
    settings: CoreSettings,
}

impl JobRunner {
    pub fn new(
        db: Database,
        storage: Arc<dyn StorageBackend>,
        client: Arc<UpstreamClient>,
        queue: JobQueue,
        counter: Arc<DownloadCounter>,
        settings: CoreSettings,
    ) -> Self {
        let entries = CacheEntryService::new(db.clone(), storage.clone(), settings.clone());
        let cleanup = CleanupService::new(db.clone(), settings.clone());
        Self {
            db,
            storage,
            client,
            queue,
            counter,
            entries,
            cleanup,
            settings,
        }
    }

    /// Run one job to completion
    pub async fn run(&self, job: &Job) -> Result<(), CoreError> {
        match job {
            Job::FetchObject {
                upstream_id,
                relative_path,
            } => self.fetch_object(*upstream_id, relative_path).await,
            Job::PurgeUpstreamCache {
                upstream_id,
                group_id,
            } => self.purge_upstream_cache(*upstream_id, *group_id).await,
            Job::ExecuteCleanupPolicy { registry_id } => {
                self.cleanup.execute(*registry_id).await.map(|_| ())
            }
            Job::FlushDownloadCounters => self.counter.flush(&self.db).await.map(|_| ()),
            Job::DestroyPendingEntries => self.reclaim_pending_entries().await.map(|_| ()),
        }
    }

    /// Run a dequeued job, record its outcome and release its key
    pub async fn process(&self, queued: QueuedJob) {
        let name = queued.job.name();
        let result = self.run(&queued.job).await;
        self.queue.complete(&queued);

        match result {
            Ok(()) => {
                counter!("vreg_jobs_total", "job" => name, "outcome" => "succeeded").increment(1);
            }
            Err(e) => {
                counter!("vreg_jobs_total", "job" => name, "outcome" => "failed").increment(1);
                if queued.job.is_retryable() && queued.attempt < MAX_JOB_ATTEMPTS {
                    warn!(
                        job = name,
                        attempt = queued.attempt,
                        error = %e,
                        "Job failed, retrying"
                    );
                    self.queue
                        .schedule(queued.job, queued.attempt + 1, self.settings.job_retry_delay);
                } else {
                    error!(job = name, attempt = queued.attempt, error = %e, "Job failed");
                }
            }
        }
    }

    /// Process everything already queued. Delayed jobs that have not been
    /// enqueued yet are left alone.
    pub async fn drain(&self, receiver: &mut JobReceiver) -> usize {
        let mut processed = 0;
        while let Some(queued) = receiver.try_recv() {
            self.process(queued).await;
            processed += 1;
        }
        processed
    }
}

/// Start `count` workers sharing one receiver
pub fn spawn_workers(
    runner: Arc<JobRunner>,
    receiver: JobReceiver,
    count: usize,
) -> Vec<JoinHandle<()>> {
    let receiver = Arc::new(tokio::sync::Mutex::new(receiver));

    (0..count.max(1))
        .map(|worker| {
            let runner = runner.clone();
            let receiver = receiver.clone();
            tokio::spawn(async move {
                loop {
                    let next = receiver.lock().await.recv().await;
                    let Some(queued) = next else {
                        break;
                    };
                    debug!(worker, job = queued.job.name(), "Running job");
                    runner.process(queued).await;
                }
                debug!(worker, "Job worker stopped");
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fetch(path: &str) -> Job {
        Job::FetchObject {
            upstream_id: 1,
            relative_path: path.to_string(),
        }
    }

    #[tokio::test]
    async fn test_duplicate_jobs_collapse_until_complete() {
        let (queue, mut receiver) = JobQueue::new();

        assert!(queue.enqueue(fetch("a.pom")));
        assert!(!queue.enqueue(fetch("a.pom")));
        assert!(queue.enqueue(fetch("b.pom")));
        assert_eq!(queue.pending(), 2);

        let first = receiver.try_recv().unwrap();
        assert_eq!(first.job, fetch("a.pom"));
        queue.complete(&first);
        assert_eq!(queue.pending(), 1);

        // Key released, the same miss may trigger again
        assert!(queue.enqueue(fetch("a.pom")));
    }

    #[tokio::test]
    async fn test_flush_jobs_are_not_deduplicated() {
        let (queue, _receiver) = JobQueue::new();
        assert!(queue.enqueue(Job::FlushDownloadCounters));
        assert!(queue.enqueue(Job::FlushDownloadCounters));
        assert_eq!(queue.pending(), 2);
    }

    #[tokio::test]
    async fn test_enqueue_after_receiver_dropped() {
        let (queue, receiver) = JobQueue::new();
        drop(receiver);
        assert!(!queue.enqueue(Job::DestroyPendingEntries));
        assert_eq!(queue.pending(), 0);
        assert!(queue.inner.in_flight.lock().is_empty());
    }

    #[tokio::test]
    async fn test_enqueue_delayed() {
        let (queue, mut receiver) = JobQueue::new();
        queue.enqueue_delayed(Job::FlushDownloadCounters, Duration::from_millis(50));

        tokio::task::yield_now().await;
        assert!(receiver.try_recv().is_none());

        let queued = tokio::time::timeout(Duration::from_secs(5), receiver.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(queued.job, Job::FlushDownloadCounters);
    }

    #[test]
    fn test_dedup_keys() {
        assert_eq!(fetch("a/b.pom").dedup_key().as_deref(), Some("fetch:1:a/b.pom"));
        assert_eq!(
            Job::PurgeUpstreamCache {
                upstream_id: 4,
                group_id: 1
            }
            .dedup_key()
            .as_deref(),
            Some("purge:4")
        );
        assert_eq!(Job::FlushDownloadCounters.dedup_key(), None);
    }
}
