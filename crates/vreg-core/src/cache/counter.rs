//! Deferred download accounting
//!
//! Downloads are counted in memory and written in one transaction by a
//! flush job that runs shortly after the first unflushed increment.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tracing::{debug, warn};
use vreg_db::{Database, DownloadIncrement};

use crate::error::CoreError;
use crate::jobs::{Job, JobQueue};

#[derive(Default)]
struct CounterState {
    pending: HashMap<i64, (i64, DateTime<Utc>)>,
    flush_scheduled: bool,
}

/// Buffers per-entry download counts until the next flush
pub struct DownloadCounter {
    queue: JobQueue,
    flush_delay: Duration,
    state: Mutex<CounterState>,
}

impl DownloadCounter {
    pub fn new(queue: JobQueue, flush_delay: Duration) -> Self {
        Self {
            queue,
            flush_delay,
            state: Mutex::new(CounterState::default()),
        }
    }

    /// Count one download of an entry
    pub fn increment(&self, entry_id: i64) {
        self.record(entry_id, 1, Utc::now());
    }

    fn record(&self, entry_id: i64, count: i64, at: DateTime<Utc>) {
        let schedule = {
            let mut state = self.state.lock();
            let slot = state.pending.entry(entry_id).or_insert((0, at));
            slot.0 += count;
            if at > slot.1 {
                slot.1 = at;
            }
            !std::mem::replace(&mut state.flush_scheduled, true)
        };

        if schedule {
            self.queue
                .enqueue_delayed(Job::FlushDownloadCounters, self.flush_delay);
        }
    }

    /// Entries with unflushed downloads
    pub fn pending_entries(&self) -> usize {
        self.state.lock().pending.len()
    }

    /// Write every buffered increment.
    ///
    /// On failure the increments go back into the buffer and another
    /// flush is scheduled.
    pub async fn flush(&self, db: &Database) -> Result<u64, CoreError> {
        let increments: Vec<DownloadIncrement> = {
            let mut state = self.state.lock();
            state.flush_scheduled = false;
            state
                .pending
                .drain()
                .map(|(entry_id, (count, downloaded_at))| DownloadIncrement {
                    entry_id,
                    count,
                    downloaded_at,
                })
                .collect()
        };

        if increments.is_empty() {
            return Ok(0);
        }

        match db.apply_download_increments(&increments).await {
            Ok(updated) => {
                debug!(entries = increments.len(), updated, "Flushed download counters");
                Ok(updated)
            }
            Err(e) => {
                warn!(entries = increments.len(), error = %e, "Failed to flush download counters");
                for inc in &increments {
                    self.record(inc.entry_id, inc.count, inc.downloaded_at);
                }
                Err(e.into())
            }
        }
    }
}
