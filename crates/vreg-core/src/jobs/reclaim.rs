//! Physical removal of entries pending destruction

use metrics::counter;
use tracing::{debug, warn};
use vreg_db::CacheEntryStatus;

use crate::error::CoreError;
use crate::jobs::JobRunner;

impl JobRunner {
    /// Delete the blobs of one batch of pending entries, then their rows.
    ///
    /// An entry whose blob cannot be deleted is parked in `error` so the
    /// reclaimer does not trip over it forever.
    pub(crate) async fn reclaim_pending_entries(&self) -> Result<usize, CoreError> {
        let entries = self
            .db
            .list_pending_destruction(self.settings.reclaim_batch_size)
            .await?;

        let mut reclaimed = 0;
        for entry in &entries {
            match self.storage.delete(&entry.object_storage_key).await {
                Ok(_) => {
                    self.db.delete_cache_entry(entry.id).await?;
                    reclaimed += 1;
                }
                Err(e) => {
                    warn!(
                        entry_id = entry.id,
                        key = %entry.object_storage_key,
                        error = %e,
                        "Failed to delete blob, parking entry"
                    );
                    self.db
                        .set_cache_entry_status(entry.id, CacheEntryStatus::Error)
                        .await?;
                    counter!("vreg_reclaim_failures_total").increment(1);
                }
            }
        }

        if reclaimed > 0 {
            counter!("vreg_reclaimed_entries_total").increment(reclaimed as u64);
            debug!(reclaimed, backend = self.storage.name(), "Reclaimed cache entries");
        }
        Ok(reclaimed)
    }
}
