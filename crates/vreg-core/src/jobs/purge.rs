//! Purge of a removed upstream's cache

use metrics::counter;
use tracing::info;

use crate::error::CoreError;
use crate::jobs::JobRunner;

impl JobRunner {
    /// Mark all live entries of an upstream for destruction.
    ///
    /// Entries already marked are left alone, so redelivery is harmless.
    pub(crate) async fn purge_upstream_cache(
        &self,
        upstream_id: i64,
        group_id: i64,
    ) -> Result<(), CoreError> {
        let marked = self.db.mark_upstream_cache_entries(upstream_id).await?;
        counter!("vreg_purge_marked_entries_total").increment(marked);
        info!(upstream_id, group_id, marked, "Purged upstream cache");
        Ok(())
    }
}
