//! Fetch-on-miss

use metrics::counter;
use tracing::{debug, warn};
use vreg_proxy::{FetchOutcome, FetchRequest};

use crate::cache::CacheEntryPayload;
use crate::digest::checksums_for;
use crate::error::CoreError;
use crate::jobs::JobRunner;
use crate::validation::HEADER_VALUE_MAX_LENGTH;

/// Last segment of a relative path
fn file_name_of(relative_path: &str) -> String {
    relative_path
        .trim_end_matches('/')
        .rsplit('/')
        .next()
        .unwrap_or(relative_path)
        .to_string()
}

/// Drop header values too long to store
fn storable(value: Option<String>) -> Option<String> {
    value.filter(|v| v.chars().count() <= HEADER_VALUE_MAX_LENGTH)
}

impl JobRunner {
    /// Download one object and cache it.
    ///
    /// Upstream failures are logged and swallowed: nothing is cached and
    /// the next miss schedules a fresh attempt.
    pub(crate) async fn fetch_object(
        &self,
        upstream_id: i64,
        relative_path: &str,
    ) -> Result<(), CoreError> {
        let Some(upstream) = self.db.get_upstream(upstream_id).await? else {
            debug!(upstream_id, path = %relative_path, "Upstream is gone, skipping fetch");
            return Ok(());
        };

        let existing = self
            .db
            .get_live_cache_entry(upstream_id, relative_path)
            .await?;

        let request = FetchRequest {
            base_url: &upstream.url,
            relative_path,
            username: upstream.username.as_deref(),
            password: upstream.password.as_deref(),
            etag: existing.as_ref().and_then(|e| e.upstream_etag.as_deref()),
        };

        let outcome = match self.client.fetch(request).await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(upstream_id, path = %relative_path, error = %e, "Upstream fetch failed");
                counter!("vreg_upstream_fetches_total", "outcome" => "failed").increment(1);
                return Ok(());
            }
        };

        match outcome {
            FetchOutcome::NotModified => {
                if let Some(entry) = existing {
                    self.db.touch_upstream_checked_at(entry.id).await?;
                }
                debug!(upstream_id, path = %relative_path, "Upstream copy not modified");
                counter!("vreg_upstream_fetches_total", "outcome" => "not_modified").increment(1);
            }
            FetchOutcome::Fetched(object) => {
                let checksums = checksums_for(&object, self.settings.restricted_cryptography);
                let payload = CacheEntryPayload {
                    file: object.body,
                    file_name: file_name_of(relative_path),
                    file_sha1: checksums.sha1,
                    file_md5: checksums.md5,
                    upstream_etag: storable(object.etag),
                    content_type: storable(object.content_type),
                };

                let entry = match self
                    .entries
                    .upsert(&upstream, upstream.group_id, relative_path, payload)
                    .await
                {
                    Ok(entry) => entry,
                    // Removed while the download was in flight
                    Err(CoreError::NotFound(_)) => {
                        debug!(upstream_id, path = %relative_path, "Upstream is gone, dropping fetched object");
                        return Ok(());
                    }
                    Err(e) => return Err(e),
                };
                self.counter.increment(entry.id);
                counter!("vreg_upstream_fetches_total", "outcome" => "fetched").increment(1);
            }
        }

        Ok(())
    }
}
