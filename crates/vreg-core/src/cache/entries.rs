//! Race-safe cache entry writes

use std::sync::Arc;

use bytes::Bytes;
use metrics::counter;
use tracing::{debug, warn};
use vreg_db::{
    CacheEntry, CacheEntryFields, CacheEntryQuery, CacheEntryStatus, Database, NewCacheEntry,
    Upstream,
};
use vreg_storage::StorageBackend;

use crate::digest::generate_object_storage_key;
use crate::error::{CoreError, ValidationErrors};
use crate::settings::{CoreSettings, MAX_UPSERT_ATTEMPTS};
use crate::validation::validate_cache_entry;

/// Object content and metadata to cache
#[derive(Debug, Clone)]
pub struct CacheEntryPayload {
    pub file: Bytes,
    pub file_name: String,
    pub file_sha1: String,
    pub file_md5: Option<String>,
    pub upstream_etag: Option<String>,
    /// Falls back to the format's default when absent
    pub content_type: Option<String>,
}

/// Writes and reads cache entries and their blobs
#[derive(Clone)]
pub struct CacheEntryService {
    db: Database,
    storage: Arc<dyn StorageBackend>,
    settings: CoreSettings,
}

impl CacheEntryService {
    pub fn new(db: Database, storage: Arc<dyn StorageBackend>, settings: CoreSettings) -> Self {
        Self {
            db,
            storage,
            settings,
        }
    }

    fn fields_for(&self, upstream: &Upstream, payload: &CacheEntryPayload) -> CacheEntryFields {
        let content_type = payload
            .content_type
            .as_deref()
            .map(str::trim)
            .filter(|ct| !ct.is_empty())
            .unwrap_or(upstream.package_format.default_content_type())
            .to_string();

        CacheEntryFields {
            file_name: payload.file_name.clone(),
            file_sha1: payload.file_sha1.clone(),
            file_md5: if self.settings.restricted_cryptography {
                None
            } else {
                payload.file_md5.as_deref().map(str::to_ascii_lowercase)
            },
            size: payload.file.len() as i64,
            upstream_etag: payload.upstream_etag.clone(),
            content_type,
        }
    }

    /// Create or update the live entry for `(upstream, relative_path)`.
    ///
    /// Concurrent callers for the same path all succeed and leave exactly
    /// one live row behind. A lost insert race is retried as an update of
    /// the winner's row; validation failures are returned without retry.
    ///
    /// Updates rewrite the blob under the row's existing key and then
    /// commit the new checksums only if the row's version is unchanged
    /// since it was read. A writer whose bytes landed before a competing
    /// commit fails that check and writes again, so the committed row
    /// always describes the bytes stored last.
    pub async fn upsert(
        &self,
        upstream: &Upstream,
        group_id: i64,
        relative_path: &str,
        payload: CacheEntryPayload,
    ) -> Result<CacheEntry, CoreError> {
        if group_id != upstream.group_id {
            return Err(ValidationErrors::single("group_id", "must match the upstream's group").into());
        }

        let fields = self.fields_for(upstream, &payload);
        // Only used if this call ends up inserting the row
        let new_key =
            generate_object_storage_key(upstream.package_format, group_id, upstream.id);
        validate_cache_entry(relative_path, &new_key, &fields).into_result()?;

        // Live row whose blob we replaced without committing our checksums
        let mut uncommitted_write = None;

        for attempt in 1..=MAX_UPSERT_ATTEMPTS {
            match self.db.get_live_cache_entry(upstream.id, relative_path).await? {
                Some(existing) => {
                    // The key stays with the row for its whole life
                    self.storage
                        .write(&existing.object_storage_key, payload.file.clone())
                        .await?;
                    if let Some(entry) = self
                        .db
                        .update_live_cache_entry(existing.id, existing.version, &fields)
                        .await?
                    {
                        counter!("vreg_cache_upserts_total", "operation" => "update").increment(1);
                        debug!(
                            entry_id = entry.id,
                            version = entry.version,
                            upstream_id = upstream.id,
                            path = %relative_path,
                            "Updated cache entry"
                        );
                        return Ok(entry);
                    }
                    uncommitted_write = Some(existing.id);
                }
                None => {
                    self.storage.write(&new_key, payload.file.clone()).await?;
                    let new_entry = NewCacheEntry {
                        group_id,
                        upstream_id: upstream.id,
                        package_format: upstream.package_format,
                        relative_path: relative_path.to_string(),
                        object_storage_key: new_key.clone(),
                        fields: fields.clone(),
                    };
                    match self.db.insert_cache_entry(new_entry).await {
                        Ok(Some(entry)) => {
                            counter!("vreg_cache_upserts_total", "operation" => "insert")
                                .increment(1);
                            debug!(
                                entry_id = entry.id,
                                upstream_id = upstream.id,
                                path = %relative_path,
                                "Created cache entry"
                            );
                            return Ok(entry);
                        }
                        Ok(None) => {
                            self.discard_blob(&new_key).await;
                            return Err(CoreError::NotFound(format!("upstream {}", upstream.id)));
                        }
                        Err(e) if e.is_unique_violation() => {
                            self.discard_blob(&new_key).await;
                        }
                        Err(e) => {
                            self.discard_blob(&new_key).await;
                            return Err(e.into());
                        }
                    }
                }
            }

            counter!("vreg_cache_upsert_conflicts_total").increment(1);
            debug!(
                upstream_id = upstream.id,
                path = %relative_path,
                attempt,
                "Cache entry write lost a race, retrying"
            );
        }

        // The row may now point at our bytes with someone else's checksums
        if let Some(entry_id) = uncommitted_write {
            warn!(
                entry_id,
                upstream_id = upstream.id,
                path = %relative_path,
                "Giving up on contended cache entry, marking it for destruction"
            );
            self.db
                .set_cache_entry_status(entry_id, CacheEntryStatus::PendingDestruction)
                .await?;
        }

        Err(CoreError::Conflict(format!(
            "cache entry for upstream {} path {} kept changing",
            upstream.id, relative_path
        )))
    }

    async fn discard_blob(&self, key: &str) {
        if let Err(e) = self.storage.delete(key).await {
            warn!(key = %key, error = %e, "Failed to discard blob");
        }
    }

    pub async fn get(&self, id: i64) -> Result<CacheEntry, CoreError> {
        self.db
            .get_cache_entry(id)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("cache entry {}", id)))
    }

    /// Read the blob behind an entry
    pub async fn read(&self, entry: &CacheEntry) -> Result<Bytes, CoreError> {
        Ok(self.storage.read(&entry.object_storage_key).await?)
    }

    /// Page through an upstream's live entries
    pub async fn list(&self, query: CacheEntryQuery) -> Result<(Vec<CacheEntry>, i64), CoreError> {
        Ok(self.db.list_cache_entries(query.validated()).await?)
    }
}
