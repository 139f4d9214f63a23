//! Cache entry operations

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::Row;
use std::str::FromStr;

use crate::error::DbError;
use crate::models::{
    CacheEntry, CacheEntryFields, CacheEntryStatus, MarkedEntry, NewCacheEntry, PackageFormat,
};
use crate::repository::Database;
use crate::utils::format_datetime;

const CACHE_ENTRY_COLUMNS: &str = r#"
    id, group_id, upstream_id, package_format, relative_path, object_storage_key,
    file_name, file_sha1, file_md5, size, upstream_etag, content_type,
    downloads_count, downloaded_at, upstream_checked_at, status, version, created_at, updated_at
"#;

/// Pending download counter increment for one entry
#[derive(Debug, Clone, Copy)]
pub struct DownloadIncrement {
    pub entry_id: i64,
    pub count: i64,
    pub downloaded_at: DateTime<Utc>,
}

impl Database {
    // ==================== Cache Entry Operations ====================

    /// Insert a new live cache entry.
    ///
    /// Returns `None` without writing when the upstream no longer exists,
    /// so a fetch that outlives its upstream cannot leave an unreachable
    /// row behind. Fails with [`DbError::UniqueViolation`] when a live
    /// entry already exists for the same `(upstream_id, relative_path)`.
    pub async fn insert_cache_entry(
        &self,
        entry: NewCacheEntry,
    ) -> Result<Option<CacheEntry>, DbError> {
        let now = Utc::now();
        let fields = &entry.fields;
        let result = sqlx::query(
            r#"
            INSERT INTO cache_entries (group_id, upstream_id, package_format, relative_path,
                                       object_storage_key, file_name, file_sha1, file_md5, size,
                                       upstream_etag, content_type, downloads_count,
                                       upstream_checked_at, status, version, created_at, updated_at)
            SELECT ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 0, ?, 'default', 0, ?, ?
            WHERE EXISTS (SELECT 1 FROM upstreams WHERE id = ?)
            RETURNING id
            "#,
        )
        .bind(entry.group_id)
        .bind(entry.upstream_id)
        .bind(entry.package_format.as_str())
        .bind(&entry.relative_path)
        .bind(&entry.object_storage_key)
        .bind(&fields.file_name)
        .bind(&fields.file_sha1)
        .bind(&fields.file_md5)
        .bind(fields.size)
        .bind(&fields.upstream_etag)
        .bind(&fields.content_type)
        .bind(format_datetime(now))
        .bind(format_datetime(now))
        .bind(format_datetime(now))
        .bind(entry.upstream_id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = result else {
            return Ok(None);
        };
        let id: i64 = row.get("id");
        let fields = entry.fields;

        Ok(Some(CacheEntry {
            id,
            group_id: entry.group_id,
            upstream_id: entry.upstream_id,
            package_format: entry.package_format,
            relative_path: entry.relative_path,
            object_storage_key: entry.object_storage_key,
            file_name: fields.file_name,
            file_sha1: fields.file_sha1,
            file_md5: fields.file_md5,
            size: fields.size,
            upstream_etag: fields.upstream_etag,
            content_type: fields.content_type,
            downloads_count: 0,
            downloaded_at: None,
            upstream_checked_at: now,
            status: CacheEntryStatus::Default,
            version: 0,
            created_at: now,
            updated_at: now,
        }))
    }

    /// Get a cache entry by ID, in any status
    pub async fn get_cache_entry(&self, id: i64) -> Result<Option<CacheEntry>, DbError> {
        let sql = format!("SELECT {} FROM cache_entries WHERE id = ?", CACHE_ENTRY_COLUMNS);
        let result = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        result
            .map(|row| CacheEntry::try_from(&row).map_err(DbError::from))
            .transpose()
    }

    /// Get the live entry for an upstream path
    pub async fn get_live_cache_entry(
        &self,
        upstream_id: i64,
        relative_path: &str,
    ) -> Result<Option<CacheEntry>, DbError> {
        let sql = format!(
            r#"
            SELECT {} FROM cache_entries
            WHERE upstream_id = ? AND relative_path = ? AND status = 'default'
            "#,
            CACHE_ENTRY_COLUMNS
        );
        let result = sqlx::query(&sql)
            .bind(upstream_id)
            .bind(relative_path)
            .fetch_optional(&self.pool)
            .await?;

        result
            .map(|row| CacheEntry::try_from(&row).map_err(DbError::from))
            .transpose()
    }

    /// Overwrite the payload of a live entry still at `expected_version`.
    ///
    /// The storage key and download counters are left alone and the
    /// version is bumped. Returns `None` when the row is gone, no longer
    /// live or was updated by someone else since it was read; callers
    /// treat that as a lost race.
    pub async fn update_live_cache_entry(
        &self,
        id: i64,
        expected_version: i64,
        fields: &CacheEntryFields,
    ) -> Result<Option<CacheEntry>, DbError> {
        let now = format_datetime(Utc::now());
        let sql = format!(
            r#"
            UPDATE cache_entries
            SET file_name = ?, file_sha1 = ?, file_md5 = ?, size = ?, upstream_etag = ?,
                content_type = ?, upstream_checked_at = ?, updated_at = ?, version = version + 1
            WHERE id = ? AND status = 'default' AND version = ?
            RETURNING {}
            "#,
            CACHE_ENTRY_COLUMNS
        );
        let result = sqlx::query(&sql)
            .bind(&fields.file_name)
            .bind(&fields.file_sha1)
            .bind(&fields.file_md5)
            .bind(fields.size)
            .bind(&fields.upstream_etag)
            .bind(&fields.content_type)
            .bind(&now)
            .bind(&now)
            .bind(id)
            .bind(expected_version)
            .fetch_optional(&self.pool)
            .await?;

        result
            .map(|row| CacheEntry::try_from(&row).map_err(DbError::from))
            .transpose()
    }

    /// Record a successful revalidation against the upstream
    pub async fn touch_upstream_checked_at(&self, id: i64) -> Result<bool, DbError> {
        let now = format_datetime(Utc::now());
        let result = sqlx::query(
            r#"
            UPDATE cache_entries
            SET upstream_checked_at = ?, updated_at = ?
            WHERE id = ? AND status = 'default'
            "#,
        )
        .bind(&now)
        .bind(&now)
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Apply buffered download counts in one transaction.
    ///
    /// `downloaded_at` only moves forward. Rows that disappeared in the
    /// meantime are skipped. Returns the number of rows touched.
    pub async fn apply_download_increments(
        &self,
        increments: &[DownloadIncrement],
    ) -> Result<u64, DbError> {
        let mut tx = self.pool.begin().await?;
        let mut touched = 0;

        for increment in increments {
            let at = format_datetime(increment.downloaded_at);
            let result = sqlx::query(
                r#"
                UPDATE cache_entries
                SET downloads_count = downloads_count + ?,
                    downloaded_at = CASE
                        WHEN downloaded_at IS NULL OR downloaded_at < ? THEN ?
                        ELSE downloaded_at
                    END
                WHERE id = ?
                "#,
            )
            .bind(increment.count)
            .bind(&at)
            .bind(&at)
            .bind(increment.entry_id)
            .execute(&mut *tx)
            .await?;
            touched += result.rows_affected();
        }

        tx.commit().await?;
        Ok(touched)
    }

    /// Mark a batch of an upstream's expired live entries for destruction.
    ///
    /// An entry is expired when its last download, or its creation if it
    /// was never downloaded, is older than `cutoff`. At most `limit` rows
    /// are marked per call; callers loop until a short batch comes back.
    pub async fn mark_expired_cache_entries(
        &self,
        upstream_id: i64,
        cutoff: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<MarkedEntry>, DbError> {
        let rows = sqlx::query(
            r#"
            UPDATE cache_entries
            SET status = 'pending_destruction', updated_at = ?
            WHERE id IN (
                SELECT id FROM cache_entries
                WHERE upstream_id = ? AND status = 'default'
                  AND COALESCE(downloaded_at, created_at) < ?
                ORDER BY id
                LIMIT ?
            )
            AND status = 'default'
            RETURNING id, package_format, size
            "#,
        )
        .bind(format_datetime(Utc::now()))
        .bind(upstream_id)
        .bind(format_datetime(cutoff))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| -> Result<MarkedEntry, DbError> {
                let format_str: String = row.try_get("package_format")?;
                let package_format = PackageFormat::from_str(&format_str)
                    .map_err(|e| DbError::Decode(e.to_string()))?;
                Ok(MarkedEntry {
                    id: row.try_get("id")?,
                    package_format,
                    size: row.try_get("size")?,
                })
            })
            .collect()
    }

    /// Mark every live entry of an upstream for destruction.
    ///
    /// Already-marked entries are not touched, so repeated calls are
    /// harmless. Returns the number of newly marked entries.
    pub async fn mark_upstream_cache_entries(&self, upstream_id: i64) -> Result<u64, DbError> {
        let result = sqlx::query(
            r#"
            UPDATE cache_entries
            SET status = 'pending_destruction', updated_at = ?
            WHERE upstream_id = ? AND status = 'default'
            "#,
        )
        .bind(format_datetime(Utc::now()))
        .bind(upstream_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    /// Oldest entries awaiting physical removal
    pub async fn list_pending_destruction(&self, limit: i64) -> Result<Vec<CacheEntry>, DbError> {
        let sql = format!(
            r#"
            SELECT {} FROM cache_entries
            WHERE status = 'pending_destruction'
            ORDER BY id ASC
            LIMIT ?
            "#,
            CACHE_ENTRY_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;

        rows.iter()
            .map(|row| CacheEntry::try_from(row).map_err(DbError::from))
            .collect()
    }

    /// Set an entry's status
    pub async fn set_cache_entry_status(
        &self,
        id: i64,
        status: CacheEntryStatus,
    ) -> Result<bool, DbError> {
        let result = sqlx::query("UPDATE cache_entries SET status = ?, updated_at = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(format_datetime(Utc::now()))
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Hard-delete a cache entry row
    pub async fn delete_cache_entry(&self, id: i64) -> Result<bool, DbError> {
        let result = sqlx::query("DELETE FROM cache_entries WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Get cache statistics
    pub async fn get_cache_stats(&self) -> Result<CacheStats, DbError> {
        let row = sqlx::query(
            r#"
            SELECT
                COALESCE(SUM(CASE WHEN status = 'default' THEN size ELSE 0 END), 0) as live_size,
                COALESCE(SUM(CASE WHEN status = 'default' THEN 1 ELSE 0 END), 0) as live_count,
                COALESCE(SUM(CASE WHEN status = 'pending_destruction' THEN 1 ELSE 0 END), 0) as pending_count,
                COALESCE(SUM(CASE WHEN status = 'error' THEN 1 ELSE 0 END), 0) as error_count
            FROM cache_entries
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(CacheStats {
            live_size: row.get("live_size"),
            live_count: row.get("live_count"),
            pending_destruction_count: row.get("pending_count"),
            error_count: row.get("error_count"),
        })
    }
}

/// Cache statistics
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CacheStats {
    pub live_size: i64,
    pub live_count: i64,
    pub pending_destruction_count: i64,
    pub error_count: i64,
}

/// Query parameters for listing an upstream's cache entries
#[derive(Debug, Clone, Default)]
pub struct CacheEntryQuery {
    pub upstream_id: i64,
    /// Substring of `relative_path`
    pub search: Option<String>,
    /// Pagination offset (must be non-negative)
    pub offset: i64,
    /// Pagination limit, clamped to `[1, 100]`
    pub limit: i64,
}

impl CacheEntryQuery {
    /// Validates and normalizes the query parameters
    pub fn validated(mut self) -> Self {
        if self.offset < 0 {
            self.offset = 0;
        }
        self.limit = self.limit.clamp(1, 100);
        if let Some(search) = &self.search {
            if search.trim().is_empty() {
                self.search = None;
            }
        }
        self
    }
}

/// Escape LIKE wildcards so the search term matches literally
fn like_pattern(search: &str) -> String {
    let mut escaped = String::with_capacity(search.len() + 2);
    escaped.push('%');
    for c in search.chars() {
        if matches!(c, '%' | '_' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped.push('%');
    escaped
}

impl Database {
    /// List live cache entries of one upstream with search and pagination
    pub async fn list_cache_entries(
        &self,
        query: CacheEntryQuery,
    ) -> Result<(Vec<CacheEntry>, i64), DbError> {
        let query = query.validated();

        let mut where_clause = "WHERE upstream_id = ? AND status = 'default'".to_string();
        let pattern = query.search.as_deref().map(like_pattern);
        if pattern.is_some() {
            where_clause.push_str(r" AND relative_path LIKE ? ESCAPE '\'");
        }

        // Get total count
        let count_sql = format!(
            "SELECT COUNT(*) as count FROM cache_entries {}",
            where_clause
        );
        let mut count_query = sqlx::query(&count_sql).bind(query.upstream_id);
        if let Some(p) = &pattern {
            count_query = count_query.bind(p);
        }
        let total: i64 = count_query.fetch_one(&self.pool).await?.get("count");

        let sql = format!(
            r#"
            SELECT {} FROM cache_entries
            {}
            ORDER BY relative_path ASC
            LIMIT ? OFFSET ?
            "#,
            CACHE_ENTRY_COLUMNS, where_clause
        );
        let mut entries_query = sqlx::query(&sql).bind(query.upstream_id);
        if let Some(p) = &pattern {
            entries_query = entries_query.bind(p);
        }
        entries_query = entries_query.bind(query.limit).bind(query.offset);

        let rows = entries_query.fetch_all(&self.pool).await?;
        let entries: Result<Vec<CacheEntry>, _> = rows
            .iter()
            .map(|row| CacheEntry::try_from(row).map_err(DbError::from))
            .collect();

        Ok((entries?, total))
    }
}
