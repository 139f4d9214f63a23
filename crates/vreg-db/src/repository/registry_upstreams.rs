//! Registry upstream chain operations

use chrono::Utc;
use sqlx::{Row, Sqlite, SqliteConnection, Transaction};

use crate::error::DbError;
use crate::models::{RegistryUpstream, Upstream};
use crate::repository::Database;
use crate::utils::format_datetime;

const LINK_COLUMNS: &str = "id, group_id, registry_id, upstream_id, position, created_at";

const JOINED_UPSTREAM_COLUMNS: &str = r#"
    u.id, u.group_id, u.package_format, u.name, u.description, u.url,
    u.cache_validity_hours, u.username, u.password, u.created_at, u.updated_at
"#;

impl Database {
    // ==================== Registry Upstream Operations ====================

    /// Append an upstream to the end of a registry's chain.
    ///
    /// The position is computed as `max + 1` inside the insert itself, and
    /// the insert only happens while the chain holds fewer than
    /// `max_upstreams` links. Returns `None` when the chain is full. Two
    /// concurrent appends can still collide on `(registry_id, position)`;
    /// that surfaces as [`DbError::UniqueViolation`] for the caller to retry.
    pub async fn insert_registry_upstream(
        &self,
        group_id: i64,
        registry_id: i64,
        upstream_id: i64,
        max_upstreams: i64,
    ) -> Result<Option<RegistryUpstream>, DbError> {
        let now = Utc::now();
        let result = sqlx::query(
            r#"
            INSERT INTO registry_upstreams (group_id, registry_id, upstream_id, position, created_at)
            SELECT ?, ?, ?,
                   (SELECT COALESCE(MAX(position), 0) + 1
                    FROM registry_upstreams WHERE registry_id = ?),
                   ?
            WHERE (SELECT COUNT(*) FROM registry_upstreams WHERE registry_id = ?) < ?
            RETURNING id, position
            "#,
        )
        .bind(group_id)
        .bind(registry_id)
        .bind(upstream_id)
        .bind(registry_id)
        .bind(format_datetime(now))
        .bind(registry_id)
        .bind(max_upstreams)
        .fetch_optional(&self.pool)
        .await?;

        Ok(result.map(|row| RegistryUpstream {
            id: row.get("id"),
            group_id,
            registry_id,
            upstream_id,
            position: row.get("position"),
            created_at: now,
        }))
    }

    /// Get the link between a registry and an upstream
    pub async fn get_registry_upstream(
        &self,
        registry_id: i64,
        upstream_id: i64,
    ) -> Result<Option<RegistryUpstream>, DbError> {
        let sql = format!(
            "SELECT {} FROM registry_upstreams WHERE registry_id = ? AND upstream_id = ?",
            LINK_COLUMNS
        );
        let result = sqlx::query(&sql)
            .bind(registry_id)
            .bind(upstream_id)
            .fetch_optional(&self.pool)
            .await?;

        result
            .map(|row| RegistryUpstream::try_from(&row).map_err(DbError::from))
            .transpose()
    }

    /// List a registry's links in position order
    pub async fn list_registry_upstreams(
        &self,
        registry_id: i64,
    ) -> Result<Vec<RegistryUpstream>, DbError> {
        let sql = format!(
            "SELECT {} FROM registry_upstreams WHERE registry_id = ? ORDER BY position ASC",
            LINK_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(registry_id)
            .fetch_all(&self.pool)
            .await?;

        rows.iter()
            .map(|row| RegistryUpstream::try_from(row).map_err(DbError::from))
            .collect()
    }

    /// List the upstreams of a registry, highest priority first
    pub async fn list_registry_chain(&self, registry_id: i64) -> Result<Vec<Upstream>, DbError> {
        let sql = format!(
            r#"
            SELECT {}
            FROM upstreams u
            JOIN registry_upstreams ru ON ru.upstream_id = u.id
            WHERE ru.registry_id = ?
            ORDER BY ru.position ASC
            "#,
            JOINED_UPSTREAM_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(registry_id)
            .fetch_all(&self.pool)
            .await?;

        rows.iter()
            .map(|row| Upstream::try_from(row).map_err(DbError::from))
            .collect()
    }

    /// Upstreams referenced by this registry and by no other registry
    pub async fn exclusive_upstreams(&self, registry_id: i64) -> Result<Vec<Upstream>, DbError> {
        let mut conn = self.pool.acquire().await?;
        Self::exclusive_upstreams_on(&mut *conn, registry_id).await
    }

    pub(crate) async fn exclusive_upstreams_on(
        conn: &mut SqliteConnection,
        registry_id: i64,
    ) -> Result<Vec<Upstream>, DbError> {
        let sql = format!(
            r#"
            SELECT {}
            FROM upstreams u
            JOIN registry_upstreams ru ON ru.upstream_id = u.id
            WHERE ru.registry_id = ?
              AND NOT EXISTS (
                  SELECT 1 FROM registry_upstreams other
                  WHERE other.upstream_id = u.id AND other.registry_id != ?
              )
            ORDER BY ru.position ASC
            "#,
            JOINED_UPSTREAM_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(registry_id)
            .bind(registry_id)
            .fetch_all(&mut *conn)
            .await?;

        rows.iter()
            .map(|row| Upstream::try_from(row).map_err(DbError::from))
            .collect()
    }

    /// Remove an upstream from a registry's chain and close the gap
    pub async fn delete_registry_upstream(
        &self,
        registry_id: i64,
        upstream_id: i64,
    ) -> Result<bool, DbError> {
        let mut tx = self.pool.begin().await?;

        let result =
            sqlx::query("DELETE FROM registry_upstreams WHERE registry_id = ? AND upstream_id = ?")
                .bind(registry_id)
                .bind(upstream_id)
                .execute(&mut *tx)
                .await?;

        if result.rows_affected() == 0 {
            return Ok(false);
        }

        Self::compact_positions(&mut tx, registry_id).await?;
        tx.commit().await?;
        Ok(true)
    }

    /// Move an upstream to `position` within its registry's chain.
    ///
    /// `position` is clamped to `[1, n]`. Returns the renumbered chain, or
    /// `None` when the upstream is not linked to the registry.
    pub async fn move_registry_upstream(
        &self,
        registry_id: i64,
        upstream_id: i64,
        position: i64,
    ) -> Result<Option<Vec<RegistryUpstream>>, DbError> {
        let mut tx = self.pool.begin().await?;

        let mut ordered = Self::ordered_link_ids(&mut tx, registry_id).await?;
        let Some(current) = ordered.iter().position(|(_, u)| *u == upstream_id) else {
            return Ok(None);
        };

        let moved = ordered.remove(current);
        let target = (position.max(1) as usize - 1).min(ordered.len());
        ordered.insert(target, moved);

        Self::renumber(&mut tx, registry_id, &ordered).await?;
        tx.commit().await?;

        self.list_registry_upstreams(registry_id).await.map(Some)
    }

    /// Renumber a registry's links to `1..n`, preserving their order
    pub(crate) async fn compact_positions(
        tx: &mut Transaction<'_, Sqlite>,
        registry_id: i64,
    ) -> Result<(), DbError> {
        let ordered = Self::ordered_link_ids(tx, registry_id).await?;
        Self::renumber(tx, registry_id, &ordered).await
    }

    /// `(link id, upstream id)` pairs in current position order
    async fn ordered_link_ids(
        tx: &mut Transaction<'_, Sqlite>,
        registry_id: i64,
    ) -> Result<Vec<(i64, i64)>, DbError> {
        let rows = sqlx::query(
            "SELECT id, upstream_id FROM registry_upstreams WHERE registry_id = ? ORDER BY position ASC",
        )
        .bind(registry_id)
        .fetch_all(&mut **tx)
        .await?;

        Ok(rows
            .iter()
            .map(|row| (row.get("id"), row.get("upstream_id")))
            .collect())
    }

    async fn renumber(
        tx: &mut Transaction<'_, Sqlite>,
        registry_id: i64,
        ordered: &[(i64, i64)],
    ) -> Result<(), DbError> {
        // Park every row on a negative position first so the
        // (registry_id, position) index never sees a transient duplicate.
        sqlx::query("UPDATE registry_upstreams SET position = -id WHERE registry_id = ?")
            .bind(registry_id)
            .execute(&mut **tx)
            .await?;

        for (index, (link_id, _)) in ordered.iter().enumerate() {
            sqlx::query("UPDATE registry_upstreams SET position = ? WHERE id = ?")
                .bind(index as i64 + 1)
                .bind(link_id)
                .execute(&mut **tx)
                .await?;
        }
        Ok(())
    }
}
