//! Registry operations

use chrono::Utc;
use sqlx::Row;

use crate::error::DbError;
use crate::models::{NewRegistry, PackageFormat, Registry, UpdateRegistry, Upstream};
use crate::repository::Database;
use crate::utils::format_datetime;

const REGISTRY_COLUMNS: &str =
    "id, group_id, package_format, name, description, created_at, updated_at";

impl Database {
    // ==================== Registry Operations ====================

    /// Insert a registry with its default cleanup policy.
    ///
    /// The count check and the insert run as one statement, so concurrent
    /// creates cannot push a group past `max_count`. Returns `None` when
    /// the group already holds `max_count` registries of this format.
    pub async fn insert_registry(
        &self,
        registry: NewRegistry,
        max_count: i64,
    ) -> Result<Option<Registry>, DbError> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            r#"
            INSERT INTO registries (group_id, package_format, name, description,
                                    created_at, updated_at)
            SELECT ?, ?, ?, ?, ?, ?
            WHERE (SELECT COUNT(*) FROM registries
                   WHERE group_id = ? AND package_format = ?) < ?
            RETURNING id
            "#,
        )
        .bind(registry.group_id)
        .bind(registry.package_format.as_str())
        .bind(&registry.name)
        .bind(&registry.description)
        .bind(format_datetime(now))
        .bind(format_datetime(now))
        .bind(registry.group_id)
        .bind(registry.package_format.as_str())
        .bind(max_count)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = result else {
            return Ok(None);
        };
        let id: i64 = row.get("id");

        Self::insert_default_cleanup_policy(&mut tx, id, registry.group_id).await?;
        tx.commit().await?;

        Ok(Some(Registry {
            id,
            group_id: registry.group_id,
            package_format: registry.package_format,
            name: registry.name,
            description: registry.description,
            created_at: now,
            updated_at: now,
        }))
    }

    /// Get a registry by ID
    pub async fn get_registry(&self, id: i64) -> Result<Option<Registry>, DbError> {
        let sql = format!("SELECT {} FROM registries WHERE id = ?", REGISTRY_COLUMNS);
        let result = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        result
            .map(|row| Registry::try_from(&row).map_err(DbError::from))
            .transpose()
    }

    /// List a group's registries, optionally restricted to one format
    pub async fn list_registries(
        &self,
        group_id: i64,
        package_format: Option<PackageFormat>,
    ) -> Result<Vec<Registry>, DbError> {
        let rows = match package_format {
            Some(format) => {
                let sql = format!(
                    "SELECT {} FROM registries WHERE group_id = ? AND package_format = ? ORDER BY name ASC",
                    REGISTRY_COLUMNS
                );
                sqlx::query(&sql)
                    .bind(group_id)
                    .bind(format.as_str())
                    .fetch_all(&self.pool)
                    .await?
            }
            None => {
                let sql = format!(
                    "SELECT {} FROM registries WHERE group_id = ? ORDER BY name ASC",
                    REGISTRY_COLUMNS
                );
                sqlx::query(&sql)
                    .bind(group_id)
                    .fetch_all(&self.pool)
                    .await?
            }
        };

        rows.iter()
            .map(|row| Registry::try_from(row).map_err(DbError::from))
            .collect()
    }

    /// Update a registry's name and description
    pub async fn update_registry(
        &self,
        id: i64,
        update: UpdateRegistry,
    ) -> Result<Option<Registry>, DbError> {
        let mut updates = vec!["updated_at = ?"];
        if update.name.is_some() {
            updates.push("name = ?");
        }
        if update.description.is_some() {
            updates.push("description = ?");
        }

        if updates.len() == 1 {
            return self.get_registry(id).await;
        }

        let sql = format!("UPDATE registries SET {} WHERE id = ?", updates.join(", "));
        let mut query = sqlx::query(&sql).bind(format_datetime(Utc::now()));
        if let Some(v) = update.name {
            query = query.bind(v);
        }
        if let Some(v) = update.description {
            query = query.bind(v);
        }

        let result = query.bind(id).execute(&self.pool).await?;
        if result.rows_affected() == 0 {
            return Ok(None);
        }

        self.get_registry(id).await
    }

    /// Delete a registry.
    ///
    /// Removes the registry's links, its cleanup policy, every upstream
    /// that no other registry references, and the registry row itself, in
    /// one transaction. Returns the removed exclusive upstreams so the
    /// caller can schedule their cache purge, or `None` if the registry
    /// did not exist.
    pub async fn delete_registry(&self, id: i64) -> Result<Option<Vec<Upstream>>, DbError> {
        let mut tx = self.pool.begin().await?;

        let exists = sqlx::query("SELECT 1 FROM registries WHERE id = ?")
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?
            .is_some();
        if !exists {
            return Ok(None);
        }

        let exclusive = Self::exclusive_upstreams_on(&mut *tx, id).await?;

        sqlx::query("DELETE FROM registry_upstreams WHERE registry_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;

        sqlx::query("DELETE FROM cleanup_policies WHERE registry_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;

        for upstream in &exclusive {
            sqlx::query("DELETE FROM upstreams WHERE id = ?")
                .bind(upstream.id)
                .execute(&mut *tx)
                .await?;
        }

        sqlx::query("DELETE FROM registries WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(Some(exclusive))
    }
}
