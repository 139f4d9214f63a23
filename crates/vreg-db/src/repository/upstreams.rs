//! Upstream operations

use chrono::Utc;
use sqlx::Row;

use crate::error::DbError;
use crate::models::{NewUpstream, UpdateUpstream, Upstream};
use crate::repository::Database;
use crate::utils::format_datetime;

const UPSTREAM_COLUMNS: &str = r#"
    id, group_id, package_format, name, description, url, cache_validity_hours,
    username, password, created_at, updated_at
"#;

impl Database {
    // ==================== Upstream Operations ====================

    /// Insert a new upstream
    pub async fn insert_upstream(&self, upstream: NewUpstream) -> Result<Upstream, DbError> {
        let now = Utc::now();
        let result = sqlx::query(
            r#"
            INSERT INTO upstreams (group_id, package_format, name, description, url,
                                   cache_validity_hours, username, password,
                                   created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            RETURNING id
            "#,
        )
        .bind(upstream.group_id)
        .bind(upstream.package_format.as_str())
        .bind(&upstream.name)
        .bind(&upstream.description)
        .bind(&upstream.url)
        .bind(upstream.cache_validity_hours)
        .bind(&upstream.username)
        .bind(&upstream.password)
        .bind(format_datetime(now))
        .bind(format_datetime(now))
        .fetch_one(&self.pool)
        .await?;

        let id: i64 = result.get("id");

        Ok(Upstream {
            id,
            group_id: upstream.group_id,
            package_format: upstream.package_format,
            name: upstream.name,
            description: upstream.description,
            url: upstream.url,
            cache_validity_hours: upstream.cache_validity_hours,
            username: upstream.username,
            password: upstream.password,
            created_at: now,
            updated_at: now,
        })
    }

    /// Get an upstream by ID
    pub async fn get_upstream(&self, id: i64) -> Result<Option<Upstream>, DbError> {
        let sql = format!("SELECT {} FROM upstreams WHERE id = ?", UPSTREAM_COLUMNS);
        let result = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        result
            .map(|row| Upstream::try_from(&row).map_err(DbError::from))
            .transpose()
    }

    /// List upstreams owned by a group
    pub async fn list_upstreams(&self, group_id: i64) -> Result<Vec<Upstream>, DbError> {
        let sql = format!(
            "SELECT {} FROM upstreams WHERE group_id = ? ORDER BY name ASC, id ASC",
            UPSTREAM_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(group_id)
            .fetch_all(&self.pool)
            .await?;

        rows.iter()
            .map(|row| Upstream::try_from(row).map_err(DbError::from))
            .collect()
    }

    /// Update an upstream
    pub async fn update_upstream(
        &self,
        id: i64,
        update: UpdateUpstream,
    ) -> Result<Option<Upstream>, DbError> {
        let now = Utc::now();

        // Build dynamic update query
        let mut updates = vec!["updated_at = ?"];

        if update.name.is_some() {
            updates.push("name = ?");
        }
        if update.description.is_some() {
            updates.push("description = ?");
        }
        if update.url.is_some() {
            updates.push("url = ?");
        }
        if update.cache_validity_hours.is_some() {
            updates.push("cache_validity_hours = ?");
        }
        if update.username.is_some() {
            updates.push("username = ?");
        }
        if update.password.is_some() {
            updates.push("password = ?");
        }

        if updates.len() == 1 {
            return self.get_upstream(id).await;
        }

        let sql = format!("UPDATE upstreams SET {} WHERE id = ?", updates.join(", "));
        let mut query = sqlx::query(&sql).bind(format_datetime(now));

        // Bind optional fields in the same order as updates
        if let Some(v) = update.name {
            query = query.bind(v);
        }
        if let Some(v) = update.description {
            query = query.bind(v);
        }
        if let Some(v) = update.url {
            query = query.bind(v);
        }
        if let Some(v) = update.cache_validity_hours {
            query = query.bind(v);
        }
        if let Some(v) = update.username {
            query = query.bind(v);
        }
        if let Some(v) = update.password {
            query = query.bind(v);
        }

        let result = query.bind(id).execute(&self.pool).await?;
        if result.rows_affected() == 0 {
            return Ok(None);
        }

        self.get_upstream(id).await
    }

    /// Delete an upstream together with its registry links.
    ///
    /// Positions of the remaining links in each affected registry are
    /// compacted back to `1..n`. Cache entries are left for the purge job.
    pub async fn delete_upstream(&self, id: i64) -> Result<bool, DbError> {
        let mut tx = self.pool.begin().await?;

        let registry_ids: Vec<i64> =
            sqlx::query("SELECT registry_id FROM registry_upstreams WHERE upstream_id = ?")
                .bind(id)
                .fetch_all(&mut *tx)
                .await?
                .iter()
                .map(|row| row.get("registry_id"))
                .collect();

        sqlx::query("DELETE FROM registry_upstreams WHERE upstream_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;

        for registry_id in registry_ids {
            Self::compact_positions(&mut tx, registry_id).await?;
        }

        let result = sqlx::query("DELETE FROM upstreams WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(result.rows_affected() > 0)
    }
}

#[cfg(test)]
mod tests {
    use crate::models::UpdateUpstream;
    use crate::repository::test_support::*;

    #[tokio::test]
    async fn test_insert_and_get_upstream() {
        let db = db().await;
        let created = upstream(&db, 7, "central").await;

        let fetched = db.get_upstream(created.id).await.unwrap().unwrap();
        assert_eq!(fetched.group_id, 7);
        assert_eq!(fetched.name, "central");
        assert_eq!(fetched.url, "https://repo.example.com/central");
        assert!(db.get_upstream(created.id + 100).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_update_upstream_partial() {
        let db = db().await;
        let created = upstream(&db, 1, "central").await;

        let updated = db
            .update_upstream(
                created.id,
                UpdateUpstream {
                    url: Some("https://mirror.example.com".to_string()),
                    username: Some(None),
                    password: Some(None),
                    ..Default::default()
                },
            )
            .await
            .unwrap()
            .unwrap();

        assert_eq!(updated.url, "https://mirror.example.com");
        assert_eq!(updated.name, "central");
        assert!(updated.username.is_none());

        let missing = db
            .update_upstream(
                999,
                UpdateUpstream {
                    name: Some("x".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert!(missing.is_none());
    }

    #[tokio::test]
    async fn test_list_upstreams_scoped_to_group() {
        let db = db().await;
        upstream(&db, 1, "b").await;
        upstream(&db, 1, "a").await;
        upstream(&db, 2, "other").await;

        let names: Vec<String> = db
            .list_upstreams(1)
            .await
            .unwrap()
            .into_iter()
            .map(|u| u.name)
            .collect();
        assert_eq!(names, vec!["a", "b"]);
        assert_eq!(db.list_upstreams(2).await.unwrap().len(), 1);
    }
}
