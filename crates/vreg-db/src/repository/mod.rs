//! Database repository implementation

use std::str::FromStr;
use std::time::Duration;

use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use tracing::info;

use crate::error::DbError;

// Submodules
mod cache;
mod cleanup_policies;
mod registries;
mod registry_upstreams;
mod upstreams;

pub use cache::{CacheEntryQuery, CacheStats, DownloadIncrement};
pub use cleanup_policies::CleanupRunTotals;

/// Database connection and operations
#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Create a new database connection
    pub async fn new(database_url: &str) -> Result<Self, DbError> {
        info!("Connecting to database: {}", database_url);

        let options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(options)
            .await?;
        let db = Self { pool };
        db.run_migrations().await?;
        Ok(db)
    }

    /// Open a private in-memory database.
    ///
    /// The pool is capped at a single connection since every SQLite
    /// in-memory connection is its own database.
    pub async fn in_memory() -> Result<Self, DbError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;
        let db = Self { pool };
        db.run_migrations().await?;
        Ok(db)
    }

    /// Get the underlying pool for advanced usage
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Cheap liveness probe used by the health endpoint
    pub async fn ping(&self) -> Result<(), DbError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    /// Run database migrations
    async fn run_migrations(&self) -> Result<(), DbError> {
        info!("Running database migrations");

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS upstreams (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                group_id INTEGER NOT NULL,
                package_format TEXT NOT NULL,
                name TEXT NOT NULL,
                description TEXT,
                url TEXT NOT NULL,
                cache_validity_hours INTEGER NOT NULL DEFAULT 24,
                username TEXT,
                password TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_upstreams_group ON upstreams(group_id)")
            .execute(&self.pool)
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS registries (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                group_id INTEGER NOT NULL,
                package_format TEXT NOT NULL,
                name TEXT NOT NULL,
                description TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                UNIQUE (group_id, package_format, name)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        // Positions are range-checked in code; reordering parks rows on
        // negative positions inside a transaction.
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS registry_upstreams (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                group_id INTEGER NOT NULL,
                registry_id INTEGER NOT NULL REFERENCES registries(id) ON DELETE CASCADE,
                upstream_id INTEGER NOT NULL REFERENCES upstreams(id) ON DELETE CASCADE,
                position INTEGER NOT NULL,
                created_at TEXT NOT NULL,
                UNIQUE (registry_id, upstream_id),
                UNIQUE (registry_id, position)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_registry_upstreams_upstream
            ON registry_upstreams(upstream_id)
            "#,
        )
        .execute(&self.pool)
        .await?;

        // upstream_id carries no foreign key: entries outlive their
        // upstream until the purge job marks them.
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS cache_entries (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                group_id INTEGER NOT NULL,
                upstream_id INTEGER NOT NULL,
                package_format TEXT NOT NULL,
                relative_path TEXT NOT NULL,
                object_storage_key TEXT NOT NULL,
                file_name TEXT NOT NULL,
                file_sha1 TEXT NOT NULL,
                file_md5 TEXT,
                size INTEGER NOT NULL,
                upstream_etag TEXT,
                content_type TEXT NOT NULL,
                downloads_count INTEGER NOT NULL DEFAULT 0,
                downloaded_at TEXT,
                upstream_checked_at TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'default',
                version INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        // At most one live entry per (upstream, path)
        sqlx::query(
            r#"
            CREATE UNIQUE INDEX IF NOT EXISTS idx_cache_entries_live_path
            ON cache_entries(upstream_id, relative_path)
            WHERE status = 'default'
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_cache_entries_status
            ON cache_entries(status)
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS cleanup_policies (
                registry_id INTEGER PRIMARY KEY REFERENCES registries(id) ON DELETE CASCADE,
                group_id INTEGER NOT NULL,
                enabled INTEGER NOT NULL DEFAULT 0,
                keep_n_days_after_download INTEGER NOT NULL DEFAULT 30,
                cadence INTEGER NOT NULL DEFAULT 7,
                status TEXT NOT NULL DEFAULT 'idle',
                next_run_at TEXT,
                last_run_at TEXT,
                last_run_deleted_size INTEGER NOT NULL DEFAULT 0,
                last_run_deleted_entries_count INTEGER NOT NULL DEFAULT 0,
                last_run_detailed_metrics TEXT NOT NULL DEFAULT '{}',
                failure_message TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_cleanup_policies_next_run
            ON cleanup_policies(enabled, next_run_at)
            "#,
        )
        .execute(&self.pool)
        .await?;

        info!("Database migrations completed");
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::Database;
    use crate::models::{NewRegistry, NewUpstream, PackageFormat, Registry, Upstream};

    pub async fn db() -> Database {
        Database::in_memory().await.unwrap()
    }

    pub fn new_upstream(group_id: i64, name: &str) -> NewUpstream {
        NewUpstream {
            group_id,
            package_format: PackageFormat::Maven,
            name: name.to_string(),
            description: None,
            url: format!("https://repo.example.com/{}", name),
            cache_validity_hours: 24,
            username: None,
            password: None,
        }
    }

    pub async fn upstream(db: &Database, group_id: i64, name: &str) -> Upstream {
        db.insert_upstream(new_upstream(group_id, name)).await.unwrap()
    }

    pub async fn registry(db: &Database, group_id: i64, name: &str) -> Registry {
        db.insert_registry(
            NewRegistry {
                group_id,
                package_format: PackageFormat::Maven,
                name: name.to_string(),
                description: None,
            },
            20,
        )
        .await
        .unwrap()
        .unwrap()
    }
}
