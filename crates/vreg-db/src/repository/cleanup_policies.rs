//! Cleanup policy operations

use chrono::{DateTime, Utc};
use sqlx::{Row, Sqlite, Transaction};

use crate::error::DbError;
use crate::models::{CleanupPolicy, CleanupRunMetrics, UpdateCleanupPolicy};
use crate::repository::Database;
use crate::utils::format_datetime;

const POLICY_COLUMNS: &str = r#"
    registry_id, group_id, enabled, keep_n_days_after_download, cadence, status,
    next_run_at, last_run_at, last_run_deleted_size, last_run_deleted_entries_count,
    last_run_detailed_metrics, failure_message, created_at, updated_at
"#;

/// Totals recorded on a successful cleanup run
#[derive(Debug, Clone, Default)]
pub struct CleanupRunTotals {
    pub deleted_size: i64,
    pub deleted_entries_count: i64,
    pub metrics: CleanupRunMetrics,
}

impl Database {
    // ==================== Cleanup Policy Operations ====================

    /// Create the disabled default policy for a new registry
    pub(crate) async fn insert_default_cleanup_policy(
        tx: &mut Transaction<'_, Sqlite>,
        registry_id: i64,
        group_id: i64,
    ) -> Result<(), DbError> {
        let now = format_datetime(Utc::now());
        sqlx::query(
            r#"
            INSERT INTO cleanup_policies (registry_id, group_id, created_at, updated_at)
            VALUES (?, ?, ?, ?)
            "#,
        )
        .bind(registry_id)
        .bind(group_id)
        .bind(&now)
        .bind(&now)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    /// Get a registry's cleanup policy
    pub async fn get_cleanup_policy(
        &self,
        registry_id: i64,
    ) -> Result<Option<CleanupPolicy>, DbError> {
        let sql = format!(
            "SELECT {} FROM cleanup_policies WHERE registry_id = ?",
            POLICY_COLUMNS
        );
        let result = sqlx::query(&sql)
            .bind(registry_id)
            .fetch_optional(&self.pool)
            .await?;

        result
            .map(|row| CleanupPolicy::try_from(&row).map_err(DbError::from))
            .transpose()
    }

    /// Update a policy's settings.
    ///
    /// `next_run_at` is written only when `Some`; the caller decides when
    /// the schedule moves.
    pub async fn update_cleanup_policy(
        &self,
        registry_id: i64,
        update: &UpdateCleanupPolicy,
        next_run_at: Option<DateTime<Utc>>,
    ) -> Result<Option<CleanupPolicy>, DbError> {
        let mut updates = vec!["updated_at = ?"];
        if update.enabled.is_some() {
            updates.push("enabled = ?");
        }
        if update.keep_n_days_after_download.is_some() {
            updates.push("keep_n_days_after_download = ?");
        }
        if update.cadence.is_some() {
            updates.push("cadence = ?");
        }
        if next_run_at.is_some() {
            updates.push("next_run_at = ?");
        }

        let sql = format!(
            "UPDATE cleanup_policies SET {} WHERE registry_id = ?",
            updates.join(", ")
        );
        let mut query = sqlx::query(&sql).bind(format_datetime(Utc::now()));
        if let Some(v) = update.enabled {
            query = query.bind(v);
        }
        if let Some(v) = update.keep_n_days_after_download {
            query = query.bind(v);
        }
        if let Some(v) = update.cadence {
            query = query.bind(v);
        }
        if let Some(v) = next_run_at {
            query = query.bind(format_datetime(v));
        }

        let result = query.bind(registry_id).execute(&self.pool).await?;
        if result.rows_affected() == 0 {
            return Ok(None);
        }

        self.get_cleanup_policy(registry_id).await
    }

    /// Atomically move an enabled policy that is due at `now` from any
    /// non-running state to `running`. Returns `None` when the policy is
    /// missing, disabled, already running or not yet due.
    pub async fn try_start_cleanup(
        &self,
        registry_id: i64,
        now: DateTime<Utc>,
    ) -> Result<Option<CleanupPolicy>, DbError> {
        let sql = format!(
            r#"
            UPDATE cleanup_policies
            SET status = 'running', failure_message = NULL, updated_at = ?
            WHERE registry_id = ? AND status != 'running' AND enabled = 1
              AND next_run_at IS NOT NULL AND next_run_at <= ?
            RETURNING {}
            "#,
            POLICY_COLUMNS
        );
        let result = sqlx::query(&sql)
            .bind(format_datetime(Utc::now()))
            .bind(registry_id)
            .bind(format_datetime(now))
            .fetch_optional(&self.pool)
            .await?;

        result
            .map(|row| CleanupPolicy::try_from(&row).map_err(DbError::from))
            .transpose()
    }

    /// Record a completed run and return the policy to `idle`.
    ///
    /// Only a policy still `running` is touched; returns `false` when the
    /// run was already closed elsewhere.
    pub async fn finish_cleanup_success(
        &self,
        registry_id: i64,
        finished_at: DateTime<Utc>,
        totals: &CleanupRunTotals,
        next_run_at: DateTime<Utc>,
    ) -> Result<bool, DbError> {
        let metrics = serde_json::to_string(&totals.metrics)?;
        let result = sqlx::query(
            r#"
            UPDATE cleanup_policies
            SET status = 'idle', last_run_at = ?, last_run_deleted_size = ?,
                last_run_deleted_entries_count = ?, last_run_detailed_metrics = ?,
                failure_message = NULL, next_run_at = ?, updated_at = ?
            WHERE registry_id = ? AND status = 'running'
            "#,
        )
        .bind(format_datetime(finished_at))
        .bind(totals.deleted_size)
        .bind(totals.deleted_entries_count)
        .bind(metrics)
        .bind(format_datetime(next_run_at))
        .bind(format_datetime(finished_at))
        .bind(registry_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Record a failed run; the schedule still advances. Like
    /// [`Database::finish_cleanup_success`], only a `running` policy is
    /// touched.
    pub async fn finish_cleanup_failure(
        &self,
        registry_id: i64,
        failure_message: &str,
        next_run_at: DateTime<Utc>,
    ) -> Result<bool, DbError> {
        let result = sqlx::query(
            r#"
            UPDATE cleanup_policies
            SET status = 'failed', failure_message = ?, next_run_at = ?, updated_at = ?
            WHERE registry_id = ? AND status = 'running'
            "#,
        )
        .bind(failure_message)
        .bind(format_datetime(next_run_at))
        .bind(format_datetime(Utc::now()))
        .bind(registry_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Fail runs stuck in `running` since before `started_before`.
    ///
    /// A run interrupted by a crash never reaches a finish call; this puts
    /// the policy back in rotation. Returns the affected registry ids.
    pub async fn fail_stale_cleanups(
        &self,
        started_before: DateTime<Utc>,
    ) -> Result<Vec<i64>, DbError> {
        let rows = sqlx::query(
            r#"
            UPDATE cleanup_policies
            SET status = 'failed', failure_message = 'interrupted', updated_at = ?
            WHERE status = 'running' AND updated_at < ?
            RETURNING registry_id
            "#,
        )
        .bind(format_datetime(Utc::now()))
        .bind(format_datetime(started_before))
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.iter().map(|row| row.get("registry_id")).collect())
    }

    /// Registry ids whose enabled policy is due and not running
    pub async fn list_due_cleanup_policies(&self, now: DateTime<Utc>) -> Result<Vec<i64>, DbError> {
        let rows = sqlx::query(
            r#"
            SELECT registry_id FROM cleanup_policies
            WHERE enabled = 1 AND status != 'running'
              AND next_run_at IS NOT NULL AND next_run_at <= ?
            ORDER BY next_run_at ASC
            "#,
        )
        .bind(format_datetime(now))
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.iter().map(|row| row.get("registry_id")).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{CleanupPolicyStatus, FormatCleanupMetrics, PackageFormat};
    use crate::repository::test_support::*;

    fn enable() -> UpdateCleanupPolicy {
        UpdateCleanupPolicy {
            enabled: Some(true),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_start_requires_enabled_and_not_running() {
        let db = db().await;
        let reg = registry(&db, 1, "main").await;

        // Disabled by default
        assert!(db.try_start_cleanup(reg.id, Utc::now()).await.unwrap().is_none());

        db.update_cleanup_policy(reg.id, &enable(), Some(Utc::now()))
            .await
            .unwrap();
        let started = db.try_start_cleanup(reg.id, Utc::now()).await.unwrap().unwrap();
        assert_eq!(started.status, CleanupPolicyStatus::Running);

        // Second trigger while running is refused
        assert!(db.try_start_cleanup(reg.id, Utc::now()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_start_requires_due_schedule() {
        let db = db().await;
        let reg = registry(&db, 1, "main").await;
        let now = Utc::now();
        db.update_cleanup_policy(reg.id, &enable(), Some(now + chrono::Duration::days(1)))
            .await
            .unwrap();

        assert!(db.try_start_cleanup(reg.id, now).await.unwrap().is_none());
        let policy = db.get_cleanup_policy(reg.id).await.unwrap().unwrap();
        assert_eq!(policy.status, CleanupPolicyStatus::Idle);

        let started = db
            .try_start_cleanup(reg.id, now + chrono::Duration::days(2))
            .await
            .unwrap();
        assert!(started.is_some());
    }

    #[tokio::test]
    async fn test_finish_success_records_totals() {
        let db = db().await;
        let reg = registry(&db, 1, "main").await;
        db.update_cleanup_policy(reg.id, &enable(), Some(Utc::now()))
            .await
            .unwrap();
        db.try_start_cleanup(reg.id, Utc::now()).await.unwrap().unwrap();

        let mut metrics = CleanupRunMetrics::new();
        metrics.insert(
            PackageFormat::Maven,
            FormatCleanupMetrics {
                deleted_entries_count: 3,
                deleted_size: 300,
            },
        );
        let now = Utc::now();
        let next = now + chrono::Duration::days(7);
        let finished = db
            .finish_cleanup_success(
                reg.id,
                now,
                &CleanupRunTotals {
                    deleted_size: 300,
                    deleted_entries_count: 3,
                    metrics: metrics.clone(),
                },
                next,
            )
            .await
            .unwrap();
        assert!(finished);

        let policy = db.get_cleanup_policy(reg.id).await.unwrap().unwrap();
        assert_eq!(policy.status, CleanupPolicyStatus::Idle);
        assert_eq!(policy.last_run_deleted_entries_count, 3);
        assert_eq!(policy.last_run_detailed_metrics, metrics);
        assert_eq!(policy.next_run_at.map(format_datetime), Some(format_datetime(next)));
    }

    #[tokio::test]
    async fn test_due_policies() {
        let db = db().await;
        let due = registry(&db, 1, "due").await;
        let later = registry(&db, 1, "later").await;
        let disabled = registry(&db, 1, "disabled").await;
        let now = Utc::now();

        db.update_cleanup_policy(due.id, &enable(), Some(now - chrono::Duration::minutes(1)))
            .await
            .unwrap();
        db.update_cleanup_policy(later.id, &enable(), Some(now + chrono::Duration::days(1)))
            .await
            .unwrap();
        db.update_cleanup_policy(
            disabled.id,
            &UpdateCleanupPolicy::default(),
            Some(now - chrono::Duration::days(1)),
        )
        .await
        .unwrap();

        assert_eq!(db.list_due_cleanup_policies(now).await.unwrap(), vec![due.id]);

        db.try_start_cleanup(due.id, now).await.unwrap().unwrap();
        db.finish_cleanup_failure(due.id, "boom", now + chrono::Duration::days(7))
            .await
            .unwrap();
        let policy = db.get_cleanup_policy(due.id).await.unwrap().unwrap();
        assert_eq!(policy.status, CleanupPolicyStatus::Failed);
        assert_eq!(policy.failure_message.as_deref(), Some("boom"));
        assert!(db.list_due_cleanup_policies(now).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_fail_stale_cleanups() {
        let db = db().await;
        let reg = registry(&db, 1, "main").await;
        db.update_cleanup_policy(reg.id, &enable(), Some(Utc::now()))
            .await
            .unwrap();
        db.try_start_cleanup(reg.id, Utc::now()).await.unwrap().unwrap();

        // A fresh run is left alone
        let cutoff = Utc::now() - chrono::Duration::hours(1);
        assert!(db.fail_stale_cleanups(cutoff).await.unwrap().is_empty());

        let cutoff = Utc::now() + chrono::Duration::seconds(1);
        assert_eq!(db.fail_stale_cleanups(cutoff).await.unwrap(), vec![reg.id]);

        let policy = db.get_cleanup_policy(reg.id).await.unwrap().unwrap();
        assert_eq!(policy.status, CleanupPolicyStatus::Failed);
        assert!(db.try_start_cleanup(reg.id, Utc::now()).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_finish_leaves_closed_runs_alone() {
        let db = db().await;
        let reg = registry(&db, 1, "main").await;
        let now = Utc::now();
        db.update_cleanup_policy(reg.id, &enable(), Some(now))
            .await
            .unwrap();
        db.try_start_cleanup(reg.id, now).await.unwrap().unwrap();

        // Recovery closes the run before the worker reports back
        let cutoff = Utc::now() + chrono::Duration::seconds(1);
        assert_eq!(db.fail_stale_cleanups(cutoff).await.unwrap(), vec![reg.id]);

        let next = now + chrono::Duration::days(7);
        let finished = db
            .finish_cleanup_success(reg.id, Utc::now(), &CleanupRunTotals::default(), next)
            .await
            .unwrap();
        assert!(!finished);
        assert!(!db.finish_cleanup_failure(reg.id, "late", next).await.unwrap());

        let policy = db.get_cleanup_policy(reg.id).await.unwrap().unwrap();
        assert_eq!(policy.status, CleanupPolicyStatus::Failed);
        assert_eq!(policy.failure_message.as_deref(), Some("interrupted"));
        assert!(policy.last_run_at.is_none());
    }
}
