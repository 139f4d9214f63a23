//! Cleanup policy engine
//!
//! A run moves its policy `idle|failed -> running -> idle|failed`. The
//! move into `running` is a compare-and-set in the database, so only one
//! run per registry proceeds no matter how many schedulers trigger it.

use chrono::{DateTime, Duration, Utc};
use metrics::counter;
use tracing::{debug, info, warn};
use vreg_db::{CleanupPolicy, CleanupRunTotals, Database, UpdateCleanupPolicy};

use crate::error::CoreError;
use crate::settings::CoreSettings;
use crate::validation::validate_cleanup_policy;

/// Result of a cleanup trigger
#[derive(Debug, Clone)]
pub enum CleanupRun {
    /// Disabled, missing, not yet due or already running
    Skipped,
    Completed(CleanupRunTotals),
    Failed(String),
}

#[derive(Clone)]
pub struct CleanupService {
    db: Database,
    settings: CoreSettings,
}

impl CleanupService {
    pub fn new(db: Database, settings: CoreSettings) -> Self {
        Self { db, settings }
    }

    pub async fn policy(&self, registry_id: i64) -> Result<CleanupPolicy, CoreError> {
        self.db
            .get_cleanup_policy(registry_id)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("cleanup policy for registry {}", registry_id)))
    }

    /// Change a policy's settings.
    ///
    /// Enabling a policy, or changing the cadence of an enabled one, puts
    /// the next run one cadence from now.
    pub async fn update_policy(
        &self,
        registry_id: i64,
        update: UpdateCleanupPolicy,
    ) -> Result<CleanupPolicy, CoreError> {
        validate_cleanup_policy(&update).into_result()?;
        let current = self.policy(registry_id).await?;

        let enabled = update.enabled.unwrap_or(current.enabled);
        let cadence = update.cadence.unwrap_or(current.cadence);
        let reschedule = enabled && (!current.enabled || cadence != current.cadence);
        let next_run_at = reschedule.then(|| Utc::now() + Duration::days(cadence));

        self.db
            .update_cleanup_policy(registry_id, &update, next_run_at)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("cleanup policy for registry {}", registry_id)))
    }

    /// Run a registry's policy if it is enabled, due and not running
    pub async fn execute(&self, registry_id: i64) -> Result<CleanupRun, CoreError> {
        let Some(policy) = self.db.try_start_cleanup(registry_id, Utc::now()).await? else {
            debug!(registry_id, "Cleanup not started: disabled, missing, not due or running");
            counter!("vreg_cleanup_runs_total", "status" => "skipped").increment(1);
            return Ok(CleanupRun::Skipped);
        };

        info!(
            registry_id,
            keep_days = policy.keep_n_days_after_download,
            "Starting cleanup run"
        );

        let result = self.mark_expired(&policy, Utc::now()).await;
        let finished_at = Utc::now();
        let next_run_at = finished_at + Duration::days(policy.cadence);

        match result {
            Ok(totals) => {
                if !self
                    .db
                    .finish_cleanup_success(registry_id, finished_at, &totals, next_run_at)
                    .await?
                {
                    warn!(registry_id, "Cleanup run was closed before it finished");
                }
                counter!("vreg_cleanup_runs_total", "status" => "completed").increment(1);
                info!(
                    registry_id,
                    deleted_entries = totals.deleted_entries_count,
                    deleted_size = totals.deleted_size,
                    "Cleanup run completed"
                );
                Ok(CleanupRun::Completed(totals))
            }
            Err(e) => {
                let message = e.to_string();
                warn!(registry_id, error = %message, "Cleanup run failed");
                if !self
                    .db
                    .finish_cleanup_failure(registry_id, &message, next_run_at)
                    .await?
                {
                    warn!(registry_id, "Cleanup run was closed before it failed");
                }
                counter!("vreg_cleanup_runs_total", "status" => "failed").increment(1);
                Ok(CleanupRun::Failed(message))
            }
        }
    }

    async fn mark_expired(
        &self,
        policy: &CleanupPolicy,
        now: DateTime<Utc>,
    ) -> Result<CleanupRunTotals, CoreError> {
        let cutoff = now - Duration::days(policy.keep_n_days_after_download);
        let batch_size = self.settings.cleanup_batch_size.max(1);
        let mut totals = CleanupRunTotals::default();

        for upstream in self.db.exclusive_upstreams(policy.registry_id).await? {
            loop {
                let marked = self
                    .db
                    .mark_expired_cache_entries(upstream.id, cutoff, batch_size)
                    .await?;

                for entry in &marked {
                    totals.deleted_entries_count += 1;
                    totals.deleted_size += entry.size;
                    let per_format = totals.metrics.entry(entry.package_format).or_default();
                    per_format.deleted_entries_count += 1;
                    per_format.deleted_size += entry.size;

                    let format = entry.package_format.as_str();
                    counter!("vreg_cleanup_marked_entries_total", "format" => format).increment(1);
                    counter!("vreg_cleanup_marked_bytes_total", "format" => format)
                        .increment(entry.size.max(0) as u64);
                }

                if (marked.len() as i64) < batch_size {
                    break;
                }
            }
        }

        Ok(totals)
    }

    /// Registries whose policy is due at `now`
    pub async fn due_registries(&self, now: DateTime<Utc>) -> Result<Vec<i64>, CoreError> {
        Ok(self.db.list_due_cleanup_policies(now).await?)
    }

    /// Fail runs that have been `running` for too long
    pub async fn recover_stale_runs(&self) -> Result<Vec<i64>, CoreError> {
        let max_age = Duration::from_std(self.settings.stale_cleanup_after)
            .unwrap_or_else(|_| Duration::hours(6));
        let recovered = self.db.fail_stale_cleanups(Utc::now() - max_age).await?;
        for registry_id in &recovered {
            warn!(registry_id, "Recovered interrupted cleanup run");
        }
        Ok(recovered)
    }
}
