//! Registries and their ordered upstream chains

use chrono::Utc;
use tracing::{debug, info};
use vreg_db::{
    CacheEntry, Database, NewRegistry, PackageFormat, Registry, RegistryUpstream, UpdateRegistry,
    Upstream,
};

use crate::error::{CoreError, ValidationErrors};
use crate::jobs::{Job, JobQueue};
use crate::settings::{MAX_POSITION_ATTEMPTS, MAX_REGISTRY_COUNT, MAX_UPSTREAMS_COUNT};
use crate::validation::validate_registry;

/// A live entry found through a registry's chain
#[derive(Debug, Clone)]
pub struct CachedObject {
    /// The upstream whose entry matched first
    pub upstream: Upstream,
    pub entry: CacheEntry,
    /// The upstream's validity window has passed
    pub stale: bool,
}

/// Manages registries, their upstream chains and cache purges
#[derive(Clone)]
pub struct RegistryService {
    db: Database,
    queue: JobQueue,
}

impl RegistryService {
    pub fn new(db: Database, queue: JobQueue) -> Self {
        Self { db, queue }
    }

    fn name_taken() -> CoreError {
        ValidationErrors::single("name", "has already been taken").into()
    }

    // ==================== Registry Operations ====================

    pub async fn create(&self, new: NewRegistry) -> Result<Registry, CoreError> {
        validate_registry(&new.name, new.description.as_deref()).into_result()?;
        let format = new.package_format;

        match self.db.insert_registry(new, MAX_REGISTRY_COUNT).await {
            Ok(Some(registry)) => {
                info!(
                    registry_id = registry.id,
                    group_id = registry.group_id,
                    format = %format,
                    "Created registry"
                );
                Ok(registry)
            }
            Ok(None) => Err(ValidationErrors::single(
                "group",
                format!(
                    "already has the maximum of {} {} registries",
                    MAX_REGISTRY_COUNT, format
                ),
            )
            .into()),
            Err(e) if e.is_unique_violation() => Err(Self::name_taken()),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn update(&self, id: i64, change: UpdateRegistry) -> Result<Registry, CoreError> {
        let current = self.get(id).await?;
        let description = match &change.description {
            Some(description) => description.as_deref(),
            None => current.description.as_deref(),
        };
        validate_registry(change.name.as_deref().unwrap_or(&current.name), description)
            .into_result()?;

        match self.db.update_registry(id, change).await {
            Ok(Some(registry)) => Ok(registry),
            Ok(None) => Err(CoreError::NotFound(format!("registry {}", id))),
            Err(e) if e.is_unique_violation() => Err(Self::name_taken()),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn get(&self, id: i64) -> Result<Registry, CoreError> {
        self.db
            .get_registry(id)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("registry {}", id)))
    }

    pub async fn list(
        &self,
        group_id: i64,
        format: Option<PackageFormat>,
    ) -> Result<Vec<Registry>, CoreError> {
        Ok(self.db.list_registries(group_id, format).await?)
    }

    /// Remove a registry with its links, policy and exclusive upstreams.
    ///
    /// One purge job per removed upstream is enqueued once the removal has
    /// committed. Upstreams shared with another registry stay untouched.
    /// Returns the removed upstreams.
    pub async fn destroy(&self, id: i64) -> Result<Vec<Upstream>, CoreError> {
        let removed = self
            .db
            .delete_registry(id)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("registry {}", id)))?;

        self.enqueue_purges(&removed);
        info!(
            registry_id = id,
            removed_upstreams = removed.len(),
            "Destroyed registry"
        );
        Ok(removed)
    }

    /// Enqueue a purge of every upstream exclusive to a registry.
    ///
    /// Returns the number of purge jobs enqueued.
    pub async fn purge_cache(&self, registry_id: i64) -> Result<usize, CoreError> {
        let exclusive = self.exclusive_upstreams(registry_id).await?;
        Ok(self.enqueue_purges(&exclusive))
    }

    fn enqueue_purges(&self, upstreams: &[Upstream]) -> usize {
        upstreams
            .iter()
            .filter(|upstream| {
                self.queue.enqueue(Job::PurgeUpstreamCache {
                    upstream_id: upstream.id,
                    group_id: upstream.group_id,
                })
            })
            .count()
    }

    // ==================== Chain Operations ====================

    /// Append an upstream to a registry's chain at the next position
    pub async fn add_upstream(
        &self,
        registry_id: i64,
        upstream_id: i64,
    ) -> Result<RegistryUpstream, CoreError> {
        let registry = self.get(registry_id).await?;
        let upstream = self
            .db
            .get_upstream(upstream_id)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("upstream {}", upstream_id)))?;

        let mut errors = ValidationErrors::new();
        if upstream.group_id != registry.group_id {
            errors.add("upstream", "must belong to the registry's group");
        }
        if upstream.package_format != registry.package_format {
            errors.add("upstream", "must use the registry's package format");
        }
        errors.into_result()?;

        for attempt in 1..=MAX_POSITION_ATTEMPTS {
            if self
                .db
                .get_registry_upstream(registry_id, upstream_id)
                .await?
                .is_some()
            {
                return Err(
                    ValidationErrors::single("upstream", "is already part of this registry").into(),
                );
            }

            match self
                .db
                .insert_registry_upstream(
                    registry.group_id,
                    registry_id,
                    upstream_id,
                    MAX_UPSTREAMS_COUNT,
                )
                .await
            {
                Ok(Some(link)) => {
                    debug!(registry_id, upstream_id, position = link.position, "Linked upstream");
                    return Ok(link);
                }
                Ok(None) => {
                    return Err(ValidationErrors::single(
                        "position",
                        format!("registry already has the maximum of {} upstreams", MAX_UPSTREAMS_COUNT),
                    )
                    .into());
                }
                Err(e) if e.is_unique_violation() => {
                    debug!(registry_id, upstream_id, attempt, "Position taken, retrying");
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(CoreError::Conflict(format!(
            "could not assign a position in registry {}",
            registry_id
        )))
    }

    /// Unlink an upstream and close the gap in the chain
    pub async fn remove_upstream(&self, registry_id: i64, upstream_id: i64) -> Result<(), CoreError> {
        if !self
            .db
            .delete_registry_upstream(registry_id, upstream_id)
            .await?
        {
            return Err(CoreError::NotFound(format!(
                "upstream {} in registry {}",
                upstream_id, registry_id
            )));
        }
        Ok(())
    }

    /// Move an upstream to `position` within `[1, chain length]`
    pub async fn reorder_upstream(
        &self,
        registry_id: i64,
        upstream_id: i64,
        position: i64,
    ) -> Result<Vec<RegistryUpstream>, CoreError> {
        let length = self.db.list_registry_upstreams(registry_id).await?.len() as i64;
        if position < 1 || position > length {
            return Err(ValidationErrors::single(
                "position",
                format!("must be between 1 and {}", length.max(1)),
            )
            .into());
        }

        self.db
            .move_registry_upstream(registry_id, upstream_id, position)
            .await?
            .ok_or_else(|| {
                CoreError::NotFound(format!(
                    "upstream {} in registry {}",
                    upstream_id, registry_id
                ))
            })
    }

    /// Upstreams in priority order
    pub async fn chain(&self, registry_id: i64) -> Result<Vec<Upstream>, CoreError> {
        Ok(self.db.list_registry_chain(registry_id).await?)
    }

    pub async fn links(&self, registry_id: i64) -> Result<Vec<RegistryUpstream>, CoreError> {
        Ok(self.db.list_registry_upstreams(registry_id).await?)
    }

    /// Upstreams no other registry links to
    pub async fn exclusive_upstreams(&self, registry_id: i64) -> Result<Vec<Upstream>, CoreError> {
        Ok(self.db.exclusive_upstreams(registry_id).await?)
    }

    // ==================== Lookup Operations ====================

    /// First live entry for `relative_path` along the chain
    pub async fn lookup(
        &self,
        registry_id: i64,
        relative_path: &str,
    ) -> Result<Option<CachedObject>, CoreError> {
        let now = Utc::now();
        for upstream in self.chain(registry_id).await? {
            if let Some(entry) = self
                .db
                .get_live_cache_entry(upstream.id, relative_path)
                .await?
            {
                let stale = entry.is_stale(upstream.cache_validity_hours, now);
                return Ok(Some(CachedObject {
                    upstream,
                    entry,
                    stale,
                }));
            }
        }
        Ok(None)
    }

    /// Look up a path and schedule background work for it.
    ///
    /// A miss fetches from the highest-priority upstream; a stale hit
    /// revalidates against the upstream that holds it. The stale copy is
    /// still returned.
    pub async fn lookup_or_schedule(
        &self,
        registry_id: i64,
        relative_path: &str,
    ) -> Result<Option<CachedObject>, CoreError> {
        self.get(registry_id).await?;
        let found = self.lookup(registry_id, relative_path).await?;

        let fetch_from = match &found {
            Some(cached) if cached.stale => Some(cached.upstream.id),
            Some(_) => None,
            None => self.chain(registry_id).await?.first().map(|u| u.id),
        };
        if let Some(upstream_id) = fetch_from {
            self.queue.enqueue(Job::FetchObject {
                upstream_id,
                relative_path: relative_path.to_string(),
            });
        }

        Ok(found)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheEntryService;
    use crate::settings::CoreSettings;
    use crate::test_support::*;
    use vreg_db::CacheEntryStatus;

    fn new_registry(name: &str) -> NewRegistry {
        NewRegistry {
            group_id: 1,
            package_format: PackageFormat::Maven,
            name: name.to_string(),
            description: None,
        }
    }

    #[tokio::test]
    async fn test_registry_count_is_capped() {
        let h = harness(CoreSettings::default()).await;
        let service = RegistryService::new(h.db.clone(), h.queue.clone());

        for i in 0..MAX_REGISTRY_COUNT {
            service.create(new_registry(&format!("r{}", i))).await.unwrap();
        }
        let err = service.create(new_registry("one-too-many")).await.unwrap_err();
        assert!(err.validation_errors().unwrap().has("group"));
        assert_eq!(
            service.list(1, Some(PackageFormat::Maven)).await.unwrap().len() as i64,
            MAX_REGISTRY_COUNT
        );

        // The cap is per format
        let npm = NewRegistry {
            package_format: PackageFormat::Npm,
            ..new_registry("npm")
        };
        assert!(service.create(npm).await.is_ok());
    }

    #[tokio::test]
    async fn test_duplicate_name_is_a_validation_error() {
        let h = harness(CoreSettings::default()).await;
        let service = RegistryService::new(h.db.clone(), h.queue.clone());

        let first = service.create(new_registry("main")).await.unwrap();
        let err = service.create(new_registry("main")).await.unwrap_err();
        assert!(err.validation_errors().unwrap().has("name"));

        let other = service.create(new_registry("other")).await.unwrap();
        let err = service
            .update(
                other.id,
                UpdateRegistry {
                    name: Some("main".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert!(err.validation_errors().unwrap().has("name"));
        assert_eq!(service.get(first.id).await.unwrap().name, "main");
    }

    #[tokio::test]
    async fn test_positions_are_sequential_and_capped() {
        let h = harness(CoreSettings::default()).await;
        let service = RegistryService::new(h.db.clone(), h.queue.clone());
        let reg = registry(&h.db, 1, "main").await;

        for i in 1..=MAX_UPSTREAMS_COUNT {
            let up = upstream(&h.db, 1, &format!("u{}", i)).await;
            let link = service.add_upstream(reg.id, up.id).await.unwrap();
            assert_eq!(link.position, i);
        }

        let extra = upstream(&h.db, 1, "extra").await;
        let err = service.add_upstream(reg.id, extra.id).await.unwrap_err();
        assert!(err.validation_errors().unwrap().has("position"));
    }

    #[tokio::test]
    async fn test_link_rules() {
        let h = harness(CoreSettings::default()).await;
        let service = RegistryService::new(h.db.clone(), h.queue.clone());
        let reg = registry(&h.db, 1, "main").await;
        let up = upstream(&h.db, 1, "central").await;
        let foreign = upstream(&h.db, 2, "foreign").await;

        service.add_upstream(reg.id, up.id).await.unwrap();
        let err = service.add_upstream(reg.id, up.id).await.unwrap_err();
        assert!(err.validation_errors().unwrap().has("upstream"));

        let err = service.add_upstream(reg.id, foreign.id).await.unwrap_err();
        assert!(err.validation_errors().unwrap().has("upstream"));
    }

    #[tokio::test]
    async fn test_reorder_and_remove() {
        let h = harness(CoreSettings::default()).await;
        let service = RegistryService::new(h.db.clone(), h.queue.clone());
        let reg = registry(&h.db, 1, "main").await;
        let a = upstream(&h.db, 1, "a").await;
        let b = upstream(&h.db, 1, "b").await;
        let c = upstream(&h.db, 1, "c").await;
        for up in [&a, &b, &c] {
            service.add_upstream(reg.id, up.id).await.unwrap();
        }

        service.reorder_upstream(reg.id, c.id, 1).await.unwrap();
        let ids: Vec<i64> = service.chain(reg.id).await.unwrap().iter().map(|u| u.id).collect();
        assert_eq!(ids, vec![c.id, a.id, b.id]);

        let err = service.reorder_upstream(reg.id, a.id, 4).await.unwrap_err();
        assert!(err.validation_errors().unwrap().has("position"));

        service.remove_upstream(reg.id, a.id).await.unwrap();
        let positions: Vec<(i64, i64)> = service
            .links(reg.id)
            .await
            .unwrap()
            .iter()
            .map(|l| (l.upstream_id, l.position))
            .collect();
        assert_eq!(positions, vec![(c.id, 1), (b.id, 2)]);

        assert!(matches!(
            service.remove_upstream(reg.id, a.id).await,
            Err(CoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_destroy_purges_only_exclusive_upstreams() {
        let mut h = harness(CoreSettings::default()).await;
        let service = RegistryService::new(h.db.clone(), h.queue.clone());
        let entries = CacheEntryService::new(h.db.clone(), h.storage.clone(), h.settings.clone());

        let doomed = registry(&h.db, 1, "doomed").await;
        let sibling = registry(&h.db, 1, "sibling").await;
        let own = upstream(&h.db, 1, "own").await;
        let shared = upstream(&h.db, 1, "shared").await;
        link(&h.db, &doomed, &own).await;
        link(&h.db, &doomed, &shared).await;
        link(&h.db, &sibling, &shared).await;

        let own_entry = entries.upsert(&own, 1, "a.pom", payload(b"a")).await.unwrap();
        let shared_entry = entries.upsert(&shared, 1, "a.pom", payload(b"a")).await.unwrap();

        let removed = service.destroy(doomed.id).await.unwrap();
        assert_eq!(removed.iter().map(|u| u.id).collect::<Vec<_>>(), vec![own.id]);
        assert_eq!(h.runner.drain(&mut h.receiver).await, 1);

        let own_entry = h.db.get_cache_entry(own_entry.id).await.unwrap().unwrap();
        assert_eq!(own_entry.status, CacheEntryStatus::PendingDestruction);
        let shared_entry = h.db.get_cache_entry(shared_entry.id).await.unwrap().unwrap();
        assert_eq!(shared_entry.status, CacheEntryStatus::Default);

        assert!(h.db.get_upstream(own.id).await.unwrap().is_none());
        assert!(h.db.get_upstream(shared.id).await.unwrap().is_some());
        assert_eq!(service.chain(sibling.id).await.unwrap().len(), 1);
        assert!(h.db.get_cleanup_policy(doomed.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_purge_cache_without_destroy() {
        let mut h = harness(CoreSettings::default()).await;
        let service = RegistryService::new(h.db.clone(), h.queue.clone());
        let reg = registry(&h.db, 1, "main").await;
        let up = upstream(&h.db, 1, "central").await;
        link(&h.db, &reg, &up).await;

        assert_eq!(service.purge_cache(reg.id).await.unwrap(), 1);
        // Second request collapses into the queued job
        assert_eq!(service.purge_cache(reg.id).await.unwrap(), 0);
        assert_eq!(h.runner.drain(&mut h.receiver).await, 1);
        assert_eq!(service.chain(reg.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_lookup_walks_chain_and_schedules() {
        let mut h = harness(CoreSettings::default()).await;
        let service = RegistryService::new(h.db.clone(), h.queue.clone());
        let entries = CacheEntryService::new(h.db.clone(), h.storage.clone(), h.settings.clone());

        let reg = registry(&h.db, 1, "main").await;
        let first = upstream(&h.db, 1, "first").await;
        let second = upstream(&h.db, 1, "second").await;
        link(&h.db, &reg, &first).await;
        link(&h.db, &reg, &second).await;

        // Miss: fetch from the top of the chain
        assert!(service.lookup_or_schedule(reg.id, "a.pom").await.unwrap().is_none());
        let queued = h.receiver.try_recv().unwrap();
        assert_eq!(
            queued.job,
            Job::FetchObject {
                upstream_id: first.id,
                relative_path: "a.pom".to_string()
            }
        );
        h.queue.complete(&queued);

        // Fresh hit on the second upstream: nothing to do
        let entry = entries.upsert(&second, 1, "a.pom", payload(b"a")).await.unwrap();
        let hit = service.lookup_or_schedule(reg.id, "a.pom").await.unwrap().unwrap();
        assert_eq!(hit.upstream.id, second.id);
        assert!(!hit.stale);
        assert!(h.receiver.try_recv().is_none());

        // Stale hit: revalidate where it lives
        backdate_entry(&h.db, entry.id, 2).await;
        let hit = service.lookup_or_schedule(reg.id, "a.pom").await.unwrap().unwrap();
        assert!(hit.stale);
        let queued = h.receiver.try_recv().unwrap();
        assert_eq!(
            queued.job,
            Job::FetchObject {
                upstream_id: second.id,
                relative_path: "a.pom".to_string()
            }
        );
    }
}
