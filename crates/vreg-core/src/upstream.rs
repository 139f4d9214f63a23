//! Upstream management

use tracing::info;
use vreg_db::{Database, NewUpstream, UpdateUpstream, Upstream};
use vreg_proxy::validate_upstream_url;

use crate::error::{CoreError, ValidationErrors};
use crate::jobs::{Job, JobQueue};
use crate::settings::CoreSettings;
use crate::validation::{UpstreamAttributes, validate_upstream};

/// Creates, changes and removes upstreams
#[derive(Clone)]
pub struct UpstreamService {
    db: Database,
    queue: JobQueue,
    settings: CoreSettings,
}

impl UpstreamService {
    pub fn new(db: Database, queue: JobQueue, settings: CoreSettings) -> Self {
        Self {
            db,
            queue,
            settings,
        }
    }

    /// Reject URLs that point at, or resolve to, non-public addresses
    async fn check_address(&self, url: &str) -> Result<(), CoreError> {
        validate_upstream_url(url, self.settings.allow_local_requests)
            .await
            .map_err(|e| ValidationErrors::single("url", e.to_string()))?;
        Ok(())
    }

    // ==================== Upstream Operations ====================

    pub async fn create(&self, new: NewUpstream) -> Result<Upstream, CoreError> {
        validate_upstream(&UpstreamAttributes {
            name: &new.name,
            description: new.description.as_deref(),
            url: &new.url,
            cache_validity_hours: new.cache_validity_hours,
            username: new.username.as_deref(),
            password: new.password.as_deref(),
        })
        .into_result()?;
        self.check_address(&new.url).await?;

        let upstream = self.db.insert_upstream(new).await?;
        info!(
            upstream_id = upstream.id,
            group_id = upstream.group_id,
            format = %upstream.package_format,
            "Created upstream"
        );
        Ok(upstream)
    }

    /// Apply a partial change.
    ///
    /// A new URL drops the stored credentials unless the same change
    /// supplies both a username and a password.
    pub async fn update(&self, id: i64, mut change: UpdateUpstream) -> Result<Upstream, CoreError> {
        let current = self.get(id).await?;

        let url_changed = change.url.as_ref().is_some_and(|url| url != &current.url);
        if url_changed {
            let both_supplied = matches!(
                (&change.username, &change.password),
                (Some(Some(_)), Some(Some(_)))
            );
            if !both_supplied {
                change.username = Some(None);
                change.password = Some(None);
            }
        }

        let description = match &change.description {
            Some(description) => description.as_deref(),
            None => current.description.as_deref(),
        };
        let username = match &change.username {
            Some(username) => username.as_deref(),
            None => current.username.as_deref(),
        };
        let password = match &change.password {
            Some(password) => password.as_deref(),
            None => current.password.as_deref(),
        };
        let url = change.url.as_deref().unwrap_or(&current.url);

        validate_upstream(&UpstreamAttributes {
            name: change.name.as_deref().unwrap_or(&current.name),
            description,
            url,
            cache_validity_hours: change
                .cache_validity_hours
                .unwrap_or(current.cache_validity_hours),
            username,
            password,
        })
        .into_result()?;
        if url_changed {
            self.check_address(url).await?;
        }

        let upstream = self
            .db
            .update_upstream(id, change)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("upstream {}", id)))?;
        info!(upstream_id = id, url_changed, "Updated upstream");
        Ok(upstream)
    }

    pub async fn get(&self, id: i64) -> Result<Upstream, CoreError> {
        self.db
            .get_upstream(id)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("upstream {}", id)))
    }

    pub async fn list(&self, group_id: i64) -> Result<Vec<Upstream>, CoreError> {
        Ok(self.db.list_upstreams(group_id).await?)
    }

    /// Remove an upstream and its links, then purge its cache in the
    /// background
    pub async fn destroy(&self, id: i64) -> Result<(), CoreError> {
        let upstream = self.get(id).await?;
        if !self.db.delete_upstream(id).await? {
            return Err(CoreError::NotFound(format!("upstream {}", id)));
        }

        self.queue.enqueue(Job::PurgeUpstreamCache {
            upstream_id: id,
            group_id: upstream.group_id,
        });
        info!(upstream_id = id, group_id = upstream.group_id, "Destroyed upstream");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::*;
    use vreg_db::PackageFormat;

    fn new_upstream(url: &str) -> NewUpstream {
        NewUpstream {
            group_id: 1,
            package_format: PackageFormat::Npm,
            name: "npmjs".to_string(),
            description: None,
            url: url.to_string(),
            cache_validity_hours: 24,
            username: Some("reader".to_string()),
            password: Some("secret".to_string()),
        }
    }

    async fn service() -> (Database, crate::jobs::JobReceiver, UpstreamService) {
        let db = Database::in_memory().await.unwrap();
        let (queue, receiver) = JobQueue::new();
        let service = UpstreamService::new(db.clone(), queue, CoreSettings::default());
        (db, receiver, service)
    }

    #[tokio::test]
    async fn test_create_rejects_local_addresses() {
        let (_db, _rx, service) = service().await;

        let created = service
            .create(new_upstream("https://93.184.216.34/npm"))
            .await
            .unwrap();
        assert_eq!(created.username.as_deref(), Some("reader"));

        for url in ["http://127.0.0.1:4873/", "http://10.0.0.8/", "http://localhost/", "ftp://93.184.216.34/"] {
            let err = service.create(new_upstream(url)).await.unwrap_err();
            assert!(err.validation_errors().unwrap().has("url"), "{} accepted", url);
        }
    }

    #[tokio::test]
    async fn test_url_change_clears_credentials() {
        let (_db, _rx, service) = service().await;
        let created = service
            .create(new_upstream("https://93.184.216.34/npm"))
            .await
            .unwrap();

        let moved = service
            .update(
                created.id,
                UpdateUpstream {
                    url: Some("https://93.184.216.35/npm".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert!(moved.username.is_none());
        assert!(moved.password.is_none());
    }

    #[tokio::test]
    async fn test_url_change_with_both_credentials_keeps_them() {
        let (_db, _rx, service) = service().await;
        let created = service
            .create(new_upstream("https://93.184.216.34/npm"))
            .await
            .unwrap();

        let moved = service
            .update(
                created.id,
                UpdateUpstream {
                    url: Some("https://93.184.216.35/npm".to_string()),
                    username: Some(Some("other".to_string())),
                    password: Some(Some("pw".to_string())),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(moved.username.as_deref(), Some("other"));
        assert_eq!(moved.password.as_deref(), Some("pw"));

        // Same URL: credentials untouched
        let renamed = service
            .update(
                created.id,
                UpdateUpstream {
                    name: Some("renamed".to_string()),
                    url: Some("https://93.184.216.35/npm".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(renamed.username.as_deref(), Some("other"));
    }

    #[tokio::test]
    async fn test_half_credentials_rejected() {
        let (_db, _rx, service) = service().await;
        let created = service
            .create(new_upstream("https://93.184.216.34/npm"))
            .await
            .unwrap();

        let err = service
            .update(
                created.id,
                UpdateUpstream {
                    password: Some(None),
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert!(err.validation_errors().unwrap().has("password"));
    }

    #[tokio::test]
    async fn test_destroy_enqueues_purge() {
        let (db, mut rx, service) = service().await;
        let up = upstream(&db, 1, "central").await;
        let reg = registry(&db, 1, "main").await;
        link(&db, &reg, &up).await;

        service.destroy(up.id).await.unwrap();

        assert!(matches!(service.get(up.id).await, Err(CoreError::NotFound(_))));
        assert!(db.list_registry_upstreams(reg.id).await.unwrap().is_empty());
        let queued = rx.try_recv().unwrap();
        assert_eq!(
            queued.job,
            Job::PurgeUpstreamCache {
                upstream_id: up.id,
                group_id: 1
            }
        );

        assert!(matches!(service.destroy(up.id).await, Err(CoreError::NotFound(_))));
    }
}
