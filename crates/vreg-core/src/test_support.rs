//! Shared fixtures for service and job tests

use std::sync::Arc;

use bytes::Bytes;
use tempfile::TempDir;
use vreg_db::{Database, NewRegistry, NewUpstream, PackageFormat, Registry, Upstream};
use vreg_proxy::{UpstreamClient, UpstreamClientConfig};
use vreg_storage::MemoryStorage;

use crate::cache::{CacheEntryPayload, DownloadCounter};
use crate::digest::{md5_hex, sha1_hex};
use crate::jobs::{JobQueue, JobReceiver, JobRunner};
use crate::settings::CoreSettings;

pub struct Harness {
    pub db: Database,
    pub storage: Arc<MemoryStorage>,
    pub queue: JobQueue,
    pub receiver: JobReceiver,
    pub counter: Arc<DownloadCounter>,
    pub runner: Arc<JobRunner>,
    pub settings: CoreSettings,
}

/// A runner over an in-memory database and store that may talk to
/// local mock upstreams
pub async fn harness(settings: CoreSettings) -> Harness {
    harness_with(Database::in_memory().await.unwrap(), settings)
}

/// Same as [`harness`] over a file-backed pool, so statements from
/// concurrent tasks really run on separate connections
pub async fn harness_on_disk(settings: CoreSettings) -> (Harness, TempDir) {
    let (db, dir) = database_on_disk().await;
    (harness_with(db, settings), dir)
}

pub async fn database_on_disk() -> (Database, TempDir) {
    let dir = TempDir::new().unwrap();
    let url = format!("sqlite:{}", dir.path().join("vreg.db").display());
    (Database::new(&url).await.unwrap(), dir)
}

fn harness_with(db: Database, settings: CoreSettings) -> Harness {
    let storage = Arc::new(MemoryStorage::new());
    let (queue, receiver) = JobQueue::new();
    let client = UpstreamClient::new(UpstreamClientConfig {
        allow_local_requests: true,
        ..Default::default()
    })
    .unwrap();
    let counter = Arc::new(DownloadCounter::new(
        queue.clone(),
        settings.counter_flush_delay,
    ));
    let runner = Arc::new(JobRunner::new(
        db.clone(),
        storage.clone(),
        Arc::new(client),
        queue.clone(),
        counter.clone(),
        settings.clone(),
    ));
    Harness {
        db,
        storage,
        queue,
        receiver,
        counter,
        runner,
        settings,
    }
}

pub async fn upstream_at(db: &Database, group_id: i64, name: &str, url: &str) -> Upstream {
    db.insert_upstream(NewUpstream {
        group_id,
        package_format: PackageFormat::Maven,
        name: name.to_string(),
        description: None,
        url: url.to_string(),
        cache_validity_hours: 24,
        username: None,
        password: None,
    })
    .await
    .unwrap()
}

pub async fn upstream(db: &Database, group_id: i64, name: &str) -> Upstream {
    upstream_at(db, group_id, name, &format!("https://93.184.216.34/{}", name)).await
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

pub async fn link(db: &Database, registry: &Registry, upstream: &Upstream) {
    db.insert_registry_upstream(registry.group_id, registry.id, upstream.id, 20)
        .await
        .unwrap()
        .unwrap();
}

/// Payload with correctly computed checksums
pub fn payload(body: &'static [u8]) -> CacheEntryPayload {
    CacheEntryPayload {
        file: Bytes::from_static(body),
        file_name: "lib-1.0.pom".to_string(),
        file_sha1: sha1_hex(body),
        file_md5: Some(md5_hex(body)),
        upstream_etag: None,
        content_type: None,
    }
}

/// Move an entry's timestamps into the past
pub async fn backdate_entry(db: &Database, entry_id: i64, days: i64) {
    let at = vreg_db::utils::format_datetime(chrono::Utc::now() - chrono::Duration::days(days));
    sqlx::query(
        "UPDATE cache_entries SET downloaded_at = ?, created_at = ?, upstream_checked_at = ? WHERE id = ?",
    )
    .bind(&at)
    .bind(&at)
    .bind(&at)
    .bind(entry_id)
    .execute(db.pool())
    .await
    .unwrap();
}
