//! vreg core business logic
//!
//! Upstream and registry management, race-safe cache entry writes,
//! deferred download accounting, cleanup policies and the background job
//! queue that drives fetches, purges and blob reclamation.

pub mod cache;
pub mod cleanup;
pub mod digest;
pub mod error;
pub mod jobs;
pub mod registry;
pub mod settings;
pub mod upstream;
pub mod validation;

#[cfg(test)]
pub(crate) mod test_support;

pub use cache::{CacheEntryPayload, CacheEntryService, DownloadCounter};
pub use cleanup::{CleanupRun, CleanupService};
pub use error::{CoreError, FieldError, ValidationErrors};
pub use jobs::{
    Job, JobQueue, JobReceiver, JobRunner, schedule_due_cleanups, spawn_cleanup_scheduler,
    spawn_reclaimer, spawn_workers,
};
pub use registry::{CachedObject, RegistryService};
pub use settings::{
    ALLOWED_CLEANUP_CADENCES, CoreSettings, MAX_POSITION_ATTEMPTS, MAX_REGISTRY_COUNT,
    MAX_UPSERT_ATTEMPTS, MAX_UPSTREAMS_COUNT,
};
pub use upstream::UpstreamService;
