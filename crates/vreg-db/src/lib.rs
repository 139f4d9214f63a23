//! vreg database layer
//!
//! SQLite persistence via sqlx for upstreams, registries, their ordered
//! links, cache entries and cleanup policies.

pub mod error;
pub mod models;
pub mod repository;
pub mod utils;

pub use error::DbError;
pub use models::*;
pub use repository::{CacheEntryQuery, CacheStats, CleanupRunTotals, Database, DownloadIncrement};

/// Re-export sqlx types for convenience
pub use sqlx::SqlitePool;
