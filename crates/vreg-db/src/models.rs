//! Database models

use crate::utils::{parse_datetime, parse_datetime_or_now};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::Row;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Error type for parsing models from strings
#[derive(Debug, Clone)]
pub enum ParseError {
    InvalidPackageFormat(String),
    InvalidEntryStatus(String),
    InvalidPolicyStatus(String),
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParseError::InvalidPackageFormat(s) => write!(f, "Invalid package format: {}", s),
            ParseError::InvalidEntryStatus(s) => write!(f, "Invalid cache entry status: {}", s),
            ParseError::InvalidPolicyStatus(s) => write!(f, "Invalid cleanup policy status: {}", s),
        }
    }
}

impl std::error::Error for ParseError {}

fn decode_err(e: ParseError) -> sqlx::Error {
    sqlx::Error::Decode(Box::new(e))
}

/// Package protocol served by a registry
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "lowercase")]
pub enum PackageFormat {
    Maven,
    Npm,
    Container,
}

impl PackageFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            PackageFormat::Maven => "maven",
            PackageFormat::Npm => "npm",
            PackageFormat::Container => "container",
        }
    }

    /// Content type recorded when the upstream does not send one
    pub fn default_content_type(&self) -> &'static str {
        match self {
            PackageFormat::Maven => "application/octet-stream",
            PackageFormat::Npm => "application/octet-stream",
            PackageFormat::Container => "application/vnd.oci.image.manifest.v1+json",
        }
    }
}

impl fmt::Display for PackageFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PackageFormat {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "maven" => Ok(PackageFormat::Maven),
            "npm" => Ok(PackageFormat::Npm),
            "container" => Ok(PackageFormat::Container),
            _ => Err(ParseError::InvalidPackageFormat(s.to_string())),
        }
    }
}

/// Remote registry endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Upstream {
    pub id: i64,
    pub group_id: i64,
    pub package_format: PackageFormat,
    pub name: String,
    pub description: Option<String>,
    /// Base URL of the remote registry
    pub url: String,
    /// Hours a cached object is served before it is revalidated (0 = forever)
    pub cache_validity_hours: i64,
    #[serde(skip_serializing)]
    pub username: Option<String>,
    /// Password for authentication (never serialized)
    #[serde(skip_serializing)]
    pub password: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Upstream {
    /// Prefix under which this upstream's blobs are stored
    pub fn storage_key_prefix(&self) -> String {
        format!("{}/{}/{}", self.package_format, self.group_id, self.id)
    }

    pub fn has_credentials(&self) -> bool {
        self.username.is_some() && self.password.is_some()
    }
}

/// New upstream (for insertion)
#[derive(Debug, Clone)]
pub struct NewUpstream {
    pub group_id: i64,
    pub package_format: PackageFormat,
    pub name: String,
    pub description: Option<String>,
    pub url: String,
    pub cache_validity_hours: i64,
    pub username: Option<String>,
    pub password: Option<String>,
}

/// Update upstream (for partial updates)
#[derive(Debug, Clone, Default)]
pub struct UpdateUpstream {
    pub name: Option<String>,
    pub description: Option<Option<String>>,
    pub url: Option<String>,
    pub cache_validity_hours: Option<i64>,
    pub username: Option<Option<String>>,
    pub password: Option<Option<String>>,
}

/// Named per-group aggregate of an ordered upstream chain
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Registry {
    pub id: i64,
    pub group_id: i64,
    pub package_format: PackageFormat,
    pub name: String,
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// New registry (for insertion)
#[derive(Debug, Clone)]
pub struct NewRegistry {
    pub group_id: i64,
    pub package_format: PackageFormat,
    pub name: String,
    pub description: Option<String>,
}

/// Update registry (for partial updates)
#[derive(Debug, Clone, Default)]
pub struct UpdateRegistry {
    pub name: Option<String>,
    pub description: Option<Option<String>>,
}

/// Ordered link between a registry and an upstream
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryUpstream {
    pub id: i64,
    pub group_id: i64,
    pub registry_id: i64,
    pub upstream_id: i64,
    /// 1-based priority, lower is tried first
    pub position: i64,
    pub created_at: DateTime<Utc>,
}

/// Cache entry lifecycle status
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CacheEntryStatus {
    /// Live entry, served to clients
    Default,
    Processing,
    /// Marked by cleanup or purge; reclaimed out of band
    PendingDestruction,
    /// Reclaim failed
    Error,
}

impl CacheEntryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheEntryStatus::Default => "default",
            CacheEntryStatus::Processing => "processing",
            CacheEntryStatus::PendingDestruction => "pending_destruction",
            CacheEntryStatus::Error => "error",
        }
    }
}

impl FromStr for CacheEntryStatus {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "default" => Ok(CacheEntryStatus::Default),
            "processing" => Ok(CacheEntryStatus::Processing),
            "pending_destruction" => Ok(CacheEntryStatus::PendingDestruction),
            "error" => Ok(CacheEntryStatus::Error),
            _ => Err(ParseError::InvalidEntryStatus(s.to_string())),
        }
    }
}

/// One cached object fetched from one upstream at one relative path
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    pub id: i64,
    pub group_id: i64,
    pub upstream_id: i64,
    pub package_format: PackageFormat,
    pub relative_path: String,
    pub object_storage_key: String,
    pub file_name: String,
    pub file_sha1: String,
    pub file_md5: Option<String>,
    pub size: i64,
    pub upstream_etag: Option<String>,
    pub content_type: String,
    pub downloads_count: i64,
    pub downloaded_at: Option<DateTime<Utc>>,
    pub upstream_checked_at: DateTime<Utc>,
    pub status: CacheEntryStatus,
    /// Bumped on every payload update; guards concurrent writers
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CacheEntry {
    /// Whether the entry has outlived the upstream's validity window
    pub fn is_stale(&self, cache_validity_hours: i64, now: DateTime<Utc>) -> bool {
        if cache_validity_hours <= 0 {
            return false;
        }
        self.upstream_checked_at + chrono::Duration::hours(cache_validity_hours) < now
    }
}

/// Mutable payload of a cache entry, written on both insert and update
#[derive(Debug, Clone)]
pub struct CacheEntryFields {
    pub file_name: String,
    pub file_sha1: String,
    pub file_md5: Option<String>,
    pub size: i64,
    pub upstream_etag: Option<String>,
    pub content_type: String,
}

/// New cache entry (for insertion)
#[derive(Debug, Clone)]
pub struct NewCacheEntry {
    pub group_id: i64,
    pub upstream_id: i64,
    pub package_format: PackageFormat,
    pub relative_path: String,
    pub object_storage_key: String,
    pub fields: CacheEntryFields,
}

/// Entry transitioned to pending destruction
#[derive(Debug, Clone)]
pub struct MarkedEntry {
    pub id: i64,
    pub package_format: PackageFormat,
    pub size: i64,
}

/// Cleanup policy execution state
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CleanupPolicyStatus {
    Idle,
    Running,
    Failed,
}

impl CleanupPolicyStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CleanupPolicyStatus::Idle => "idle",
            CleanupPolicyStatus::Running => "running",
            CleanupPolicyStatus::Failed => "failed",
        }
    }
}

impl FromStr for CleanupPolicyStatus {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "idle" => Ok(CleanupPolicyStatus::Idle),
            "running" => Ok(CleanupPolicyStatus::Running),
            "failed" => Ok(CleanupPolicyStatus::Failed),
            _ => Err(ParseError::InvalidPolicyStatus(s.to_string())),
        }
    }
}

/// Deleted totals for one package format
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct FormatCleanupMetrics {
    pub deleted_entries_count: i64,
    pub deleted_size: i64,
}

/// Per-format breakdown of a cleanup run
pub type CleanupRunMetrics = BTreeMap<PackageFormat, FormatCleanupMetrics>;

/// Per-registry scheduled cleanup configuration and last-run record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CleanupPolicy {
    pub registry_id: i64,
    pub group_id: i64,
    pub enabled: bool,
    pub keep_n_days_after_download: i64,
    /// Days between runs
    pub cadence: i64,
    pub status: CleanupPolicyStatus,
    pub next_run_at: Option<DateTime<Utc>>,
    pub last_run_at: Option<DateTime<Utc>>,
    pub last_run_deleted_size: i64,
    pub last_run_deleted_entries_count: i64,
    pub last_run_detailed_metrics: CleanupRunMetrics,
    pub failure_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Settings update for a cleanup policy
#[derive(Debug, Clone, Default)]
pub struct UpdateCleanupPolicy {
    pub enabled: Option<bool>,
    pub keep_n_days_after_download: Option<i64>,
    pub cadence: Option<i64>,
}

// ==================== TryFrom Implementations ====================

fn optional_datetime(row: &sqlx::sqlite::SqliteRow, column: &str) -> Result<Option<DateTime<Utc>>, sqlx::Error> {
    let value: Option<String> = row.try_get(column)?;
    Ok(value.as_deref().and_then(parse_datetime))
}

impl TryFrom<&sqlx::sqlite::SqliteRow> for Upstream {
    type Error = sqlx::Error;

    fn try_from(row: &sqlx::sqlite::SqliteRow) -> Result<Self, Self::Error> {
        let format_str: String = row.try_get("package_format")?;
        Ok(Upstream {
            id: row.try_get("id")?,
            group_id: row.try_get("group_id")?,
            package_format: PackageFormat::from_str(&format_str).map_err(decode_err)?,
            name: row.try_get("name")?,
            description: row.try_get("description")?,
            url: row.try_get("url")?,
            cache_validity_hours: row.try_get("cache_validity_hours")?,
            username: row.try_get("username")?,
            password: row.try_get("password")?,
            created_at: parse_datetime_or_now(&row.try_get::<String, _>("created_at")?),
            updated_at: parse_datetime_or_now(&row.try_get::<String, _>("updated_at")?),
        })
    }
}

impl TryFrom<&sqlx::sqlite::SqliteRow> for Registry {
    type Error = sqlx::Error;

    fn try_from(row: &sqlx::sqlite::SqliteRow) -> Result<Self, Self::Error> {
        let format_str: String = row.try_get("package_format")?;
        Ok(Registry {
            id: row.try_get("id")?,
            group_id: row.try_get("group_id")?,
            package_format: PackageFormat::from_str(&format_str).map_err(decode_err)?,
            name: row.try_get("name")?,
            description: row.try_get("description")?,
            created_at: parse_datetime_or_now(&row.try_get::<String, _>("created_at")?),
            updated_at: parse_datetime_or_now(&row.try_get::<String, _>("updated_at")?),
        })
    }
}

impl TryFrom<&sqlx::sqlite::SqliteRow> for RegistryUpstream {
    type Error = sqlx::Error;

    fn try_from(row: &sqlx::sqlite::SqliteRow) -> Result<Self, Self::Error> {
        Ok(RegistryUpstream {
            id: row.try_get("id")?,
            group_id: row.try_get("group_id")?,
            registry_id: row.try_get("registry_id")?,
            upstream_id: row.try_get("upstream_id")?,
            position: row.try_get("position")?,
            created_at: parse_datetime_or_now(&row.try_get::<String, _>("created_at")?),
        })
    }
}

impl TryFrom<&sqlx::sqlite::SqliteRow> for CacheEntry {
    type Error = sqlx::Error;

    fn try_from(row: &sqlx::sqlite::SqliteRow) -> Result<Self, Self::Error> {
        let format_str: String = row.try_get("package_format")?;
        let status_str: String = row.try_get("status")?;
        Ok(CacheEntry {
            id: row.try_get("id")?,
            group_id: row.try_get("group_id")?,
            upstream_id: row.try_get("upstream_id")?,
            package_format: PackageFormat::from_str(&format_str).map_err(decode_err)?,
            relative_path: row.try_get("relative_path")?,
            object_storage_key: row.try_get("object_storage_key")?,
            file_name: row.try_get("file_name")?,
            file_sha1: row.try_get("file_sha1")?,
            file_md5: row.try_get("file_md5")?,
            size: row.try_get("size")?,
            upstream_etag: row.try_get("upstream_etag")?,
            content_type: row.try_get("content_type")?,
            downloads_count: row.try_get("downloads_count")?,
            downloaded_at: optional_datetime(row, "downloaded_at")?,
            upstream_checked_at: parse_datetime_or_now(
                &row.try_get::<String, _>("upstream_checked_at")?,
            ),
            status: CacheEntryStatus::from_str(&status_str).map_err(decode_err)?,
            version: row.try_get("version")?,
            created_at: parse_datetime_or_now(&row.try_get::<String, _>("created_at")?),
            updated_at: parse_datetime_or_now(&row.try_get::<String, _>("updated_at")?),
        })
    }
}

impl TryFrom<&sqlx::sqlite::SqliteRow> for CleanupPolicy {
    type Error = sqlx::Error;

    fn try_from(row: &sqlx::sqlite::SqliteRow) -> Result<Self, Self::Error> {
        let status_str: String = row.try_get("status")?;
        let metrics_json: String = row.try_get("last_run_detailed_metrics")?;
        let last_run_detailed_metrics: CleanupRunMetrics = serde_json::from_str(&metrics_json)
            .map_err(|e| sqlx::Error::Decode(Box::new(e)))?;
        Ok(CleanupPolicy {
            registry_id: row.try_get("registry_id")?,
            group_id: row.try_get("group_id")?,
            enabled: row.try_get("enabled")?,
            keep_n_days_after_download: row.try_get("keep_n_days_after_download")?,
            cadence: row.try_get("cadence")?,
            status: CleanupPolicyStatus::from_str(&status_str).map_err(decode_err)?,
            next_run_at: optional_datetime(row, "next_run_at")?,
            last_run_at: optional_datetime(row, "last_run_at")?,
            last_run_deleted_size: row.try_get("last_run_deleted_size")?,
            last_run_deleted_entries_count: row.try_get("last_run_deleted_entries_count")?,
            last_run_detailed_metrics,
            failure_message: row.try_get("failure_message")?,
            created_at: parse_datetime_or_now(&row.try_get::<String, _>("created_at")?),
            updated_at: parse_datetime_or_now(&row.try_get::<String, _>("updated_at")?),
        })
    }
}
