//! Configuration loading

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use tracing::info;
use vreg_core::CoreSettings;
use vreg_proxy::UpstreamClientConfig;

/// Main configuration structure
///
/// Every section is optional; missing keys take their defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub storage: StorageConfig,
    pub upstreams: UpstreamsConfig,
    pub security: SecurityConfig,
    pub jobs: JobsConfig,
    pub logging: LoggingConfig,
}

/// Ops HTTP server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_address: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            port: 5010,
        }
    }
}

/// Database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Path of the SQLite file
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: "./data/vreg.db".to_string(),
        }
    }
}

/// Storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// "local" or "memory"
    pub backend: String,
    pub local: LocalStorageConfig,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: "local".to_string(),
            local: LocalStorageConfig::default(),
        }
    }
}

/// Local storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LocalStorageConfig {
    pub path: String,
}

impl Default for LocalStorageConfig {
    fn default() -> Self {
        Self {
            path: "./data/objects".to_string(),
        }
    }
}

/// Outbound upstream request configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UpstreamsConfig {
    /// Allow upstreams on loopback, private and link-local addresses
    pub allow_local_requests: bool,
    pub request_timeout_secs: u64,
}

impl Default for UpstreamsConfig {
    fn default() -> Self {
        Self {
            allow_local_requests: false,
            request_timeout_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityConfig {
    /// Never compute or store MD5 digests
    pub restricted_cryptography: bool,
}

/// Background job configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct JobsConfig {
    pub workers: usize,
    pub counter_flush_delay_ms: u64,
    pub cleanup_scheduler_interval_secs: u64,
    pub reclaim_interval_secs: u64,
    pub reclaim_batch_size: i64,
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            counter_flush_delay_ms: 2000,
            cleanup_scheduler_interval_secs: 60,
            reclaim_interval_secs: 300,
            reclaim_batch_size: 100,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    /// "pretty" or "json"
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from a file
    pub fn load(path: &str) -> Result<Self> {
        let config_path = Path::new(path);

        if !config_path.exists() {
            info!("Config file not found at {}, using defaults", path);
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read config file: {}", path))?;
        let config = Self::parse(&content)
            .with_context(|| format!("Failed to load config file: {}", path))?;

        info!("Loaded configuration from {}", path);
        Ok(config)
    }

    /// Parse and check a TOML document
    pub fn parse(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content).context("Invalid TOML")?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if !matches!(self.storage.backend.as_str(), "local" | "memory") {
            bail!("Unknown storage backend: {}", self.storage.backend);
        }
        if !matches!(self.logging.format.as_str(), "pretty" | "json") {
            bail!("Unknown log format: {}", self.logging.format);
        }
        if self.jobs.workers == 0 {
            bail!("jobs.workers must be at least 1");
        }
        if self.jobs.cleanup_scheduler_interval_secs == 0 || self.jobs.reclaim_interval_secs == 0 {
            bail!("Job intervals must be at least one second");
        }
        if self.jobs.reclaim_batch_size < 1 {
            bail!("jobs.reclaim_batch_size must be at least 1");
        }
        Ok(())
    }

    /// Settings handed to the core services
    pub fn core_settings(&self) -> CoreSettings {
        CoreSettings {
            restricted_cryptography: self.security.restricted_cryptography,
            allow_local_requests: self.upstreams.allow_local_requests,
            counter_flush_delay: Duration::from_millis(self.jobs.counter_flush_delay_ms),
            reclaim_batch_size: self.jobs.reclaim_batch_size,
            ..CoreSettings::default()
        }
    }

    pub fn client_config(&self) -> UpstreamClientConfig {
        UpstreamClientConfig {
            allow_local_requests: self.upstreams.allow_local_requests,
            request_timeout: Duration::from_secs(self.upstreams.request_timeout_secs),
            ..UpstreamClientConfig::default()
        }
    }

    /// sqlx connection URL for the database file
    pub fn database_url(&self) -> String {
        format!("sqlite:{}", self.database.path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.toml");
        let config = Config::load(path.to_str().unwrap()).unwrap();

        assert_eq!(config.server.port, 5010);
        assert_eq!(config.storage.backend, "local");
        assert_eq!(config.jobs.workers, 4);
        assert!(!config.security.restricted_cryptography);
    }

    #[test]
    fn test_partial_file_keeps_other_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[server]
port = 9000

[security]
restricted_cryptography = true

[jobs]
counter_flush_delay_ms = 500

[logging]
format = "json"
"#
        )
        .unwrap();

        let config = Config::load(file.path().to_str().unwrap()).unwrap();
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.server.bind_address, "0.0.0.0");
        assert_eq!(config.logging.format, "json");
        assert_eq!(config.logging.level, "info");

        let settings = config.core_settings();
        assert!(settings.restricted_cryptography);
        assert_eq!(settings.counter_flush_delay, Duration::from_millis(500));
        assert_eq!(settings.cleanup_batch_size, 500);
    }

    #[test]
    fn test_rejects_unknown_values() {
        assert!(Config::parse("[storage]\nbackend = \"s3\"").is_err());
        assert!(Config::parse("[logging]\nformat = \"xml\"").is_err());
        assert!(Config::parse("[jobs]\nworkers = 0").is_err());
        assert!(Config::parse("[server\nport = 1").is_err());
    }

    #[test]
    fn test_client_and_database_settings() {
        let config = Config::parse(
            "[upstreams]\nallow_local_requests = true\nrequest_timeout_secs = 5\n[database]\npath = \"/tmp/x.db\"",
        )
        .unwrap();
        let client = config.client_config();
        assert!(client.allow_local_requests);
        assert_eq!(client.request_timeout, Duration::from_secs(5));
        assert_eq!(config.database_url(), "sqlite:/tmp/x.db");
    }
}
