//! Catalog configuration.
//!
//! Loaded from `<store>/meshcat.toml` when present, otherwise defaults.
//! A handful of `MESHCAT_*` environment variables override the file:
//!
//! ```toml
//! [ingest]
//! workers = 4
//! max_attempts = 5
//! base_delay_ms = 100
//! max_delay_ms = 5000
//! require_schema = false
//!
//! [query]
//! default_depth = 5
//! max_depth = 10
//! timeout_ms = 5000
//!
//! [retention]
//! months = 12
//!
//! [logging]
//! filter = "info"
//! ```

use crate::core::error::CatalogError;
use crate::core::pool::{self, RetryPolicy};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

pub const CONFIG_FILE_NAME: &str = "meshcat.toml";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CatalogConfig {
    pub ingest: IngestConfig,
    pub query: QueryConfig,
    pub retention: RetentionConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    /// Worker threads; each owns a disjoint set of partitions.
    pub workers: usize,
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Reject events for entity types with no registered schema.
    pub require_schema: bool,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            max_attempts: pool::MAX_RETRIES,
            base_delay_ms: pool::BASE_DELAY_MS,
            max_delay_ms: pool::MAX_DELAY_MS,
            require_schema: false,
        }
    }
}

impl IngestConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            base_delay: Duration::from_millis(self.base_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryConfig {
    pub default_depth: usize,
    /// Hard server-side cap on traversal depth.
    pub max_depth: usize,
    /// Default traversal timeout; 0 disables it.
    pub timeout_ms: u64,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            default_depth: 5,
            max_depth: 10,
            timeout_ms: 5_000,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionConfig {
    /// Months of event log kept in the live table; `None` keeps everything.
    pub months: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub filter: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "info".to_string(),
        }
    }
}

impl CatalogConfig {
    pub fn from_toml(raw: &str) -> Result<Self, CatalogError> {
        toml::from_str(raw).map_err(|e| CatalogError::ConfigError(e.to_string()))
    }

    /// Apply `MESHCAT_*` overrides using `lookup` to read variables.
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<(), CatalogError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("MESHCAT_WORKERS") {
            self.ingest.workers = parse_env("MESHCAT_WORKERS", &v)?;
        }
        if let Some(v) = lookup("MESHCAT_MAX_DEPTH") {
            self.query.max_depth = parse_env("MESHCAT_MAX_DEPTH", &v)?;
        }
        if let Some(v) = lookup("MESHCAT_RETENTION_MONTHS") {
            self.retention.months = Some(parse_env("MESHCAT_RETENTION_MONTHS", &v)?);
        }
        if let Some(v) = lookup("MESHCAT_REQUIRE_SCHEMA") {
            self.ingest.require_schema = parse_env("MESHCAT_REQUIRE_SCHEMA", &v)?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), CatalogError> {
        if self.ingest.workers == 0 {
            return Err(CatalogError::ConfigError(
                "ingest.workers must be at least 1".to_string(),
            ));
        }
        if self.ingest.max_attempts == 0 {
            return Err(CatalogError::ConfigError(
                "ingest.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.query.default_depth > self.query.max_depth {
            return Err(CatalogError::ConfigError(format!(
                "query.default_depth ({}) exceeds query.max_depth ({})",
                self.query.default_depth, self.query.max_depth
            )));
        }
        if self.retention.months == Some(0) {
            return Err(CatalogError::ConfigError(
                "retention.months must be at least 1 when set".to_string(),
            ));
        }
        Ok(())
    }

    pub fn query_timeout(&self) -> Option<Duration> {
        (self.query.timeout_ms > 0).then(|| Duration::from_millis(self.query.timeout_ms))
    }
}

fn parse_env<T: std::str::FromStr>(name: &str, raw: &str) -> Result<T, CatalogError> {
    raw.trim()
        .parse()
        .map_err(|_| CatalogError::ConfigError(format!("Invalid value '{}' for {}", raw, name)))
}

/// Load config for a store root: file (if any), then environment, then validate.
pub fn load_config(root: &Path) -> Result<CatalogConfig, CatalogError> {
    let path = root.join(CONFIG_FILE_NAME);
    let mut config = if path.exists() {
        let content = fs::read_to_string(&path).map_err(CatalogError::IoError)?;
        CatalogConfig::from_toml(&content)?
    } else {
        CatalogConfig::default()
    };
    config.apply_env_overrides(|name| std::env::var(name).ok())?;
    config.validate()?;
    Ok(config)
}
