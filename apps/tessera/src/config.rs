//! # Configuration
//!
//! `tessera.toml` layout:
//!
//! ```toml
//! [database]
//! path = "tessera.redb"
//!
//! [processing]
//! workers = 1
//! batch_size = 1
//! poll_interval_ms = 1000
//! error_backoff_ms = 1000
//! lease_secs = 10
//! refresh_interval_secs = 100
//!
//! [[catalog.locations]]
//! type = "file"
//! target = "catalog-info.yaml"
//! ```
//!
//! Every key is optional. A missing file means all defaults.

use crate::engine::EngineConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tessera_core::primitives::{DEFAULT_LEASE_DURATION, DEFAULT_REFRESH_INTERVAL};
use tessera_core::{CatalogError, StoreConfig};

/// Default config file name, resolved against the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "tessera.toml";

/// Default database file name.
pub const DEFAULT_DATABASE_FILE: &str = "tessera.redb";

/// Contents written by `tessera init`.
pub const CONFIG_TEMPLATE: &str = r#"[database]
path = "tessera.redb"

[processing]
workers = 1
batch_size = 1
poll_interval_ms = 1000
error_backoff_ms = 1000
lease_secs = 10
refresh_interval_secs = 100

# [[catalog.locations]]
# type = "file"
# target = "catalog-info.yaml"
"#;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TesseraConfig {
    pub database: DatabaseConfig,
    pub processing: ProcessingConfig,
    pub catalog: CatalogConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DatabaseConfig {
    pub path: PathBuf,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from(DEFAULT_DATABASE_FILE),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ProcessingConfig {
    pub workers: usize,
    pub batch_size: usize,
    pub poll_interval_ms: u64,
    pub error_backoff_ms: u64,
    pub lease_secs: u64,
    pub refresh_interval_secs: u64,
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            workers: 1,
            batch_size: 1,
            poll_interval_ms: 1000,
            error_backoff_ms: 1000,
            lease_secs: DEFAULT_LEASE_DURATION.as_secs(),
            refresh_interval_secs: DEFAULT_REFRESH_INTERVAL.as_secs(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CatalogConfig {
    pub locations: Vec<LocationConfig>,
}

/// One `[[catalog.locations]]` entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LocationConfig {
    #[serde(rename = "type")]
    pub location_type: String,
    pub target: String,
}

impl LocationConfig {
    #[must_use]
    pub fn new(location_type: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            location_type: location_type.into(),
            target: target.into(),
        }
    }
}

impl TesseraConfig {
    /// Load and validate a config file. A file that does not exist yields
    /// the defaults.
    pub fn load(path: &Path) -> Result<Self, CatalogError> {
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => {
                return Err(CatalogError::Config(format!(
                    "failed to read {}: {e}",
                    path.display()
                )));
            }
        };
        Self::from_toml_str(&text)
    }

    pub fn from_toml_str(text: &str) -> Result<Self, CatalogError> {
        let config: Self =
            toml::from_str(text).map_err(|e| CatalogError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), CatalogError> {
        let p = &self.processing;
        if p.workers == 0 {
            return Err(CatalogError::Config("processing.workers must be at least 1".to_string()));
        }
        if p.batch_size == 0 {
            return Err(CatalogError::Config("processing.batch_size must be at least 1".to_string()));
        }
        if p.lease_secs == 0 {
            return Err(CatalogError::Config("processing.lease_secs must be at least 1".to_string()));
        }
        if p.refresh_interval_secs == 0 {
            return Err(CatalogError::Config(
                "processing.refresh_interval_secs must be at least 1".to_string(),
            ));
        }
        for location in &self.catalog.locations {
            if location.location_type.is_empty() || location.target.is_empty() {
                return Err(CatalogError::Config(
                    "catalog.locations entries need both type and target".to_string(),
                ));
            }
        }
        Ok(())
    }

    #[must_use]
    pub fn engine_config(&self) -> EngineConfig {
        let p = &self.processing;
        EngineConfig::default()
            .with_workers(p.workers)
            .with_batch_size(p.batch_size)
            .with_poll_interval(Duration::from_millis(p.poll_interval_ms))
            .with_error_backoff(Duration::from_millis(p.error_backoff_ms))
    }

    #[must_use]
    pub fn store_config(&self) -> StoreConfig {
        let p = &self.processing;
        StoreConfig::default()
            .with_lease_duration(Duration::from_secs(p.lease_secs))
            .with_refresh_interval(Duration::from_secs(p.refresh_interval_secs))
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn missing_file_gives_defaults() {
        let dir = tempdir().expect("tempdir");
        let config = TesseraConfig::load(&dir.path().join("absent.toml")).expect("load");
        assert_eq!(config, TesseraConfig::default());
        assert_eq!(config.engine_config(), EngineConfig::default());
        assert_eq!(config.store_config(), StoreConfig::default());
    }

    #[test]
    fn template_parses_to_defaults() {
        let config = TesseraConfig::from_toml_str(CONFIG_TEMPLATE).expect("parse");
        assert_eq!(config, TesseraConfig::default());
    }

    #[test]
    fn full_file_is_read() {
        let config = TesseraConfig::from_toml_str(
            r#"
            [database]
            path = "/var/lib/tessera/catalog.redb"

            [processing]
            workers = 4
            batch_size = 16
            poll_interval_ms = 250

            [[catalog.locations]]
            type = "file"
            target = "catalog-info.yaml"
            "#,
        )
        .expect("parse");

        assert_eq!(config.database.path, PathBuf::from("/var/lib/tessera/catalog.redb"));
        let engine = config.engine_config();
        assert_eq!(engine.workers, 4);
        assert_eq!(engine.batch_size, 16);
        assert_eq!(engine.poll_interval, Duration::from_millis(250));
        assert_eq!(engine.error_backoff, Duration::from_secs(1));
        assert_eq!(config.catalog.locations, vec![LocationConfig::new("file", "catalog-info.yaml")]);
    }

    #[test]
    fn zero_workers_is_rejected() {
        let err = TesseraConfig::from_toml_str("[processing]\nworkers = 0\n").expect_err("invalid");
        assert!(matches!(err, CatalogError::Config(_)));
        let err = TesseraConfig::from_toml_str("[processing]\nbatch_size = 0\n").expect_err("invalid");
        assert!(matches!(err, CatalogError::Config(_)));
    }

    #[test]
    fn zero_intervals_are_rejected() {
        for key in ["lease_secs", "refresh_interval_secs"] {
            let err = TesseraConfig::from_toml_str(&format!("[processing]\n{key} = 0\n")).expect_err(key);
            assert!(matches!(err, CatalogError::Config(_)));
        }
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let err = TesseraConfig::from_toml_str("[processing]\nthreads = 2\n").expect_err("invalid");
        assert!(matches!(err, CatalogError::Config(_)));
    }
}
