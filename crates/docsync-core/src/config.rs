//! Database configuration
//!
//! Loaded from TOML (`docsync.toml`) with `DOCSYNC_*` environment
//! overrides. Priority: environment variables > config file > defaults.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default config file looked up by [`DatabaseConfig::from_env`]
pub const CONFIG_FILE: &str = "docsync.toml";

/// Top-level configuration of a [`crate::database::Database`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Database name; also the LMDB directory name
    pub name: String,
    /// Base directory for persistent backends
    pub data_dir: PathBuf,
    /// Whether several participants share the database
    pub multi_instance: bool,
    /// Permit `count` queries the index cannot answer alone
    pub allow_slow_count: bool,
    /// Storage backend settings
    pub storage: StorageConfig,
    /// Tombstone cleanup
    pub cleanup: CleanupConfig,
    /// Replication defaults
    pub replication: ReplicationDefaults,
    /// Schema migration
    pub migration: MigrationConfig,
    /// Leader election
    pub leader: LeaderConfig,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            name: "docsync".to_string(),
            data_dir: PathBuf::from("./data"),
            multi_instance: false,
            allow_slow_count: false,
            storage: StorageConfig::default(),
            cleanup: CleanupConfig::default(),
            replication: ReplicationDefaults::default(),
            migration: MigrationConfig::default(),
            leader: LeaderConfig::default(),
        }
    }
}

/// Storage backend settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// LMDB map size in bytes
    pub lmdb_map_size: usize,
    /// Maximum named LMDB databases per environment
    pub lmdb_max_dbs: u32,
    /// Change stream buffer per instance
    pub change_stream_capacity: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            lmdb_map_size: 256 * 1024 * 1024,
            lmdb_max_dbs: 256,
            change_stream_capacity: 1024,
        }
    }
}

/// Tombstone cleanup
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CleanupConfig {
    /// Minimum age of a tombstone before it may be purged
    #[serde(with = "serde_millis")]
    pub minimum_deleted_time: Duration,
    /// Tombstones purged per `cleanup` call
    pub batch_size: usize,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            minimum_deleted_time: Duration::from_secs(30 * 24 * 60 * 60),
            batch_size: 100,
        }
    }
}

/// Defaults for replication states
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplicationDefaults {
    /// Documents per push or pull batch
    pub batch_size: usize,
    /// Delay before retrying a failed cycle
    #[serde(with = "serde_millis")]
    pub retry_time: Duration,
    /// Interval of the live pull timer
    #[serde(with = "serde_millis")]
    pub live_interval: Duration,
    /// Keep replicating after the initial sync
    pub live: bool,
}

impl Default for ReplicationDefaults {
    fn default() -> Self {
        Self {
            batch_size: 100,
            retry_time: Duration::from_secs(5),
            live_interval: Duration::from_secs(10),
            live: true,
        }
    }
}

/// Schema migration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MigrationConfig {
    /// Documents migrated per batch
    pub batch_size: usize,
    /// Attempts of a status document write before giving up
    pub status_retry_limit: usize,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            batch_size: 10,
            status_retry_limit: 16,
        }
    }
}

/// Leader election timing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LeaderConfig {
    /// How long a candidate waits for objections
    #[serde(with = "serde_millis")]
    pub response_time: Duration,
    /// How often followers re-apply
    #[serde(with = "serde_millis")]
    pub fallback_interval: Duration,
}

impl Default for LeaderConfig {
    fn default() -> Self {
        Self {
            response_time: Duration::from_millis(100),
            fallback_interval: Duration::from_secs(1),
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, target: &mut T) {
    if let Ok(raw) = std::env::var(key) {
        match raw.parse() {
            Ok(value) => *target = value,
            Err(_) => tracing::warn!("Ignoring invalid {}={}", key, raw),
        }
    }
}

fn env_millis(key: &str, target: &mut Duration) {
    let mut millis = target.as_millis() as u64;
    env_parse(key, &mut millis);
    *target = Duration::from_millis(millis);
}

impl DatabaseConfig {
    /// Config with `name` and defaults otherwise
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Parse a TOML config file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)
            .map_err(|e| Error::config(format!("{}: {}", path.display(), e)))?;
        tracing::info!("Loaded configuration from {:?}", path);
        config.validate()?;
        Ok(config)
    }

    /// Load `docsync.toml` if present, then apply `DOCSYNC_*` overrides
    pub fn from_env() -> Result<Self> {
        let mut config = if Path::new(CONFIG_FILE).exists() {
            Self::from_file(CONFIG_FILE)?
        } else {
            tracing::debug!("Config file not found: {}", CONFIG_FILE);
            Self::default()
        };

        if let Ok(name) = std::env::var("DOCSYNC_NAME") {
            config.name = name;
        }
        if let Ok(dir) = std::env::var("DOCSYNC_DATA_DIR") {
            config.data_dir = PathBuf::from(dir);
        }
        env_parse("DOCSYNC_MULTI_INSTANCE", &mut config.multi_instance);
        env_parse("DOCSYNC_ALLOW_SLOW_COUNT", &mut config.allow_slow_count);
        env_parse("DOCSYNC_LMDB_MAP_SIZE", &mut config.storage.lmdb_map_size);
        env_parse("DOCSYNC_LMDB_MAX_DBS", &mut config.storage.lmdb_max_dbs);
        env_parse("DOCSYNC_CLEANUP_BATCH_SIZE", &mut config.cleanup.batch_size);
        env_millis(
            "DOCSYNC_CLEANUP_MIN_DELETED_MS",
            &mut config.cleanup.minimum_deleted_time,
        );
        env_parse("DOCSYNC_REPLICATION_BATCH_SIZE", &mut config.replication.batch_size);
        env_millis("DOCSYNC_REPLICATION_RETRY_MS", &mut config.replication.retry_time);
        env_parse("DOCSYNC_MIGRATION_BATCH_SIZE", &mut config.migration.batch_size);

        config.validate()?;
        Ok(config)
    }

    /// Reject settings no component can work with
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(Error::config("database name must not be empty"));
        }
        if self.storage.lmdb_map_size == 0 {
            return Err(Error::config("storage.lmdb_map_size must be positive"));
        }
        for (key, value) in [
            ("cleanup.batch_size", self.cleanup.batch_size),
            ("replication.batch_size", self.replication.batch_size),
            ("migration.batch_size", self.migration.batch_size),
            ("storage.change_stream_capacity", self.storage.change_stream_capacity),
        ] {
            if value == 0 {
                return Err(Error::config(format!("{key} must be positive")));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = DatabaseConfig::default();
        assert_eq!(config.replication.batch_size, 100);
        assert_eq!(config.cleanup.minimum_deleted_time, Duration::from_secs(2_592_000));
        assert!(!config.allow_slow_count);
        config.validate().unwrap();
    }

    #[test]
    fn test_from_file_partial_sections() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("docsync.toml");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(
            file,
            "name = \"app\"\nallow_slow_count = true\n\n[replication]\nretry_time = 250\n"
        )
        .unwrap();

        let config = DatabaseConfig::from_file(&path).unwrap();
        assert_eq!(config.name, "app");
        assert!(config.allow_slow_count);
        assert_eq!(config.replication.retry_time, Duration::from_millis(250));
        assert_eq!(config.replication.batch_size, 100);
    }

    #[test]
    fn test_validate_rejects_zero_batch() {
        let mut config = DatabaseConfig::named("x");
        config.migration.batch_size = 0;
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }
}
