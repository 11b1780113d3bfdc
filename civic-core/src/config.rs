use crate::data_dir::DataDir;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tracing::info;

/// Default chunk size for new files (255 KiB).
pub const DEFAULT_CHUNK_SIZE: usize = 255 * 1024;

/// Upper bound for a configured chunk size. One chunk is one database row.
pub const MAX_CHUNK_SIZE: usize = 16 * 1024 * 1024;

const DEFAULT_MAX_FILE_BYTES: u64 = 100 * 1024 * 1024;
const DEFAULT_UPLOAD_TIMEOUT_SECS: u64 = 300;
const DEFAULT_CACHE_MAX_AGE_SECS: u64 = 31_536_000;
const DEFAULT_ORPHAN_GRACE_SECS: u64 = 3600;
const DEFAULT_DB_MAX_CONNECTIONS: u32 = 8;

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// YAML config file structure (`<data-dir>/config.yaml`).
///
/// Every key is optional; missing keys fall back to the defaults above.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConfigYaml {
    /// Chunk size used for new uploads, in bytes
    pub chunk_size_bytes: Option<usize>,
    /// Largest accepted single file, in bytes
    pub max_file_bytes: Option<u64>,
    /// Deadline for one request, uploads and file downloads alike
    pub upload_timeout_secs: Option<u64>,
    /// `Cache-Control: max-age` for served files
    pub cache_max_age_secs: Option<u64>,
    /// Unreferenced files younger than this are not treated as orphans
    pub orphan_grace_secs: Option<u64>,
    /// SQLite connection pool size
    pub db_max_connections: Option<u32>,
}

/// Runtime configuration
#[derive(Clone, Debug)]
pub struct Config {
    pub data_dir: DataDir,
    pub chunk_size_bytes: usize,
    pub max_file_bytes: u64,
    pub upload_timeout: Duration,
    pub cache_max_age: Duration,
    pub orphan_grace: Duration,
    pub db_max_connections: u32,
}

impl Config {
    /// Load `config.yaml` from the data directory, or use defaults when absent.
    pub fn load(data_dir: DataDir) -> Result<Self, ConfigError> {
        let config_path = data_dir.config_path();
        let yaml = match std::fs::read_to_string(&config_path) {
            Ok(contents) => serde_yaml::from_str::<ConfigYaml>(&contents).map_err(|e| {
                ConfigError::Serialization(format!(
                    "Failed to parse {}: {}",
                    config_path.display(),
                    e
                ))
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(
                    "No config.yaml at {}, using defaults",
                    config_path.display()
                );
                ConfigYaml::default()
            }
            Err(e) => return Err(e.into()),
        };

        Self::from_yaml(data_dir, yaml)
    }

    /// Defaults only, no file access.
    pub fn with_defaults(data_dir: DataDir) -> Self {
        Self {
            data_dir,
            chunk_size_bytes: DEFAULT_CHUNK_SIZE,
            max_file_bytes: DEFAULT_MAX_FILE_BYTES,
            upload_timeout: Duration::from_secs(DEFAULT_UPLOAD_TIMEOUT_SECS),
            cache_max_age: Duration::from_secs(DEFAULT_CACHE_MAX_AGE_SECS),
            orphan_grace: Duration::from_secs(DEFAULT_ORPHAN_GRACE_SECS),
            db_max_connections: DEFAULT_DB_MAX_CONNECTIONS,
        }
    }

    fn from_yaml(data_dir: DataDir, yaml: ConfigYaml) -> Result<Self, ConfigError> {
        let defaults = Self::with_defaults(data_dir);
        let config = Self {
            chunk_size_bytes: yaml.chunk_size_bytes.unwrap_or(defaults.chunk_size_bytes),
            max_file_bytes: yaml.max_file_bytes.unwrap_or(defaults.max_file_bytes),
            upload_timeout: yaml
                .upload_timeout_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.upload_timeout),
            cache_max_age: yaml
                .cache_max_age_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.cache_max_age),
            orphan_grace: yaml
                .orphan_grace_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.orphan_grace),
            db_max_connections: yaml
                .db_max_connections
                .unwrap_or(defaults.db_max_connections),
            data_dir: defaults.data_dir,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.chunk_size_bytes == 0 || self.chunk_size_bytes > MAX_CHUNK_SIZE {
            return Err(ConfigError::Config(format!(
                "chunk_size_bytes must be between 1 and {}, got {}",
                MAX_CHUNK_SIZE, self.chunk_size_bytes
            )));
        }
        if self.max_file_bytes == 0 {
            return Err(ConfigError::Config(
                "max_file_bytes must be greater than 0".to_string(),
            ));
        }
        if self.db_max_connections == 0 {
            return Err(ConfigError::Config(
                "db_max_connections must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }

    pub fn save(&self) -> Result<(), ConfigError> {
        std::fs::create_dir_all(&*self.data_dir)?;
        let yaml = ConfigYaml {
            chunk_size_bytes: Some(self.chunk_size_bytes),
            max_file_bytes: Some(self.max_file_bytes),
            upload_timeout_secs: Some(self.upload_timeout.as_secs()),
            cache_max_age_secs: Some(self.cache_max_age.as_secs()),
            orphan_grace_secs: Some(self.orphan_grace.as_secs()),
            db_max_connections: Some(self.db_max_connections),
        };
        let contents = serde_yaml::to_string(&yaml)
            .map_err(|e| ConfigError::Serialization(e.to_string()))?;
        std::fs::write(self.data_dir.config_path(), contents)?;
        Ok(())
    }
}
