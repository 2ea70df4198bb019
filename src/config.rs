/*!
 * Configuration types for Ferry
 */

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{FerryError, Result};

/// Smallest part size accepted by S3-compatible multipart APIs
pub const MIN_CHUNK_SIZE_MIB: u64 = 5;

/// Largest part size accepted by S3-compatible multipart APIs
pub const MAX_CHUNK_SIZE_MIB: u64 = 5 * 1024;

/// Upper bound on concurrent workers per transfer
pub const MAX_WORKERS: usize = 100;

const MIB: u64 = 1024 * 1024;

/// Main configuration for transfer operations
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferConfig {
    /// Service endpoint; `{region}` is substituted when present
    #[serde(default)]
    pub endpoint: Option<String>,

    /// Region used for the endpoint and the credential scope
    #[serde(default = "default_region")]
    pub region: String,

    /// Multipart chunk size in MiB; also the small/multipart boundary
    #[serde(default = "default_chunk_size_mib")]
    pub chunk_size_mib: u64,

    /// Concurrent workers per multipart transfer
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Limit on a whole operation in seconds (0 = no limit)
    #[serde(default)]
    pub timeout_secs: u64,

    /// Access key pair
    #[serde(default)]
    pub credentials: Option<Credentials>,

    /// Logging configuration
    #[serde(default)]
    pub log: LogConfig,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            region: default_region(),
            chunk_size_mib: default_chunk_size_mib(),
            workers: default_workers(),
            timeout_secs: 0,
            credentials: None,
            log: LogConfig::default(),
        }
    }
}

impl TransferConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            FerryError::Config(format!("failed to read {}: {}", path.display(), e))
        })?;
        toml::from_str(&content)
            .map_err(|e| FerryError::Config(format!("failed to parse {}: {}", path.display(), e)))
    }

    /// Save configuration to a TOML file
    pub fn to_file(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| FerryError::Config(format!("failed to serialize config: {}", e)))?;
        std::fs::write(path, content).map_err(|e| {
            FerryError::Config(format!("failed to write {}: {}", path.display(), e))
        })
    }

    /// Default location of the configuration file
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("ferry").join("config.toml"))
    }

    /// Load the default configuration file if it exists, defaults otherwise
    pub fn load_default() -> Result<Self> {
        match Self::default_path() {
            Some(path) if path.exists() => Self::from_file(&path),
            _ => Ok(Self::default()),
        }
    }

    /// Overlay environment variables on top of file values
    pub fn apply_env(&mut self) {
        self.apply_env_from(|name| std::env::var(name).ok());
    }

    fn apply_env_from<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let first = |names: &[&str]| names.iter().find_map(|name| lookup(*name));

        if let Some(endpoint) = first(&["FERRY_ENDPOINT"]) {
            self.endpoint = Some(endpoint);
        }
        if let Some(region) = first(&["FERRY_REGION", "AWS_REGION"]) {
            self.region = region;
        }
        let access = first(&["FERRY_ACCESS_KEY_ID", "AWS_ACCESS_KEY_ID"]);
        let secret = first(&["FERRY_SECRET_ACCESS_KEY", "AWS_SECRET_ACCESS_KEY"]);
        if let (Some(access_key_id), Some(secret)) = (access, secret) {
            self.credentials = Some(Credentials::new(access_key_id, secret));
        }
    }

    /// Validate the transfer settings
    pub fn validate(&self) -> Result<()> {
        if !(MIN_CHUNK_SIZE_MIB..=MAX_CHUNK_SIZE_MIB).contains(&self.chunk_size_mib) {
            return Err(FerryError::Config(format!(
                "chunk size must be between {} and {} MiB, got {}",
                MIN_CHUNK_SIZE_MIB, MAX_CHUNK_SIZE_MIB, self.chunk_size_mib
            )));
        }
        if self.workers == 0 || self.workers > MAX_WORKERS {
            return Err(FerryError::Config(format!(
                "workers must be between 1 and {}, got {}",
                MAX_WORKERS, self.workers
            )));
        }
        if self.region.is_empty() {
            return Err(FerryError::Config("region must not be empty".to_string()));
        }
        Ok(())
    }

    /// Operation timeout, `None` when unlimited
    pub fn timeout(&self) -> Option<Duration> {
        (self.timeout_secs > 0).then(|| Duration::from_secs(self.timeout_secs))
    }

    /// Chunk size in bytes
    pub fn chunk_size_bytes(&self) -> u64 {
        self.chunk_size_mib * MIB
    }

    /// Endpoint with the region substituted
    pub fn endpoint_url(&self) -> String {
        self.endpoint
            .as_deref()
            .unwrap_or("https://s3.{region}.amazonaws.com")
            .replace("{region}", &self.region)
    }

    /// Credentials, or a configuration error when none are set
    pub fn require_credentials(&self) -> Result<&Credentials> {
        self.credentials.as_ref().ok_or_else(|| {
            FerryError::Config(
                "access key not set; configure credentials or FERRY_ACCESS_KEY_ID".to_string(),
            )
        })
    }
}

/// Access key pair used to sign requests
#[derive(Clone, Serialize, Deserialize)]
pub struct Credentials {
    pub access_key_id: String,
    pub secret_access_key: String,
}

impl Credentials {
    pub fn new(access_key_id: impl Into<String>, secret_access_key: impl Into<String>) -> Self {
        Self {
            access_key_id: access_key_id.into(),
            secret_access_key: secret_access_key.into(),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"<redacted>")
            .finish()
    }
}

/// Log level for diagnostic output
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    #[default]
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub fn to_tracing_level(self) -> tracing::Level {
        match self {
            LogLevel::Error => tracing::Level::ERROR,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Trace => tracing::Level::TRACE,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LogConfig {
    #[serde(default)]
    pub level: LogLevel,

    /// Log file path (None = stderr)
    #[serde(default)]
    pub file: Option<PathBuf>,

    /// Extra filter directives such as `ferry::protocol=trace`; `FERRY_LOG` replaces them
    #[serde(default)]
    pub filter: Option<String>,
}

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_chunk_size_mib() -> u64 {
    8
}

fn default_workers() -> usize {
    5
}
