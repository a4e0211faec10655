//! Configuration
//!
//! Layered with the `config` crate. Precedence, lowest to highest: built-in
//! defaults, the global file, the workspace files, then `SYNCSTORE__*`
//! environment variables (`SYNCSTORE__QUEUE__MAX_CONCURRENCY=8`).

use crate::error::ConfigError;
use crate::lock::AcquireOptions;
use crate::logging::LoggingConfig;
use crate::queue::QueueOptions;
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

mod sources {
    pub mod global_file;
    pub mod workspace_file;
}

pub use sources::global_file::global_config_path;

/// Root configuration structure
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncStoreConfig {
    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub lock: LockConfig,

    #[serde(default)]
    pub queue: QueueConfig,

    #[serde(default)]
    pub remote: RemoteConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackendKind {
    Memory,
    Filesystem,
    Sled,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Directory holding the store (filesystem) or database (sled)
    #[serde(default = "default_storage_root")]
    pub root_path: PathBuf,

    #[serde(default = "default_storage_backend")]
    pub backend: StorageBackendKind,

    /// Named sled tree; several stores may share one database
    #[serde(default)]
    pub bucket: Option<String>,
}

fn default_storage_root() -> PathBuf {
    PathBuf::from(".syncstore/data")
}

fn default_storage_backend() -> StorageBackendKind {
    StorageBackendKind::Filesystem
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root_path: default_storage_root(),
            backend: default_storage_backend(),
            bucket: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LockBackendKind {
    Memory,
    File,
    Redis,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockConfig {
    #[serde(default = "default_lock_backend")]
    pub backend: LockBackendKind,

    /// Lock file directory for the file backend
    #[serde(default = "default_lock_dir")]
    pub dir: PathBuf,

    #[serde(default)]
    pub redis: RedisConfig,

    #[serde(default = "default_lock_timeout_ms")]
    pub timeout_ms: u64,

    /// Force-release abandoned locks after this long; `None` never does
    #[serde(default = "default_auto_release_ms")]
    pub auto_release_ms: Option<u64>,
}

fn default_lock_backend() -> LockBackendKind {
    LockBackendKind::File
}

fn default_lock_dir() -> PathBuf {
    PathBuf::from(".syncstore/locks")
}

fn default_lock_timeout_ms() -> u64 {
    10_000
}

fn default_auto_release_ms() -> Option<u64> {
    Some(60_000)
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            backend: default_lock_backend(),
            dir: default_lock_dir(),
            redis: RedisConfig::default(),
            timeout_ms: default_lock_timeout_ms(),
            auto_release_ms: default_auto_release_ms(),
        }
    }
}

impl LockConfig {
    pub fn acquire_options(&self) -> AcquireOptions {
        AcquireOptions {
            timeout: Duration::from_millis(self.timeout_ms),
            auto_release_after: self.auto_release_ms.map(Duration::from_millis),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RedisConfig {
    #[serde(default = "default_redis_host")]
    pub host: String,

    #[serde(default = "default_redis_port")]
    pub port: u16,

    #[serde(default)]
    pub password: Option<String>,

    /// Independent instances as `redis://` URLs. When empty, `host` and
    /// `port` name the only instance.
    #[serde(default)]
    pub instances: Vec<String>,
}

fn default_redis_host() -> String {
    "127.0.0.1".to_string()
}

fn default_redis_port() -> u16 {
    6379
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            host: default_redis_host(),
            port: default_redis_port(),
            password: None,
            instances: Vec::new(),
        }
    }
}

impl RedisConfig {
    pub fn urls(&self) -> Vec<String> {
        if !self.instances.is_empty() {
            return self.instances.clone();
        }
        let url = match &self.password {
            Some(password) => format!("redis://:{}@{}:{}", password, self.host, self.port),
            None => format!("redis://{}:{}", self.host, self.port),
        };
        vec![url]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueConfig {
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,

    #[serde(default)]
    pub delay_when_empty_ms: u64,
}

fn default_max_concurrency() -> usize {
    4
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_concurrency: default_max_concurrency(),
            delay_when_empty_ms: 0,
        }
    }
}

impl QueueConfig {
    pub fn options(&self) -> QueueOptions {
        QueueOptions {
            max_concurrency: self.max_concurrency,
            delay_when_empty: Duration::from_millis(self.delay_when_empty_ms),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteConfig {
    /// Base URL of the sync server
    #[serde(default)]
    pub url: Option<String>,

    /// Identifier forwarded to the remote with every request
    #[serde(default)]
    pub remote_id: Option<String>,
}

/// A single configuration problem, tagged with its section.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    Storage(String),
    Lock(String),
    Queue(String),
    Remote(String),
    Logging(String),
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ValidationError::Storage(msg) => write!(f, "Storage: {}", msg),
            ValidationError::Lock(msg) => write!(f, "Lock: {}", msg),
            ValidationError::Queue(msg) => write!(f, "Queue: {}", msg),
            ValidationError::Remote(msg) => write!(f, "Remote: {}", msg),
            ValidationError::Logging(msg) => write!(f, "Logging: {}", msg),
        }
    }
}

impl std::error::Error for ValidationError {}

impl SyncStoreConfig {
    /// Validate the entire configuration, reporting every problem at once.
    pub fn validate(&self) -> Result<(), Vec<ValidationError>> {
        let mut errors = Vec::new();

        if self.storage.backend != StorageBackendKind::Memory
            && self.storage.root_path.as_os_str().is_empty()
        {
            errors.push(ValidationError::Storage("root_path cannot be empty".to_string()));
        }
        if self.storage.bucket.is_some() && self.storage.backend != StorageBackendKind::Sled {
            errors.push(ValidationError::Storage(
                "bucket is only supported by the sled backend".to_string(),
            ));
        }

        match self.lock.backend {
            LockBackendKind::File if self.lock.dir.as_os_str().is_empty() => {
                errors.push(ValidationError::Lock("dir cannot be empty".to_string()));
            }
            LockBackendKind::Redis => {
                if self.lock.redis.instances.is_empty() && self.lock.redis.host.is_empty() {
                    errors.push(ValidationError::Lock("redis host cannot be empty".to_string()));
                }
                for url in &self.lock.redis.instances {
                    if !url.starts_with("redis://") && !url.starts_with("rediss://") {
                        errors.push(ValidationError::Lock(format!(
                            "redis instance {} is not a redis:// URL",
                            url
                        )));
                    }
                }
            }
            _ => {}
        }
        if self.lock.timeout_ms == 0 {
            errors.push(ValidationError::Lock("timeout_ms must be positive".to_string()));
        }

        if self.queue.max_concurrency == 0 {
            errors.push(ValidationError::Queue(
                "max_concurrency must be at least 1".to_string(),
            ));
        }

        if let Some(url) = &self.remote.url {
            if !url.starts_with("http://") && !url.starts_with("https://") {
                errors.push(ValidationError::Remote(format!("{} is not an http(s) URL", url)));
            }
        }

        if let Err(e) = self.logging.validate() {
            errors.push(ValidationError::Logging(e));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

/// Loads [`SyncStoreConfig`] from its layered sources.
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load for `workspace_root`: global file, workspace files, environment.
    pub fn load(workspace_root: &Path) -> Result<SyncStoreConfig, ConfigError> {
        let builder = Config::builder();
        let builder = sources::global_file::add_to_builder(builder);
        let builder = sources::workspace_file::add_to_builder(builder, workspace_root);
        let config = builder.add_source(environment()).build()?;
        Self::finish(config.try_deserialize()?)
    }

    /// Load from a single file plus environment overrides.
    pub fn load_from_file(path: &Path) -> Result<SyncStoreConfig, ConfigError> {
        let config = Config::builder()
            .add_source(File::from(path))
            .add_source(environment())
            .build()?;
        Self::finish(config.try_deserialize()?)
    }

    fn finish(config: SyncStoreConfig) -> Result<SyncStoreConfig, ConfigError> {
        config.validate().map_err(|errors| {
            let messages: Vec<String> = errors.iter().map(|e| e.to_string()).collect();
            ConfigError::Invalid(format!(
                "Configuration validation failed:\n{}",
                messages.join("\n")
            ))
        })?;
        Ok(config)
    }
}

fn environment() -> Environment {
    Environment::with_prefix("SYNCSTORE")
        .separator("__")
        .try_parsing(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_defaults_are_valid() {
        let config = SyncStoreConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.storage.backend, StorageBackendKind::Filesystem);
        assert_eq!(config.lock.acquire_options().timeout, Duration::from_secs(10));
        assert_eq!(config.queue.options().max_concurrency, 4);
    }

    #[test]
    fn test_validate_reports_every_error() {
        let mut config = SyncStoreConfig::default();
        config.queue.max_concurrency = 0;
        config.lock.timeout_ms = 0;
        config.storage.bucket = Some("shared".to_string());
        config.remote.url = Some("ftp://example".to_string());

        let errors = config.validate().unwrap_err();
        assert_eq!(errors.len(), 4);
        assert!(errors.contains(&ValidationError::Queue(
            "max_concurrency must be at least 1".to_string()
        )));
    }

    #[test]
    fn test_load_workspace_file() {
        let workspace = TempDir::new().unwrap();
        let config_dir = workspace.path().join("config");
        fs::create_dir_all(&config_dir).unwrap();
        fs::write(
            config_dir.join("config.toml"),
            r#"
[storage]
backend = "sled"
root_path = "/var/lib/syncstore"
bucket = "primary"

[lock]
backend = "redis"

[lock.redis]
instances = ["redis://a:6379", "redis://b:6379", "redis://c:6379"]

[queue]
max_concurrency = 2
delay_when_empty_ms = 25
"#,
        )
        .unwrap();

        let config = ConfigLoader::load(workspace.path()).unwrap();
        assert_eq!(config.storage.backend, StorageBackendKind::Sled);
        assert_eq!(config.storage.bucket.as_deref(), Some("primary"));
        assert_eq!(config.lock.redis.urls().len(), 3);
        assert_eq!(config.queue.options().delay_when_empty, Duration::from_millis(25));
    }

    #[test]
    fn test_invalid_file_is_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bad.toml");
        fs::write(&path, "[queue]\nmax_concurrency = 0\n").unwrap();
        assert!(matches!(
            ConfigLoader::load_from_file(&path),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn test_redis_url_from_host() {
        let redis = RedisConfig {
            password: Some("secret".to_string()),
            ..RedisConfig::default()
        };
        assert_eq!(redis.urls(), vec!["redis://:secret@127.0.0.1:6379"]);
    }
}
