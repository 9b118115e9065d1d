//! Cache configuration for user-configurable cache sizes and locations.
//!
//! Configuration can be loaded from a TOML file, environment variables, or
//! created programmatically.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

const MB: usize = 1024 * 1024;

fn megabytes(mb: usize, name: &str) -> Result<usize, ConfigError> {
    mb.checked_mul(MB).ok_or_else(|| ConfigError::InvalidValue(format!("{name}={mb}")))
}

/// What the memory tier keeps for a loaded image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemoryPayload {
    /// Decoded pixels: fastest hits, largest footprint.
    #[default]
    Decoded,
    /// Encoded bytes: compact, decoded again on every hit.
    Encoded,
}

impl FromStr for MemoryPayload {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "decoded" => Ok(Self::Decoded),
            "encoded" => Ok(Self::Encoded),
            _ => Err(ConfigError::InvalidValue(format!("memory_payload={s}"))),
        }
    }
}

impl fmt::Display for MemoryPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Decoded => f.write_str("decoded"),
            Self::Encoded => f.write_str("encoded"),
        }
    }
}

/// Configuration for the cache system.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheConfig {
    /// Memory tier size limit in bytes
    pub memory_cache_size: usize,
    /// Disk tier size limit in bytes
    pub disk_cache_size: usize,
    /// Directory path for disk cache storage
    pub disk_cache_dir: PathBuf,
    /// Whether the memory tier keeps decoded pixels or encoded bytes
    pub memory_payload: MemoryPayload,
    /// How long a failed load is remembered before a new fetch is allowed
    pub failure_grace: Duration,
    /// Maximum number of prefetches running at once
    pub prefetch_concurrency: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            memory_cache_size: 128 * MB,
            disk_cache_size: 512 * MB,
            disk_cache_dir: Self::default_cache_dir(),
            memory_payload: MemoryPayload::Decoded,
            failure_grace: Duration::from_secs(1),
            prefetch_concurrency: 4,
        }
    }
}

/// On-disk representation; every key is optional so partial files work.
#[derive(Debug, Default, Serialize, Deserialize)]
struct ConfigFile {
    memory_cache_mb: Option<usize>,
    disk_cache_mb: Option<usize>,
    disk_cache_dir: Option<PathBuf>,
    memory_payload: Option<MemoryPayload>,
    failure_grace_ms: Option<u64>,
    prefetch_concurrency: Option<usize>,
}

impl CacheConfig {
    /// Creates a new cache configuration with sizes in megabytes.
    pub fn new(memory_mb: usize, disk_mb: usize, disk_dir: PathBuf) -> Self {
        Self {
            memory_cache_size: memory_mb.saturating_mul(MB),
            disk_cache_size: disk_mb.saturating_mul(MB),
            disk_cache_dir: disk_dir,
            ..Self::default()
        }
    }

    /// Sets the memory cache size in megabytes, saturating on overflow.
    pub fn with_memory_mb(mut self, mb: usize) -> Self {
        self.memory_cache_size = mb.saturating_mul(MB);
        self
    }

    /// Sets the disk cache size in megabytes, saturating on overflow.
    pub fn with_disk_mb(mut self, mb: usize) -> Self {
        self.disk_cache_size = mb.saturating_mul(MB);
        self
    }

    /// Sets the disk cache directory.
    pub fn with_disk_dir<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.disk_cache_dir = path.as_ref().to_path_buf();
        self
    }

    pub fn with_memory_payload(mut self, payload: MemoryPayload) -> Self {
        self.memory_payload = payload;
        self
    }

    pub fn with_failure_grace(mut self, grace: Duration) -> Self {
        self.failure_grace = grace;
        self
    }

    pub fn with_prefetch_concurrency(mut self, limit: usize) -> Self {
        self.prefetch_concurrency = limit.max(1);
        self
    }

    /// Returns the default cache directory for the current platform.
    ///
    /// - macOS: ~/Library/Caches/imgcache/images
    /// - Linux: ~/.cache/imgcache/images
    /// - Windows: %LOCALAPPDATA%\imgcache\images
    pub fn default_cache_dir() -> PathBuf {
        if let Some(cache_dir) = dirs::cache_dir() {
            cache_dir.join("imgcache").join("images")
        } else {
            // Fallback to current directory if cache dir unavailable
            PathBuf::from("cache/images")
        }
    }

    /// Loads configuration from environment variables on top of the defaults.
    ///
    /// Environment variables:
    /// - `IMGCACHE_MEMORY_CACHE_MB`: memory tier size in MB
    /// - `IMGCACHE_DISK_CACHE_MB`: disk tier size in MB
    /// - `IMGCACHE_CACHE_DIR`: disk cache directory path
    /// - `IMGCACHE_MEMORY_PAYLOAD`: `decoded` or `encoded`
    /// - `IMGCACHE_FAILURE_GRACE_MS`: failure grace window in milliseconds
    /// - `IMGCACHE_PREFETCH_CONCURRENCY`: concurrent prefetch limit
    ///
    /// # Errors
    /// Returns an error if any environment variable contains an invalid value.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::default().merge_env()
    }

    /// Applies any `IMGCACHE_*` environment variables to this configuration.
    pub fn merge_env(mut self) -> Result<Self, ConfigError> {
        fn parse<T: FromStr>(name: &str, value: &str) -> Result<T, ConfigError> {
            value.trim().parse::<T>().map_err(|_| ConfigError::InvalidValue(name.to_string()))
        }

        if let Ok(val) = std::env::var("IMGCACHE_MEMORY_CACHE_MB") {
            let mb = parse::<usize>("IMGCACHE_MEMORY_CACHE_MB", &val)?;
            self.memory_cache_size = megabytes(mb, "IMGCACHE_MEMORY_CACHE_MB")?;
        }
        if let Ok(val) = std::env::var("IMGCACHE_DISK_CACHE_MB") {
            let mb = parse::<usize>("IMGCACHE_DISK_CACHE_MB", &val)?;
            self.disk_cache_size = megabytes(mb, "IMGCACHE_DISK_CACHE_MB")?;
        }
        if let Ok(val) = std::env::var("IMGCACHE_CACHE_DIR") {
            self.disk_cache_dir = PathBuf::from(val);
        }
        if let Ok(val) = std::env::var("IMGCACHE_MEMORY_PAYLOAD") {
            self.memory_payload = val
                .parse()
                .map_err(|_| ConfigError::InvalidValue("IMGCACHE_MEMORY_PAYLOAD".to_string()))?;
        }
        if let Ok(val) = std::env::var("IMGCACHE_FAILURE_GRACE_MS") {
            self.failure_grace =
                Duration::from_millis(parse::<u64>("IMGCACHE_FAILURE_GRACE_MS", &val)?);
        }
        if let Ok(val) = std::env::var("IMGCACHE_PREFETCH_CONCURRENCY") {
            let limit = parse::<usize>("IMGCACHE_PREFETCH_CONCURRENCY", &val)?;
            if limit == 0 {
                return Err(ConfigError::InvalidValue("IMGCACHE_PREFETCH_CONCURRENCY".to_string()));
            }
            self.prefetch_concurrency = limit;
        }

        Ok(self)
    }

    /// Loads configuration from a TOML file.
    ///
    /// Expected file format (every key optional):
    /// ```toml
    /// memory_cache_mb = 128
    /// disk_cache_mb = 512
    /// disk_cache_dir = "/path/to/cache"
    /// memory_payload = "decoded"
    /// failure_grace_ms = 1000
    /// prefetch_concurrency = 4
    /// ```
    ///
    /// # Errors
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path.as_ref())?;
        Self::from_toml(&contents)
    }

    /// Parses configuration from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self, ConfigError> {
        let file: ConfigFile = toml::from_str(toml_str)?;
        let mut config = Self::default();

        if let Some(mb) = file.memory_cache_mb {
            config.memory_cache_size = megabytes(mb, "memory_cache_mb")?;
        }
        if let Some(mb) = file.disk_cache_mb {
            config.disk_cache_size = megabytes(mb, "disk_cache_mb")?;
        }
        if let Some(dir) = file.disk_cache_dir {
            config.disk_cache_dir = dir;
        }
        if let Some(payload) = file.memory_payload {
            config.memory_payload = payload;
        }
        if let Some(ms) = file.failure_grace_ms {
            config.failure_grace = Duration::from_millis(ms);
        }
        if let Some(limit) = file.prefetch_concurrency {
            if limit == 0 {
                return Err(ConfigError::InvalidValue("prefetch_concurrency".to_string()));
            }
            config.prefetch_concurrency = limit;
        }

        Ok(config)
    }

    /// Saves configuration to a TOML file.
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        fs::write(path.as_ref(), self.to_toml()?)?;
        Ok(())
    }

    /// Converts configuration to TOML format.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        let file = ConfigFile {
            memory_cache_mb: Some(self.memory_cache_mb()),
            disk_cache_mb: Some(self.disk_cache_mb()),
            disk_cache_dir: Some(self.disk_cache_dir.clone()),
            memory_payload: Some(self.memory_payload),
            failure_grace_ms: Some(self.failure_grace.as_millis() as u64),
            prefetch_concurrency: Some(self.prefetch_concurrency),
        };
        Ok(toml::to_string(&file)?)
    }

    /// Returns the memory cache size in megabytes.
    pub fn memory_cache_mb(&self) -> usize {
        self.memory_cache_size / MB
    }

    /// Returns the disk cache size in megabytes.
    pub fn disk_cache_mb(&self) -> usize {
        self.disk_cache_size / MB
    }
}

/// Errors that can occur during configuration operations.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid value for configuration key: {0}")]
    InvalidValue(String),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("could not parse configuration: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("could not serialize configuration: {0}")]
    Serialize(#[from] toml::ser::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::env;

    const ENV_VARS: [&str; 6] = [
        "IMGCACHE_MEMORY_CACHE_MB",
        "IMGCACHE_DISK_CACHE_MB",
        "IMGCACHE_CACHE_DIR",
        "IMGCACHE_MEMORY_PAYLOAD",
        "IMGCACHE_FAILURE_GRACE_MS",
        "IMGCACHE_PREFETCH_CONCURRENCY",
    ];

    // Saves and restores environment variables around a test
    struct EnvGuard {
        vars: Vec<(String, Option<String>)>,
    }

    impl EnvGuard {
        fn new(var_names: &[&str]) -> Self {
            let vars = var_names.iter().map(|name| (name.to_string(), env::var(name).ok())).collect();
            for name in var_names {
                env::remove_var(name);
            }
            Self { vars }
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            for (name, value) in &self.vars {
                match value {
                    Some(v) => env::set_var(name, v),
                    None => env::remove_var(name),
                }
            }
        }
    }

    #[test]
    fn test_default_config() {
        let config = CacheConfig::default();
        assert_eq!(config.memory_cache_size, 128 * MB);
        assert_eq!(config.disk_cache_size, 512 * MB);
        assert_eq!(config.memory_payload, MemoryPayload::Decoded);
        assert_eq!(config.failure_grace, Duration::from_secs(1));
        assert_eq!(config.prefetch_concurrency, 4);
        assert!(config.disk_cache_dir.ends_with("images"));
    }

    #[test]
    fn test_builder_methods() {
        let config = CacheConfig::default()
            .with_memory_mb(64)
            .with_disk_mb(2048)
            .with_disk_dir("/custom/path")
            .with_memory_payload(MemoryPayload::Encoded)
            .with_failure_grace(Duration::ZERO)
            .with_prefetch_concurrency(0);

        assert_eq!(config.memory_cache_mb(), 64);
        assert_eq!(config.disk_cache_mb(), 2048);
        assert_eq!(config.disk_cache_dir, PathBuf::from("/custom/path"));
        assert_eq!(config.memory_payload, MemoryPayload::Encoded);
        assert_eq!(config.failure_grace, Duration::ZERO);
        assert_eq!(config.prefetch_concurrency, 1);
    }

    #[test]
    #[serial]
    fn test_from_env() {
        let _guard = EnvGuard::new(&ENV_VARS);

        env::set_var("IMGCACHE_MEMORY_CACHE_MB", "32");
        env::set_var("IMGCACHE_DISK_CACHE_MB", "256");
        env::set_var("IMGCACHE_CACHE_DIR", "/tmp/test-cache");
        env::set_var("IMGCACHE_MEMORY_PAYLOAD", "Encoded");
        env::set_var("IMGCACHE_FAILURE_GRACE_MS", "250");
        env::set_var("IMGCACHE_PREFETCH_CONCURRENCY", "8");

        let config = CacheConfig::from_env().unwrap();
        assert_eq!(config.memory_cache_size, 32 * MB);
        assert_eq!(config.disk_cache_size, 256 * MB);
        assert_eq!(config.disk_cache_dir, PathBuf::from("/tmp/test-cache"));
        assert_eq!(config.memory_payload, MemoryPayload::Encoded);
        assert_eq!(config.failure_grace, Duration::from_millis(250));
        assert_eq!(config.prefetch_concurrency, 8);
    }

    #[test]
    #[serial]
    fn test_from_env_partial() {
        let _guard = EnvGuard::new(&ENV_VARS);
        env::set_var("IMGCACHE_MEMORY_CACHE_MB", "32");

        let config = CacheConfig::from_env().unwrap();
        assert_eq!(config.memory_cache_size, 32 * MB);
        assert_eq!(config.disk_cache_size, 512 * MB); // default
    }

    #[test]
    #[serial]
    fn test_from_env_invalid() {
        let _guard = EnvGuard::new(&ENV_VARS);

        env::set_var("IMGCACHE_MEMORY_CACHE_MB", "not_a_number");
        assert!(matches!(CacheConfig::from_env(), Err(ConfigError::InvalidValue(_))));

        env::remove_var("IMGCACHE_MEMORY_CACHE_MB");
        env::set_var("IMGCACHE_PREFETCH_CONCURRENCY", "0");
        assert!(CacheConfig::from_env().is_err());
    }

    #[test]
    fn test_from_toml() {
        let toml = r#"
            # Test configuration
            memory_cache_mb = 16
            disk_cache_mb = 64
            disk_cache_dir = "/tmp/test"
            memory_payload = "encoded"
            failure_grace_ms = 0
            unknown_key = "ignored"
        "#;

        let config = CacheConfig::from_toml(toml).unwrap();
        assert_eq!(config.memory_cache_size, 16 * MB);
        assert_eq!(config.disk_cache_size, 64 * MB);
        assert_eq!(config.disk_cache_dir, PathBuf::from("/tmp/test"));
        assert_eq!(config.memory_payload, MemoryPayload::Encoded);
        assert_eq!(config.failure_grace, Duration::ZERO);
        assert_eq!(config.prefetch_concurrency, 4); // default
    }

    #[test]
    fn test_from_toml_invalid() {
        assert!(matches!(
            CacheConfig::from_toml("memory_cache_mb = \"lots\""),
            Err(ConfigError::Parse(_))
        ));
        assert!(matches!(
            CacheConfig::from_toml("memory_payload = \"compressed\""),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_oversized_megabytes_rejected() {
        let huge = usize::MAX / 1024;
        assert!(matches!(
            CacheConfig::from_toml(&format!("disk_cache_mb = {huge}")),
            Err(ConfigError::InvalidValue(_))
        ));
        assert_eq!(CacheConfig::default().with_memory_mb(huge).memory_cache_size, usize::MAX);
    }

    #[test]
    #[serial]
    fn test_from_env_oversized_megabytes() {
        let _guard = EnvGuard::new(&ENV_VARS);
        env::set_var("IMGCACHE_MEMORY_CACHE_MB", (usize::MAX / 1024).to_string());
        assert!(matches!(CacheConfig::from_env(), Err(ConfigError::InvalidValue(_))));
    }

    #[test]
    fn test_toml_roundtrip() {
        let config = CacheConfig::new(16, 64, PathBuf::from("/tmp/cache"))
            .with_memory_payload(MemoryPayload::Encoded)
            .with_failure_grace(Duration::from_millis(300));
        let toml = config.to_toml().unwrap();
        assert_eq!(CacheConfig::from_toml(&toml).unwrap(), config);
    }

    #[test]
    fn test_file_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let config_path = dir.path().join("imgcache.toml");

        let config = CacheConfig::new(16, 64, PathBuf::from("/tmp/cache"));
        config.save_to_file(&config_path).unwrap();

        assert_eq!(CacheConfig::from_file(&config_path).unwrap(), config);
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let result = CacheConfig::from_file(dir.path().join("missing.toml"));
        assert!(matches!(result, Err(ConfigError::Io(_))));
    }
}
