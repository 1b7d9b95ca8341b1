use crate::error::{CortexError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Top-level engine configuration. Every block falls back to defaults, so a
/// TOML file only needs the keys it overrides.
///
/// ```toml
/// [history]
/// max_versions_per_file = 50
///
/// [transclusion]
/// max_depth = 16
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CortexConfig {
    pub storage: StorageConfig,
    pub index: IndexConfig,
    pub history: HistoryConfig,
    pub transclusion: TransclusionConfig,
    pub rate_limit: RateLimitConfig,
}

impl CortexConfig {
    /// Read and validate a TOML config file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            CortexError::Config(format!("Failed to read {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&text)
    }

    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: CortexConfig = toml::from_str(text)
            .map_err(|e| CortexError::Config(format!("Invalid config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self)
            .map_err(|e| CortexError::Config(format!("Failed to render config: {}", e)))
    }

    pub fn validate(&self) -> Result<()> {
        if self.storage.max_file_bytes == 0 {
            return Err(CortexError::Config("storage.max_file_bytes must be > 0".into()));
        }
        if self.storage.allowed_extensions.is_empty() {
            return Err(CortexError::Config(
                "storage.allowed_extensions must list at least one extension".into(),
            ));
        }
        if self.storage.lock_timeout_ms == 0 {
            return Err(CortexError::Config("storage.lock_timeout_ms must be > 0".into()));
        }
        if self.storage.retry.max_attempts == 0 {
            return Err(CortexError::Config("storage.retry.max_attempts must be >= 1".into()));
        }
        if self.index.file_name.is_empty() || self.index.file_name.contains(['/', '\\']) {
            return Err(CortexError::Config(
                "index.file_name must be a plain file name".into(),
            ));
        }
        if self.history.max_versions_per_file == 0 {
            return Err(CortexError::Config(
                "history.max_versions_per_file must be >= 1".into(),
            ));
        }
        if self.transclusion.cache_capacity == 0 {
            return Err(CortexError::Config("transclusion.cache_capacity must be > 0".into()));
        }
        if self.rate_limit.enabled
            && (self.rate_limit.ops_per_second <= 0.0 || self.rate_limit.burst == 0)
        {
            return Err(CortexError::Config(
                "rate_limit.ops_per_second and rate_limit.burst must be positive".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Files larger than this are refused before hashing or parsing.
    pub max_file_bytes: u64,
    /// Extensions (without dot, case-insensitive) that count as knowledge files.
    pub allowed_extensions: Vec<String>,
    /// How long a writer waits for the per-file lock.
    pub lock_timeout_ms: u64,
    /// Lock markers older than this are considered abandoned on startup.
    pub stale_lock_secs: u64,
    pub retry: RetryConfig,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            max_file_bytes: 1024 * 1024,
            allowed_extensions: vec!["md".into(), "markdown".into(), "txt".into()],
            lock_timeout_ms: 5_000,
            stale_lock_secs: 300,
            retry: RetryConfig::default(),
        }
    }
}

impl StorageConfig {
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    pub fn stale_lock_after(&self) -> Duration {
        Duration::from_secs(self.stale_lock_secs)
    }
}

/// Backoff for transient I/O errors.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 10,
            max_delay_ms: 200,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexConfig {
    /// Name of the index file inside the `.cortex` directory.
    pub file_name: String,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            file_name: "index.json".into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HistoryConfig {
    /// Snapshots kept per file; the oldest are pruned first.
    pub max_versions_per_file: usize,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            max_versions_per_file: 20,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransclusionConfig {
    /// Default nesting limit when the caller does not pass one.
    pub max_depth: usize,
    /// Number of resolved sub-renderings kept in memory.
    pub cache_capacity: usize,
}

impl Default for TransclusionConfig {
    fn default() -> Self {
        Self {
            max_depth: 10,
            cache_capacity: 256,
        }
    }
}

/// Global token bucket shared by reads and writes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub enabled: bool,
    pub ops_per_second: f64,
    pub burst: u32,
    /// How long a caller may wait for a token before `RateLimited`.
    pub max_wait_ms: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ops_per_second: 500.0,
            burst: 100,
            max_wait_ms: 2_000,
        }
    }
}
