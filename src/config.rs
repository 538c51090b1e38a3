use serde::Deserialize;
use std::path::PathBuf;

use crate::error::{ReaderError, Result};

/// Top-level configuration loaded from a TOML file.
///
/// This covers the read path's own knobs; the front-end that embeds this
/// crate (HTTP/WebDAV/FUSE, import pipeline, queue orchestration) owns its
/// own configuration surface.
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    /// Metadata store parameters.
    pub store: StoreConfig,
    /// Prefetching downloader parameters.
    #[serde(default)]
    pub downloader: DownloaderConfig,
    /// Segment cache parameters (optional).
    #[serde(default)]
    pub cache: CacheConfig,
}

/// Metadata store parameters.
#[derive(Debug, Deserialize, Clone)]
pub struct StoreConfig {
    /// Root directory holding `.meta` descriptors, `.meta.id` sidecars, and
    /// the `.ids/` sharded symlink index.
    pub root: PathBuf,
    /// Directory names under `root` that `cleanup_empty_directories` must
    /// never remove.
    #[serde(default = "default_protected_dirs")]
    pub protected_dirs: Vec<String>,
}

fn default_protected_dirs() -> Vec<String> {
    vec![".ids".to_string(), "corrupted_metadata".to_string()]
}

/// Prefetching downloader parameters.
#[derive(Debug, Deserialize, Clone)]
pub struct DownloaderConfig {
    /// Maximum number of segments scheduled ahead of the consumer.
    #[serde(default = "default_max_prefetch")]
    pub max_prefetch: usize,
    /// Per-attempt article fetch timeout.
    #[serde(default = "default_fetch_timeout_secs")]
    pub fetch_timeout_secs: u64,
    /// Total attempts (including the first) for a transient fetch error.
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,
    /// Fixed delay between retries for non-timeout transient errors.
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    /// Upper bound on how long `Close` waits for background tasks to exit.
    #[serde(default = "default_shutdown_timeout_secs")]
    pub shutdown_timeout_secs: u64,
    /// Upper bound on how long the health hook's writes may block a stream.
    #[serde(default = "default_health_timeout_secs")]
    pub health_timeout_secs: u64,
    /// Consecutive streaming failures before a file is masked from listings.
    #[serde(default = "default_mask_threshold")]
    pub mask_threshold: u32,
}

impl Default for DownloaderConfig {
    fn default() -> Self {
        Self {
            max_prefetch: default_max_prefetch(),
            fetch_timeout_secs: default_fetch_timeout_secs(),
            retry_attempts: default_retry_attempts(),
            retry_delay_ms: default_retry_delay_ms(),
            shutdown_timeout_secs: default_shutdown_timeout_secs(),
            health_timeout_secs: default_health_timeout_secs(),
            mask_threshold: default_mask_threshold(),
        }
    }
}

fn default_max_prefetch() -> usize {
    30
}
fn default_fetch_timeout_secs() -> u64 {
    15
}
fn default_retry_attempts() -> u32 {
    5
}
fn default_retry_delay_ms() -> u64 {
    20
}
fn default_shutdown_timeout_secs() -> u64 {
    30
}
fn default_health_timeout_secs() -> u64 {
    5
}
fn default_mask_threshold() -> u32 {
    3
}

/// Optional segment cache parameters.
#[derive(Debug, Deserialize, Clone)]
pub struct CacheConfig {
    /// Whether the in-memory LRU segment cache is enabled.
    #[serde(default)]
    pub enabled: bool,
    /// Maximum number of cached article bodies.
    #[serde(default = "default_cache_capacity")]
    pub capacity: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self { enabled: false, capacity: default_cache_capacity() }
    }
}

fn default_cache_capacity() -> usize {
    512
}

impl Config {
    /// Load configuration from a TOML file at `path`.
    pub fn from_file(path: &std::path::Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ReaderError::Config(format!("cannot read config file: {e}")))?;
        let config: Config = toml::from_str(&content)
            .map_err(|e| ReaderError::Config(format!("invalid TOML: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.downloader.max_prefetch == 0 {
            return Err(ReaderError::Config("max_prefetch must be > 0".into()));
        }
        if self.downloader.retry_attempts == 0 {
            return Err(ReaderError::Config("retry_attempts must be > 0".into()));
        }
        Ok(())
    }
}
