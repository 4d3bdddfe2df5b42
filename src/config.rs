//! Cache configuration
//!
//! Defaults match the limits the browsing client has always shipped with.
//! Every value can be overridden at construction or from the environment.

use std::path::PathBuf;
use std::time::Duration;

use tracing::warn;

/// Default maximum blob store size: 500 MB
pub const DEFAULT_MAX_CACHE_SIZE: u64 = 500 * 1024 * 1024;

/// Default maximum blob age: 7 days
pub const DEFAULT_MAX_CACHE_AGE: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Default metadata cache capacity in entries
pub const DEFAULT_METADATA_CAPACITY: usize = 100;

/// Default number of keys a single prefetch request may cover
pub const DEFAULT_PREFETCH_LIMIT: usize = 5;

/// Default listing API endpoint
pub const DEFAULT_API_BASE_URL: &str = "https://dokusha-extenstions.onrender.com/extensions";

/// HTTP client timeout
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Configuration for a cache manager instance
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Root directory holding the blob files and the index
    pub cache_dir: PathBuf,
    /// Maximum total blob size in bytes
    pub max_cache_size: u64,
    /// Blobs not accessed for longer than this are evicted
    pub max_cache_age: Duration,
    /// Maximum number of listing pages kept in memory
    pub metadata_capacity: usize,
    /// Maximum number of keys accepted per prefetch request
    pub prefetch_limit: usize,
    /// Base URL for listing requests
    pub api_base_url: String,
    /// Timeout applied to every remote request
    pub request_timeout: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            cache_dir: default_cache_dir(),
            max_cache_size: DEFAULT_MAX_CACHE_SIZE,
            max_cache_age: DEFAULT_MAX_CACHE_AGE,
            metadata_capacity: DEFAULT_METADATA_CAPACITY,
            prefetch_limit: DEFAULT_PREFETCH_LIMIT,
            api_base_url: DEFAULT_API_BASE_URL.to_string(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }
}

impl CacheConfig {
    /// Create a configuration rooted at `cache_dir` with default limits
    pub fn new(cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            cache_dir: cache_dir.into(),
            ..Self::default()
        }
    }

    /// Load configuration from environment variables, falling back to defaults
    ///
    /// Recognized variables:
    /// * `CONTENT_CACHE_DIR`
    /// * `CONTENT_CACHE_MAX_SIZE` (bytes)
    /// * `CONTENT_CACHE_MAX_AGE_SECS`
    /// * `CONTENT_CACHE_METADATA_CAPACITY`
    /// * `CONTENT_CACHE_PREFETCH_LIMIT`
    /// * `CONTENT_CACHE_API_URL`
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(dir) = std::env::var("CONTENT_CACHE_DIR") {
            config.cache_dir = PathBuf::from(dir);
        }
        if let Some(size) = env_number::<u64>("CONTENT_CACHE_MAX_SIZE") {
            config.max_cache_size = size;
        }
        if let Some(secs) = env_number::<u64>("CONTENT_CACHE_MAX_AGE_SECS") {
            config.max_cache_age = Duration::from_secs(secs);
        }
        if let Some(capacity) = env_number::<usize>("CONTENT_CACHE_METADATA_CAPACITY") {
            config.metadata_capacity = capacity;
        }
        if let Some(limit) = env_number::<usize>("CONTENT_CACHE_PREFETCH_LIMIT") {
            config.prefetch_limit = limit;
        }
        if let Ok(url) = std::env::var("CONTENT_CACHE_API_URL") {
            config.api_base_url = url;
        }

        config
    }

    pub fn with_max_cache_size(mut self, bytes: u64) -> Self {
        self.max_cache_size = bytes;
        self
    }

    pub fn with_max_cache_age(mut self, age: Duration) -> Self {
        self.max_cache_age = age;
        self
    }

    pub fn with_metadata_capacity(mut self, capacity: usize) -> Self {
        self.metadata_capacity = capacity;
        self
    }

    pub fn with_prefetch_limit(mut self, limit: usize) -> Self {
        self.prefetch_limit = limit;
        self
    }

    pub fn with_api_base_url(mut self, url: impl Into<String>) -> Self {
        self.api_base_url = url.into();
        self
    }

    /// Directory holding the content files
    pub fn blob_dir(&self) -> PathBuf {
        self.cache_dir.join("blobs")
    }

    /// Path of the persisted blob index
    pub fn index_path(&self) -> PathBuf {
        self.cache_dir.join("index.json")
    }
}

fn default_cache_dir() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join("content-cache")
}

fn env_number<T: std::str::FromStr>(name: &str) -> Option<T> {
    let raw = std::env::var(name).ok()?;
    match raw.trim().parse::<T>() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!(var = name, value = %raw, "Ignoring unparsable environment override");
            None
        }
    }
}
