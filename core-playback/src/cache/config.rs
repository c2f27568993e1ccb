//! Cache configuration and tier budgets

use crate::error::{PlaybackError, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Size of one memory-tier segment (512 KiB).
pub const DEFAULT_SEGMENT_SIZE: u64 = 512 * 1024;

/// Memory tier budget (100 MiB).
pub const DEFAULT_MEMORY_LIMIT_BYTES: u64 = 100 * 1024 * 1024;

/// Persistent tier budget (1 GiB).
pub const DEFAULT_DISK_LIMIT_BYTES: u64 = 1024 * 1024 * 1024;

/// Staging tier budget (500 MiB).
pub const DEFAULT_TEMP_LIMIT_BYTES: u64 = 500 * 1024 * 1024;

/// Staging files untouched for this long are expired (7 days).
pub const DEFAULT_TEMP_EXPIRY: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Extension used when the source URL does not carry one.
pub const DEFAULT_EXTENSION: &str = "mp3";

/// Configuration for the tiered audio cache.
///
/// Every field has a serde default so partial configuration files load.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Directory holding both the staging and persistent directories.
    #[serde(default = "default_root_directory")]
    pub root_directory: PathBuf,

    /// Staging directory name under the root (default: `MusicTemp`)
    #[serde(default = "default_temp_directory_name")]
    pub temp_directory_name: String,

    /// Persistent directory name under the root (default: `MusicCache`)
    #[serde(default = "default_cache_directory_name")]
    pub cache_directory_name: String,

    /// Segment size in bytes (default: 512 KiB)
    #[serde(default = "default_segment_size")]
    pub segment_size: u64,

    /// Memory tier budget in bytes (default: 100 MiB)
    #[serde(default = "default_memory_limit_bytes")]
    pub memory_limit_bytes: u64,

    /// Persistent tier budget in bytes (default: 1 GiB)
    #[serde(default = "default_disk_limit_bytes")]
    pub disk_limit_bytes: u64,

    /// Staging tier budget in bytes (default: 500 MiB)
    #[serde(default = "default_temp_limit_bytes")]
    pub temp_limit_bytes: u64,

    /// Age after which staging files are expired (default: 7 days)
    #[serde(default = "default_temp_expiry")]
    pub temp_expiry: Duration,

    /// Fallback file extension (default: `mp3`)
    #[serde(default = "default_extension")]
    pub default_extension: String,

    /// Record a SHA-256 checksum for every promoted file (default: true)
    #[serde(default = "default_verify_integrity")]
    pub verify_integrity: bool,
}

fn default_root_directory() -> PathBuf {
    std::env::temp_dir().join("audio-cache")
}

fn default_temp_directory_name() -> String {
    "MusicTemp".to_string()
}

fn default_cache_directory_name() -> String {
    "MusicCache".to_string()
}

fn default_segment_size() -> u64 {
    DEFAULT_SEGMENT_SIZE
}

fn default_memory_limit_bytes() -> u64 {
    DEFAULT_MEMORY_LIMIT_BYTES
}

fn default_disk_limit_bytes() -> u64 {
    DEFAULT_DISK_LIMIT_BYTES
}

fn default_temp_limit_bytes() -> u64 {
    DEFAULT_TEMP_LIMIT_BYTES
}

fn default_temp_expiry() -> Duration {
    DEFAULT_TEMP_EXPIRY
}

fn default_extension() -> String {
    DEFAULT_EXTENSION.to_string()
}

fn default_verify_integrity() -> bool {
    true
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            root_directory: default_root_directory(),
            temp_directory_name: default_temp_directory_name(),
            cache_directory_name: default_cache_directory_name(),
            segment_size: default_segment_size(),
            memory_limit_bytes: default_memory_limit_bytes(),
            disk_limit_bytes: default_disk_limit_bytes(),
            temp_limit_bytes: default_temp_limit_bytes(),
            temp_expiry: default_temp_expiry(),
            default_extension: default_extension(),
            verify_integrity: default_verify_integrity(),
        }
    }
}

impl CacheConfig {
    /// Create a configuration rooted at `root` with default budgets.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root_directory: root.into(),
            ..Self::default()
        }
    }

    /// Set the root directory.
    pub fn with_root_directory(mut self, root: impl Into<PathBuf>) -> Self {
        self.root_directory = root.into();
        self
    }

    /// Set segment size.
    pub fn with_segment_size(mut self, bytes: u64) -> Self {
        self.segment_size = bytes;
        self
    }

    /// Set memory tier budget.
    pub fn with_memory_limit(mut self, bytes: u64) -> Self {
        self.memory_limit_bytes = bytes;
        self
    }

    /// Set persistent tier budget.
    pub fn with_disk_limit(mut self, bytes: u64) -> Self {
        self.disk_limit_bytes = bytes;
        self
    }

    /// Set staging tier budget.
    pub fn with_temp_limit(mut self, bytes: u64) -> Self {
        self.temp_limit_bytes = bytes;
        self
    }

    /// Set staging expiry window.
    pub fn with_temp_expiry(mut self, expiry: Duration) -> Self {
        self.temp_expiry = expiry;
        self
    }

    /// Set fallback extension.
    pub fn with_default_extension(mut self, extension: impl Into<String>) -> Self {
        self.default_extension = extension.into();
        self
    }

    /// Enable or disable checksums on promotion.
    pub fn with_integrity_check(mut self, enabled: bool) -> Self {
        self.verify_integrity = enabled;
        self
    }

    /// `{root}/{temp_directory_name}`
    pub fn temp_directory(&self) -> PathBuf {
        self.root_directory.join(&self.temp_directory_name)
    }

    /// `{root}/{cache_directory_name}`
    pub fn cache_directory(&self) -> PathBuf {
        self.root_directory.join(&self.cache_directory_name)
    }

    /// Location of the persistent ledger.
    pub fn index_path(&self) -> PathBuf {
        self.cache_directory().join("index.json")
    }

    /// Validate configuration.
    pub fn validate(&self) -> Result<()> {
        if self.segment_size == 0 {
            return Err(invalid("segment_size must be greater than 0"));
        }

        if self.memory_limit_bytes < self.segment_size {
            return Err(invalid("memory_limit_bytes must hold at least one segment"));
        }

        if self.disk_limit_bytes == 0 || self.temp_limit_bytes == 0 {
            return Err(invalid("disk budgets must be greater than 0"));
        }

        if self.temp_directory_name.is_empty() || self.cache_directory_name.is_empty() {
            return Err(invalid("directory names cannot be empty"));
        }

        if self.temp_directory_name == self.cache_directory_name {
            return Err(invalid("staging and persistent directories must differ"));
        }

        let extension_ok = !self.default_extension.is_empty()
            && self.default_extension.len() <= 5
            && self
                .default_extension
                .chars()
                .all(|c| c.is_ascii_alphanumeric());
        if !extension_ok {
            return Err(invalid("default_extension must be 1-5 alphanumeric characters"));
        }

        Ok(())
    }
}

fn invalid(message: &str) -> PlaybackError {
    PlaybackError::InvalidConfig(message.to_string())
}
