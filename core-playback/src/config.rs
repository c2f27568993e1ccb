//! # Scheduler and Bridge Configuration
//!
//! Configuration types for the preload scheduler and the stream bridge. Cache
//! tier budgets live in [`crate::cache::CacheConfig`].

use crate::error::{PlaybackError, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Preload scheduler configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PreloadConfig {
    /// Number of preload tasks allowed to run at once.
    ///
    /// Default: 1.
    #[serde(default = "default_max_concurrent_tasks")]
    pub max_concurrent_tasks: usize,

    /// Segments to fetch per track before stopping. `0` means the whole track.
    ///
    /// Default: 0.
    #[serde(default)]
    pub segment_limit: u32,

    /// Maximum duration to wait for the response headers of a preload fetch.
    ///
    /// Default: 30 seconds.
    #[serde(default = "default_fetch_timeout")]
    pub fetch_timeout: Duration,
}

impl Default for PreloadConfig {
    fn default() -> Self {
        Self {
            max_concurrent_tasks: default_max_concurrent_tasks(),
            segment_limit: 0,
            fetch_timeout: default_fetch_timeout(),
        }
    }
}

impl PreloadConfig {
    /// Prefetch only enough of each track to start playback instantly.
    pub fn just_enough(segments: u32) -> Self {
        Self {
            segment_limit: segments,
            ..Default::default()
        }
    }

    pub fn with_max_concurrent_tasks(mut self, count: usize) -> Self {
        self.max_concurrent_tasks = count;
        self
    }

    pub fn with_segment_limit(mut self, segments: u32) -> Self {
        self.segment_limit = segments;
        self
    }

    pub fn with_fetch_timeout(mut self, timeout: Duration) -> Self {
        self.fetch_timeout = timeout;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_concurrent_tasks == 0 {
            return Err(PlaybackError::InvalidConfig(
                "max_concurrent_tasks must be at least 1".to_string(),
            ));
        }
        if self.fetch_timeout.is_zero() {
            return Err(PlaybackError::InvalidConfig(
                "fetch_timeout must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// Stream bridge configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BridgeConfig {
    /// Scheme of the stream URLs handed to the player.
    ///
    /// Default: `audiocache`.
    #[serde(default = "default_url_scheme")]
    pub url_scheme: String,

    /// Maximum duration to wait for the response headers of a range fetch.
    ///
    /// Default: 30 seconds.
    #[serde(default = "default_fetch_timeout")]
    pub fetch_timeout: Duration,

    /// How often a read re-fetches segments evicted before it could assemble
    /// its answer.
    ///
    /// Default: 3.
    #[serde(default = "default_max_read_attempts")]
    pub max_read_attempts: u32,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            url_scheme: default_url_scheme(),
            fetch_timeout: default_fetch_timeout(),
            max_read_attempts: default_max_read_attempts(),
        }
    }
}

impl BridgeConfig {
    pub fn with_url_scheme(mut self, scheme: impl Into<String>) -> Self {
        self.url_scheme = scheme.into();
        self
    }

    pub fn with_fetch_timeout(mut self, timeout: Duration) -> Self {
        self.fetch_timeout = timeout;
        self
    }

    pub fn validate(&self) -> Result<()> {
        let scheme_ok = !self.url_scheme.is_empty()
            && self
                .url_scheme
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '+' || c == '-' || c == '.');
        if !scheme_ok {
            return Err(PlaybackError::InvalidConfig(format!(
                "invalid url_scheme: {:?}",
                self.url_scheme
            )));
        }
        if self.max_read_attempts == 0 {
            return Err(PlaybackError::InvalidConfig(
                "max_read_attempts must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

fn default_max_concurrent_tasks() -> usize {
    1
}

fn default_fetch_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_url_scheme() -> String {
    "audiocache".to_string()
}

fn default_max_read_attempts() -> u32 {
    3
}
