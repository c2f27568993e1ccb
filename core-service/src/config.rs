//! Service-level configuration bundling the per-component settings.

use crate::error::{CoreError, Result};
use core_playback::{BridgeConfig, CacheConfig, PreloadConfig};
use serde::{Deserialize, Serialize};

/// Configuration for [`AudioCacheService`](crate::AudioCacheService).
///
/// Every section is optional in JSON; missing sections take their defaults.
///
/// ```
/// use core_service::ServiceConfig;
///
/// let config = ServiceConfig::from_json(r#"{
///     "cache": { "root_directory": "/tmp/player" },
///     "preload": { "segment_limit": 4 }
/// }"#).unwrap();
/// assert_eq!(config.preload.segment_limit, 4);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceConfig {
    #[serde(default)]
    pub cache: CacheConfig,

    #[serde(default)]
    pub preload: PreloadConfig,

    #[serde(default)]
    pub bridge: BridgeConfig,

    /// Playback fraction after which the next track in the queue is
    /// preloaded at high priority.
    ///
    /// Default: 0.5.
    #[serde(default = "default_prefetch_threshold")]
    pub prefetch_threshold: f32,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            cache: CacheConfig::default(),
            preload: PreloadConfig::default(),
            bridge: BridgeConfig::default(),
            prefetch_threshold: default_prefetch_threshold(),
        }
    }
}

impl ServiceConfig {
    pub fn new(cache: CacheConfig) -> Self {
        Self {
            cache,
            ..Default::default()
        }
    }

    pub fn with_preload(mut self, preload: PreloadConfig) -> Self {
        self.preload = preload;
        self
    }

    pub fn with_bridge(mut self, bridge: BridgeConfig) -> Self {
        self.bridge = bridge;
        self
    }

    pub fn with_prefetch_threshold(mut self, threshold: f32) -> Self {
        self.prefetch_threshold = threshold;
        self
    }

    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| CoreError::Config(e.to_string()))
    }

    pub fn validate(&self) -> Result<()> {
        self.cache.validate()?;
        self.preload.validate()?;
        self.bridge.validate()?;
        if !(self.prefetch_threshold > 0.0 && self.prefetch_threshold <= 1.0) {
            return Err(CoreError::Config(format!(
                "prefetch_threshold must be in (0, 1], got {}",
                self.prefetch_threshold
            )));
        }
        Ok(())
    }
}

fn default_prefetch_threshold() -> f32 {
    0.5
}
