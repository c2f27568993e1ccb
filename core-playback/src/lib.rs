//! # Progressive Audio Cache
//!
//! Tiered cache for audio streamed over HTTP.
//!
//! ## Overview
//!
//! This crate handles:
//! - Segment-granular memory tier, staging files and a persistent tier with a
//!   JSON ledger (`cache`)
//! - Background preloading of upcoming tracks by priority (`preload`)
//! - Serving a player's byte-range reads from the tiers or the network
//!   (`bridge`)

pub mod bridge;
pub mod cache;
pub mod config;
pub mod error;
pub mod preload;

pub use bridge::{ContentInfo, StreamBridge, StreamSource};
pub use cache::{CacheConfig, CacheOrchestrator, CacheState, CacheStatistics, TrackCacheInfo};
pub use config::{BridgeConfig, PreloadConfig};
pub use error::{PlaybackError, Result};
pub use preload::{PreloadPriority, PreloadScheduler, PreloadStatistics, PreloadTask};
