//! # Tiered Audio Cache
//!
//! Three tiers behind one façade:
//!
//! ```text
//! ┌──────────────────────────────────────────┐
//! │            CacheOrchestrator             │
//! │  - cache_state() / cached_path()         │
//! │  - finalize_current_song()   L1 -> L2    │
//! │  - confirm_complete_song()   L2 -> L3    │
//! └────────┬─────────────────────────────────┘
//!          │
//!          ├──> SegmentStore     (L1, memory, LRU by cost)
//!          ├──> StagingStore     (L2, `MusicTemp/{id}.{ext}.tmp`)
//!          └──> PersistentStore  (L3, `MusicCache/{id}.{ext}`)
//!                 └──> CacheIndex (`MusicCache/index.json`)
//! ```
//!
//! ## Usage
//!
//! ```rust,ignore
//! use core_playback::cache::{CacheConfig, CacheOrchestrator, CacheState};
//! use bridge_traits::time::SystemClock;
//! use std::sync::Arc;
//!
//! let cache = CacheOrchestrator::open(CacheConfig::new("/var/cache/app"), Arc::new(SystemClock)).await?;
//!
//! cache.store_segment("T1", 0, first_segment);
//! // ... song switch
//! let state = cache.save_and_finalize_song("T1", Some(declared_length)).await?;
//! assert_eq!(state, CacheState::Complete);
//! ```

pub mod config;
pub mod files;
pub mod index;
pub mod inflight;
pub mod locks;
pub mod orchestrator;
pub mod persistent;
pub mod segment;
pub mod staging;
pub mod state;
pub mod stats;

pub use config::CacheConfig;
pub use index::{CacheIndex, PersistentEntry};
pub use inflight::{FetchStatus, InFlightSegments};
pub use orchestrator::CacheOrchestrator;
pub use persistent::PersistentStore;
pub use segment::{Segment, SegmentStore};
pub use staging::StagingStore;
pub use state::CacheState;
pub use stats::{CacheStatistics, TrackCacheInfo};
