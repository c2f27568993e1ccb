//! # Cache Orchestrator
//!
//! Single façade over the three tiers:
//!
//! - Lookups resolve in tier order (persistent, staging, memory)
//! - Promotion pipeline: memory segments are flushed to a staging file on
//!   song switch, and a staging file whose size matches the declared length
//!   is moved into the persistent tier
//! - Deletion, eviction and statistics across tiers
//!
//! All multi-tier mutations for one track run under a per-track lock, so two
//! callers can never interleave a finalize and a confirm for the same track.

use crate::cache::config::CacheConfig;
use crate::cache::files::{self, extension_from_url};
use crate::cache::index::PersistentEntry;
use crate::cache::inflight::InFlightSegments;
use crate::cache::locks::KeyedLocks;
use crate::cache::persistent::PersistentStore;
use crate::cache::segment::{Segment, SegmentStore};
use crate::cache::staging::StagingStore;
use crate::cache::state::CacheState;
use crate::cache::stats::{CacheStatistics, TrackCacheInfo};
use crate::error::Result;
use bridge_traits::time::Clock;
use bytes::{Bytes, BytesMut};
use core_runtime::logging::redact_url;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// What the orchestrator knows about a track's remote source.
#[derive(Debug, Clone, Default)]
struct SourceInfo {
    original_url: Option<String>,
    content_length: Option<u64>,
}

/// Façade composing the memory, staging and persistent tiers.
pub struct CacheOrchestrator {
    config: CacheConfig,
    segments: SegmentStore,
    staging: StagingStore,
    persistent: PersistentStore,
    locks: KeyedLocks,
    sources: Mutex<HashMap<String, SourceInfo>>,
    in_flight: InFlightSegments,
}

impl CacheOrchestrator {
    /// Validate `config`, create the directories and load the ledger.
    ///
    /// # Errors
    ///
    /// Returns [`PlaybackError::InvalidConfig`](crate::PlaybackError::InvalidConfig),
    /// [`PlaybackError::LedgerCorrupted`](crate::PlaybackError::LedgerCorrupted)
    /// or an I/O error when a directory is inaccessible.
    #[instrument(skip_all, fields(root = %config.root_directory.display()))]
    pub async fn open(config: CacheConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        config.validate()?;

        let segments = SegmentStore::new(config.segment_size, config.memory_limit_bytes);
        let staging = StagingStore::open(
            config.temp_directory(),
            config.default_extension.clone(),
            config.temp_expiry,
        )
        .await?;
        let persistent = PersistentStore::open(
            config.cache_directory(),
            clock,
            config.disk_limit_bytes,
            config.verify_integrity,
        )
        .await?;

        info!("Cache orchestrator ready");
        Ok(Self {
            config,
            segments,
            staging,
            persistent,
            locks: KeyedLocks::new(),
            sources: Mutex::new(HashMap::new()),
            in_flight: InFlightSegments::new(),
        })
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Segments being downloaded into the memory tier right now.
    pub fn in_flight(&self) -> &InFlightSegments {
        &self.in_flight
    }

    pub fn segment_size(&self) -> u64 {
        self.config.segment_size
    }

    // ------------------------------------------------------------------
    // Source registry
    // ------------------------------------------------------------------

    /// Remember where a track streams from.
    pub fn record_original_url(&self, track_id: &str, url: &str) {
        debug!(track_id, url = %redact_url(url), "Recorded source URL");
        self.sources
            .lock()
            .entry(track_id.to_string())
            .or_default()
            .original_url = Some(url.to_string());
    }

    pub fn original_url(&self, track_id: &str) -> Option<String> {
        self.sources
            .lock()
            .get(track_id)
            .and_then(|s| s.original_url.clone())
    }

    /// Remember the total length the server declared for a track.
    pub fn record_content_length(&self, track_id: &str, length: u64) {
        self.sources
            .lock()
            .entry(track_id.to_string())
            .or_default()
            .content_length = Some(length);
    }

    /// Declared length if seen, else the length of the complete file.
    pub async fn content_length(&self, track_id: &str) -> Option<u64> {
        let declared = self
            .sources
            .lock()
            .get(track_id)
            .and_then(|s| s.content_length);
        match declared {
            Some(length) => Some(length),
            None => self.persistent.entry(track_id).await.map(|e| e.total_size),
        }
    }

    fn extension_hint(&self, track_id: &str) -> Option<String> {
        self.original_url(track_id)
            .map(|url| extension_from_url(&url, &self.config.default_extension))
    }

    /// Extension of the track's file, whichever tier it is in.
    pub async fn extension(&self, track_id: &str) -> String {
        if let Some(entry) = self.persistent.entry(track_id).await {
            return entry.extension;
        }
        self.staging
            .extension(track_id)
            .or_else(|| self.extension_hint(track_id))
            .unwrap_or_else(|| self.config.default_extension.clone())
    }

    // ------------------------------------------------------------------
    // Lookups
    // ------------------------------------------------------------------

    /// Highest tier holding data for the track.
    pub async fn cache_state(&self, track_id: &str) -> Result<CacheState> {
        if self.persistent.has_complete(track_id).await {
            return Ok(CacheState::Complete);
        }
        if self.staging.size(track_id).await? > 0 {
            return Ok(CacheState::TempFile);
        }
        if self.segments.segment_count(track_id) > 0 {
            return Ok(CacheState::InMemory);
        }
        Ok(CacheState::None)
    }

    /// Playable file for the track: the complete file, else the staging file.
    pub async fn cached_path(&self, track_id: &str) -> Option<PathBuf> {
        if self.persistent.has_complete(track_id).await {
            return self.persistent.file_path(track_id).await;
        }
        self.staging.file_path(track_id).await
    }

    pub async fn has_complete_cache(&self, track_id: &str) -> bool {
        self.persistent.has_complete(track_id).await
    }

    pub async fn has_temp_cache(&self, track_id: &str) -> bool {
        self.staging.file_path(track_id).await.is_some()
    }

    pub fn has_memory_cache(&self, track_id: &str) -> bool {
        self.segments.segment_count(track_id) > 0
    }

    /// Staged bytes for a track; 0 without a staging file.
    pub async fn staged_size(&self, track_id: &str) -> Result<u64> {
        self.staging.size(track_id).await
    }

    /// Read `len` bytes at `offset` from the complete or staging file.
    ///
    /// `None` when neither file covers the whole range.
    pub async fn read_range(&self, track_id: &str, offset: u64, len: u64) -> Result<Option<Bytes>> {
        if let Some(bytes) = self.persistent.read_range(track_id, offset, len).await? {
            return Ok(Some(bytes));
        }

        let staged = self.staging.size(track_id).await?;
        if staged == 0 || offset.saturating_add(len) > staged {
            return Ok(None);
        }
        match self.staging.file_path(track_id).await {
            Some(path) => Ok(Some(files::read_range(&path, offset, len).await?)),
            None => Ok(None),
        }
    }

    // ------------------------------------------------------------------
    // Memory tier pass-through
    // ------------------------------------------------------------------

    pub fn store_segment(&self, track_id: &str, index: u32, data: Bytes) {
        self.segments.put(track_id, index, data);
    }

    pub fn get_segment(&self, track_id: &str, index: u32) -> Option<Bytes> {
        self.segments.get(track_id, index)
    }

    pub fn has_segment(&self, track_id: &str, index: u32) -> bool {
        self.segments.has(track_id, index)
    }

    pub fn all_segments(&self, track_id: &str) -> Vec<Segment> {
        self.segments.all_segments(track_id)
    }

    pub fn segment_count(&self, track_id: &str) -> usize {
        self.segments.segment_count(track_id)
    }

    /// Pin a track against memory eviction and persistent eviction.
    pub fn set_current_priority_song(&self, track_id: Option<&str>) {
        self.segments.set_priority_track(track_id);
    }

    pub fn current_priority_song(&self) -> Option<String> {
        self.segments.priority_track()
    }

    /// Memory-pressure hook: drop every unpinned segment.
    pub fn handle_memory_pressure(&self) -> usize {
        let removed = self.segments.trim();
        info!(removed, "Handled memory pressure");
        removed
    }

    // ------------------------------------------------------------------
    // Promotion pipeline
    // ------------------------------------------------------------------

    /// Flush a track's memory segments to its staging file.
    ///
    /// Appends the contiguous run that follows what is already staged, then
    /// clears the track from memory. Returns `false` when a segment between 0
    /// and the highest known index is missing; only the prefix before the gap
    /// is staged in that case.
    #[instrument(skip(self))]
    pub async fn finalize_current_song(&self, track_id: &str) -> Result<bool> {
        let _guard = self.locks.lock(track_id).await;
        self.finalize_locked(track_id).await
    }

    async fn finalize_locked(&self, track_id: &str) -> Result<bool> {
        if self.persistent.has_complete(track_id).await {
            self.segments.clear(track_id);
            return Ok(true);
        }

        let snapshot = self.segments.all_segments(track_id);
        let Some(max_index) = snapshot.last().map(|s| s.index) else {
            return Ok(self.staging.size(track_id).await? > 0);
        };

        let segment_size = self.config.segment_size;
        let hint = self.extension_hint(track_id);
        let mut next = 0;
        let size = self
            .staging
            .append_at_end(track_id, hint.as_deref(), |staged| {
                let first_unstaged = staged.div_ceil(segment_size);
                let mut expected = first_unstaged;
                let mut buffer = BytesMut::new();
                for segment in snapshot
                    .iter()
                    .filter(|s| u64::from(s.index) >= first_unstaged)
                {
                    if u64::from(segment.index) != expected {
                        break;
                    }
                    buffer.extend_from_slice(&segment.data);
                    expected += 1;
                }
                next = expected;
                buffer.freeze()
            })
            .await?;
        debug!(track_id, staged = size, "Flushed memory segments to staging");
        let complete = next > u64::from(max_index);
        self.segments.clear(track_id);

        if !complete {
            warn!(
                track_id,
                staged_through = next,
                max_index,
                "Gap in memory segments, staged prefix only"
            );
        }

        self.enforce_temp_limit(track_id).await?;
        Ok(complete)
    }

    /// Promote the staging file if its size equals `expected_size`.
    ///
    /// Returns `false` (and leaves the staging file alone) on a mismatch or
    /// when nothing is staged. Enforces the persistent budget after a move.
    #[instrument(skip(self))]
    pub async fn confirm_complete_song(&self, track_id: &str, expected_size: u64) -> Result<bool> {
        let _guard = self.locks.lock(track_id).await;
        self.confirm_locked(track_id, expected_size).await
    }

    async fn confirm_locked(&self, track_id: &str, expected_size: u64) -> Result<bool> {
        let promoted = self
            .staging
            .confirm_complete_and_move(track_id, expected_size, &self.persistent)
            .await?;
        if promoted {
            self.evict_persistent_over_budget(Some(track_id)).await?;
        }
        Ok(promoted)
    }

    /// Finalize, then confirm when a non-zero expected size is given.
    #[instrument(skip(self))]
    pub async fn save_and_finalize_song(
        &self,
        track_id: &str,
        expected_size: Option<u64>,
    ) -> Result<CacheState> {
        let _guard = self.locks.lock(track_id).await;

        self.finalize_locked(track_id).await?;
        if let Some(expected) = expected_size.filter(|size| *size > 0) {
            self.confirm_locked(track_id, expected).await?;
        }
        self.cache_state(track_id).await
    }

    /// Record a play of a fully cached track.
    pub async fn update_play_time(&self, track_id: &str) -> Result<bool> {
        self.persistent.update_play_time(track_id).await
    }

    // ------------------------------------------------------------------
    // Deletion
    // ------------------------------------------------------------------

    /// Remove the track from every tier.
    #[instrument(skip(self))]
    pub async fn delete_all_for_track(&self, track_id: &str) -> Result<()> {
        let _guard = self.locks.lock(track_id).await;
        self.segments.clear(track_id);
        self.staging.delete(track_id).await?;
        self.persistent.delete(track_id).await?;
        Ok(())
    }

    pub async fn delete_complete(&self, track_id: &str) -> Result<bool> {
        let _guard = self.locks.lock(track_id).await;
        self.persistent.delete(track_id).await
    }

    pub async fn delete_temp(&self, track_id: &str) -> Result<bool> {
        let _guard = self.locks.lock(track_id).await;
        self.staging.delete(track_id).await
    }

    pub fn clear_memory(&self) {
        self.segments.clear_all();
    }

    pub async fn clear_temp(&self) -> Result<usize> {
        self.staging.clear_all().await
    }

    pub async fn clear_complete(&self) -> Result<usize> {
        self.persistent.clear_all().await
    }

    /// Empty every tier.
    #[instrument(skip(self))]
    pub async fn clear_all(&self) -> Result<()> {
        self.clear_memory();
        self.clear_temp().await?;
        self.clear_complete().await?;
        info!("Cleared all cache tiers");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Eviction
    // ------------------------------------------------------------------

    pub async fn is_complete_cache_over_limit(&self) -> bool {
        self.persistent.is_over_limit().await
    }

    /// Evict fully cached tracks, least recently played first, until the
    /// tier fits in `target_bytes`. The priority track is never evicted.
    pub async fn clean_complete_cache_to_size(&self, target_bytes: u64) -> Result<usize> {
        let pinned = self.segments.priority_track();
        let exclude: Vec<&str> = pinned.as_deref().into_iter().collect();
        self.persistent.evict_to_size(target_bytes, &exclude).await
    }

    /// Bring the persistent tier back under its configured budget.
    pub async fn enforce_disk_limit(&self) -> Result<usize> {
        self.evict_persistent_over_budget(None).await
    }

    async fn evict_persistent_over_budget(&self, keep: Option<&str>) -> Result<usize> {
        if !self.persistent.is_over_limit().await {
            return Ok(0);
        }
        let pinned = self.segments.priority_track();
        let exclude: Vec<&str> = pinned.as_deref().into_iter().chain(keep).collect();
        self.persistent
            .evict_to_size(self.config.disk_limit_bytes, &exclude)
            .await
    }

    async fn enforce_temp_limit(&self, keep: &str) -> Result<usize> {
        let pinned = self.segments.priority_track();
        let exclude: Vec<&str> = pinned.as_deref().into_iter().chain(Some(keep)).collect();
        self.staging
            .trim_to_size(self.config.temp_limit_bytes, &exclude)
            .await
    }

    /// Delete staging files older than the configured expiry window.
    pub async fn clean_expired_temp_files(&self) -> Result<usize> {
        self.staging.clean_expired().await
    }

    // ------------------------------------------------------------------
    // Statistics
    // ------------------------------------------------------------------

    pub fn memory_cache_size(&self) -> u64 {
        self.segments.total_cost()
    }

    pub async fn temp_cache_size(&self) -> Result<u64> {
        self.staging.total_size().await
    }

    pub async fn complete_cache_size(&self) -> u64 {
        self.persistent.total_size().await
    }

    pub async fn total_cache_size(&self) -> Result<u64> {
        Ok(self.memory_cache_size()
            + self.temp_cache_size().await?
            + self.complete_cache_size().await)
    }

    pub async fn complete_track_count(&self) -> usize {
        self.persistent.track_count().await
    }

    pub async fn temp_file_count(&self) -> Result<usize> {
        self.staging.file_count().await
    }

    pub async fn complete_entries(&self) -> Vec<PersistentEntry> {
        self.persistent.entries().await
    }

    /// Snapshot of every tier.
    pub async fn statistics(&self) -> Result<CacheStatistics> {
        let entries = self.persistent.entries().await;
        Ok(CacheStatistics {
            memory_bytes: self.segments.total_cost(),
            memory_segments: self.segments.total_segment_count(),
            memory_tracks: self.segments.cached_track_count(),
            temp_bytes: self.staging.total_size().await?,
            temp_files: self.staging.file_count().await?,
            complete_bytes: entries.iter().map(|e| e.total_size).sum(),
            complete_tracks: entries.len(),
            total_plays: entries.iter().map(|e| u64::from(e.play_count)).sum(),
            memory_limit_bytes: self.config.memory_limit_bytes,
            temp_limit_bytes: self.config.temp_limit_bytes,
            disk_limit_bytes: self.config.disk_limit_bytes,
            priority_track: self.segments.priority_track(),
        })
    }

    /// Everything known about one track.
    pub async fn cache_info(&self, track_id: &str) -> Result<TrackCacheInfo> {
        let entry = self.persistent.entry(track_id).await;
        let state = self.cache_state(track_id).await?;
        let extension = match state {
            CacheState::None | CacheState::InMemory => self.extension_hint(track_id),
            _ => Some(self.extension(track_id).await),
        };

        Ok(TrackCacheInfo {
            track_id: track_id.to_string(),
            state,
            memory_segments: self.segments.segment_count(track_id),
            temp_bytes: self.staging.size(track_id).await?,
            complete_bytes: entry.as_ref().map(|e| e.total_size).unwrap_or(0),
            play_count: entry.as_ref().map(|e| e.play_count).unwrap_or(0),
            last_play_time: entry.as_ref().map(|e| e.last_play_time),
            extension,
            is_priority: self.segments.priority_track().as_deref() == Some(track_id),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bridge_traits::time::ManualClock;

    async fn orchestrator(dir: &std::path::Path) -> CacheOrchestrator {
        let config = CacheConfig::new(dir)
            .with_segment_size(4)
            .with_memory_limit(1024)
            .with_disk_limit(1024)
            .with_temp_limit(1024);
        CacheOrchestrator::open(config, Arc::new(ManualClock::new(0)))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_finalize_appends_only_unstaged_segments() {
        let dir = tempfile::tempdir().unwrap();
        let cache = orchestrator(dir.path()).await;

        cache.store_segment("T1", 0, Bytes::from_static(b"aaaa"));
        assert!(cache.finalize_current_song("T1").await.unwrap());

        // The player re-buffered segment 0 and fetched segment 1
        cache.store_segment("T1", 0, Bytes::from_static(b"aaaa"));
        cache.store_segment("T1", 1, Bytes::from_static(b"bb"));
        assert!(cache.finalize_current_song("T1").await.unwrap());

        let path = cache.cached_path("T1").await.unwrap();
        assert_eq!(core_async::fs::read(path).await.unwrap(), b"aaaabb");
        assert_eq!(cache.segment_count("T1"), 0);
    }

    #[tokio::test]
    async fn test_finalize_with_gap_stages_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let cache = orchestrator(dir.path()).await;

        cache.store_segment("T1", 0, Bytes::from_static(b"aaaa"));
        cache.store_segment("T1", 2, Bytes::from_static(b"cccc"));

        assert!(!cache.finalize_current_song("T1").await.unwrap());
        assert_eq!(cache.staged_size("T1").await.unwrap(), 4);
        assert_eq!(cache.cache_state("T1").await.unwrap(), CacheState::TempFile);
    }

    #[tokio::test]
    async fn test_finalize_without_data_is_false() {
        let dir = tempfile::tempdir().unwrap();
        let cache = orchestrator(dir.path()).await;
        assert!(!cache.finalize_current_song("nothing").await.unwrap());
    }

    #[tokio::test]
    async fn test_extension_follows_source_url() {
        let dir = tempfile::tempdir().unwrap();
        let cache = orchestrator(dir.path()).await;
        cache.record_original_url("T1", "https://cdn.test/music/t1.FLAC?sig=x");
        cache.store_segment("T1", 0, Bytes::from_static(b"ab"));

        let state = cache.save_and_finalize_song("T1", Some(2)).await.unwrap();
        assert_eq!(state, CacheState::Complete);

        let path = cache.cached_path("T1").await.unwrap();
        assert!(path.ends_with("T1.flac"));
        assert_eq!(cache.extension("T1").await, "flac");
    }

    #[tokio::test]
    async fn test_read_range_prefers_disk() {
        let dir = tempfile::tempdir().unwrap();
        let cache = orchestrator(dir.path()).await;
        cache.store_segment("T1", 0, Bytes::from_static(b"abcd"));
        cache.store_segment("T1", 1, Bytes::from_static(b"ef"));
        cache.finalize_current_song("T1").await.unwrap();

        let bytes = cache.read_range("T1", 3, 3).await.unwrap().unwrap();
        assert_eq!(&bytes[..], b"def");
        assert!(cache.read_range("T1", 4, 5).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_cache_info_and_statistics() {
        let dir = tempfile::tempdir().unwrap();
        let cache = orchestrator(dir.path()).await;
        cache.store_segment("T1", 0, Bytes::from_static(b"abcd"));
        cache.store_segment("T2", 0, Bytes::from_static(b"xy"));
        cache.set_current_priority_song(Some("T2"));
        cache.save_and_finalize_song("T1", Some(4)).await.unwrap();
        cache.update_play_time("T1").await.unwrap();

        let info = cache.cache_info("T1").await.unwrap();
        assert_eq!(info.state, CacheState::Complete);
        assert_eq!(info.complete_bytes, 4);
        assert_eq!(info.play_count, 1);

        let stats = cache.statistics().await.unwrap();
        assert_eq!(stats.memory_bytes, 2);
        assert_eq!(stats.complete_tracks, 1);
        assert_eq!(stats.temp_files, 0);
        assert_eq!(stats.priority_track.as_deref(), Some("T2"));
        assert_eq!(cache.total_cache_size().await.unwrap(), 6);
        assert!(cache.cache_info("T2").await.unwrap().is_priority);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_finalize_under_concurrent_temp_trim_keeps_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let config = CacheConfig::new(dir.path())
            .with_segment_size(4)
            .with_memory_limit(1024)
            .with_temp_limit(8);
        let cache = Arc::new(
            CacheOrchestrator::open(config, Arc::new(ManualClock::new(0)))
                .await
                .unwrap(),
        );
        let body: Vec<u8> = (0..64u8).collect();

        for round in 0..8u32 {
            for track in ["A", "B"] {
                for index in [round * 2, round * 2 + 1] {
                    let start = index as usize * 4;
                    cache.store_segment(track, index, Bytes::copy_from_slice(&body[start..start + 4]));
                }
            }

            let finalizers: Vec<_> = ["A", "B"]
                .into_iter()
                .map(|track| {
                    let cache = Arc::clone(&cache);
                    tokio::spawn(async move { cache.finalize_current_song(track).await.unwrap() })
                })
                .collect();
            for finalizer in finalizers {
                finalizer.await.unwrap();
            }

            for track in ["A", "B"] {
                if let Some(path) = cache.cached_path(track).await {
                    let data = core_async::fs::read(&path).await.unwrap();
                    assert_eq!(data, body[..data.len()], "track {} round {}", track, round);
                }
            }
        }
    }
}
