//! # Persistent Store (complete-file tier)
//!
//! Fully downloaded tracks as `{id}.{ext}` files plus the [`CacheIndex`]
//! ledger. A file and its ledger entry are created and deleted together;
//! when the ledger write fails the file operation is rolled back.

use crate::cache::files::{self, cache_file_name};
use crate::cache::index::{CacheIndex, PersistentEntry};
use crate::error::{PlaybackError, Result};
use bridge_traits::time::Clock;
use bytes::Bytes;
use core_async::fs;
use core_runtime::logging::strip_path;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, error, info, instrument, warn};

/// Complete-file tier.
pub struct PersistentStore {
    directory: PathBuf,
    index: CacheIndex,
    disk_limit: u64,
    verify_integrity: bool,
}

impl PersistentStore {
    /// Open the cache directory and its ledger.
    ///
    /// Ledger entries whose file disappeared (or changed size) are dropped
    /// and the ledger is rewritten.
    #[instrument(skip(directory, clock))]
    pub async fn open(
        directory: impl Into<PathBuf>,
        clock: Arc<dyn Clock>,
        disk_limit: u64,
        verify_integrity: bool,
    ) -> Result<Self> {
        let directory = directory.into();
        fs::create_dir_all(&directory).await?;

        let index = CacheIndex::open(directory.join("index.json"), clock).await?;
        let store = Self {
            directory,
            index,
            disk_limit,
            verify_integrity,
        };
        store.reconcile().await?;
        Ok(store)
    }

    async fn reconcile(&self) -> Result<()> {
        let mut stale = Vec::new();
        for entry in self.index.entries().await {
            let path = self.path_for(&entry.track_id, &entry.extension);
            if files::file_len(&path).await? != Some(entry.total_size) {
                stale.push(entry.track_id);
            }
        }

        if !stale.is_empty() {
            warn!(count = stale.len(), "Dropping ledger entries without a matching file");
            self.index.remove_many(&stale).await?;
        }
        Ok(())
    }

    fn path_for(&self, track_id: &str, extension: &str) -> PathBuf {
        self.directory.join(cache_file_name(track_id, extension))
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    pub fn disk_limit(&self) -> u64 {
        self.disk_limit
    }

    async fn checksum_of(&self, path: &Path) -> Result<Option<String>> {
        if self.verify_integrity {
            Ok(Some(files::sha256_file(path).await?))
        } else {
            Ok(None)
        }
    }

    /// Store a complete track from memory.
    #[instrument(skip(self, data), fields(len = data.len()))]
    pub async fn write(&self, track_id: &str, data: Bytes, extension: &str) -> Result<bool> {
        let path = self.path_for(track_id, extension);
        let partial = path.with_extension(format!("{}.partial", extension));

        fs::write(&partial, &data).await?;
        if let Err(e) = fs::rename(&partial, &path).await {
            let _ = files::remove_if_exists(&partial).await;
            return Err(e.into());
        }

        let checksum = self.verify_integrity.then(|| files::sha256_bytes(&data));
        let entry = self
            .index
            .new_entry(track_id, data.len() as u64, checksum, extension);
        self.commit(track_id, &path, entry, None).await?;
        Ok(true)
    }

    /// Move a complete file (normally a staging file) into the tier.
    ///
    /// Returns `false` if `source` does not exist. If the ledger cannot be
    /// updated the file is moved back to `source`.
    #[instrument(skip(self, source))]
    pub async fn move_from(&self, source: &Path, track_id: &str, extension: &str) -> Result<bool> {
        let Some(size) = files::file_len(source).await? else {
            return Ok(false);
        };

        let checksum = self.checksum_of(source).await?;
        let path = self.path_for(track_id, extension);

        if let Err(e) = fs::rename(source, &path).await {
            // Different file systems: fall back to copy + delete
            debug!(error = %e, "Rename failed, copying instead");
            fs::copy(source, &path).await?;
            if let Err(e) = fs::remove_file(source).await {
                let _ = files::remove_if_exists(&path).await;
                return Err(e.into());
            }
        }

        let entry = self.index.new_entry(track_id, size, checksum, extension);
        self.commit(track_id, &path, entry, Some(source)).await?;
        info!(
            track_id,
            size,
            file = %strip_path(&path.to_string_lossy()),
            "Promoted track to persistent cache"
        );
        Ok(true)
    }

    /// Record the ledger entry for a file already in place, undoing the file
    /// move if the ledger write fails.
    async fn commit(
        &self,
        track_id: &str,
        path: &Path,
        entry: PersistentEntry,
        restore_to: Option<&Path>,
    ) -> Result<()> {
        match self.index.insert(entry).await {
            Ok(Some(previous)) => {
                let old_path = self.path_for(track_id, &previous.extension);
                if old_path != path {
                    files::remove_if_exists(&old_path).await?;
                }
                Ok(())
            }
            Ok(None) => Ok(()),
            Err(e) => {
                error!(track_id, error = %e, "Ledger update failed, rolling back file");
                let rollback = match restore_to {
                    Some(original) => fs::rename(path, original).await,
                    None => fs::remove_file(path).await,
                };
                if let Err(rollback_error) = rollback {
                    error!(track_id, error = %rollback_error, "Rollback failed");
                }
                Err(e)
            }
        }
    }

    pub async fn entry(&self, track_id: &str) -> Option<PersistentEntry> {
        self.index.get(track_id).await
    }

    pub async fn entries(&self) -> Vec<PersistentEntry> {
        self.index.entries().await
    }

    /// Path of the cached file, if the track is fully cached.
    pub async fn file_path(&self, track_id: &str) -> Option<PathBuf> {
        let entry = self.index.get(track_id).await?;
        Some(self.path_for(track_id, &entry.extension))
    }

    /// `true` when the track has a ledger entry and its file exists.
    pub async fn has_complete(&self, track_id: &str) -> bool {
        match self.file_path(track_id).await {
            Some(path) => matches!(files::file_len(&path).await, Ok(Some(_))),
            None => false,
        }
    }

    /// Size recorded in the ledger; 0 when not cached.
    pub async fn size(&self, track_id: &str) -> u64 {
        self.index
            .get(track_id)
            .await
            .map(|e| e.total_size)
            .unwrap_or(0)
    }

    /// Delete a track's file and ledger entry.
    ///
    /// The file is set aside before the ledger is written and put back if
    /// that write fails, so the file and its entry disappear together.
    #[instrument(skip(self))]
    pub async fn delete(&self, track_id: &str) -> Result<bool> {
        let Some(entry) = self.index.get(track_id).await else {
            return Ok(false);
        };
        let path = self.path_for(track_id, &entry.extension);
        let aside = set_aside(&path).await?;

        if let Err(e) = self.index.remove(track_id).await {
            error!(track_id, error = %e, "Ledger update failed, keeping cached file");
            restore(aside, &path).await;
            return Err(e);
        }
        discard(aside).await;
        Ok(true)
    }

    /// Delete every cached file and the whole ledger.
    ///
    /// Files are restored if the ledger cannot be rewritten.
    #[instrument(skip(self))]
    pub async fn clear_all(&self) -> Result<usize> {
        let entries = self.index.entries().await;
        let mut ids = Vec::with_capacity(entries.len());
        let mut moved = Vec::with_capacity(entries.len());
        for entry in entries {
            let path = self.path_for(&entry.track_id, &entry.extension);
            match set_aside(&path).await {
                Ok(aside) => moved.push((path, aside)),
                Err(e) => {
                    for (path, aside) in moved {
                        restore(aside, &path).await;
                    }
                    return Err(e);
                }
            }
            ids.push(entry.track_id);
        }

        match self.index.remove_many(&ids).await {
            Ok(removed) => {
                for (_, aside) in moved {
                    discard(aside).await;
                }
                info!(removed = removed.len(), "Cleared persistent tier");
                Ok(removed.len())
            }
            Err(e) => {
                error!(error = %e, "Ledger update failed, keeping cached files");
                for (path, aside) in moved {
                    restore(aside, &path).await;
                }
                Err(e)
            }
        }
    }

    pub async fn total_size(&self) -> u64 {
        self.index.total_size().await
    }

    pub async fn track_count(&self) -> usize {
        self.index.len().await
    }

    pub async fn is_over_limit(&self) -> bool {
        self.total_size().await > self.disk_limit
    }

    /// Evict least recently played tracks until the tier fits in
    /// `target_bytes`. Tracks in `exclude` are never evicted.
    #[instrument(skip(self))]
    pub async fn evict_to_size(&self, target_bytes: u64, exclude: &[&str]) -> Result<usize> {
        let mut total = self.total_size().await;
        if total <= target_bytes {
            return Ok(0);
        }

        let mut evicted = 0;
        for candidate in self.index.eviction_candidates(exclude).await {
            if total <= target_bytes {
                break;
            }
            if self.delete(&candidate.track_id).await? {
                total = total.saturating_sub(candidate.total_size);
                evicted += 1;
                debug!(
                    track_id = %candidate.track_id,
                    size = candidate.total_size,
                    "Evicted cached track"
                );
            }
        }

        info!(evicted, total, target_bytes, "Persistent eviction complete");
        Ok(evicted)
    }

    /// Record a play for LRU ordering. Returns `false` if not cached.
    pub async fn update_play_time(&self, track_id: &str) -> Result<bool> {
        self.index.record_play(track_id).await
    }

    /// Read `len` bytes at `offset` from the cached file, if it covers them.
    pub async fn read_range(&self, track_id: &str, offset: u64, len: u64) -> Result<Option<Bytes>> {
        let Some(entry) = self.index.get(track_id).await else {
            return Ok(None);
        };
        if offset.saturating_add(len) > entry.total_size {
            return Ok(None);
        }

        let path = self.path_for(track_id, &entry.extension);
        match files::read_range(&path, offset, len).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(PlaybackError::Io(e)) if e.kind() == io::ErrorKind::NotFound => {
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }
}

/// Rename `path` to a sibling `.deleting` file. `None` when it was already gone.
async fn set_aside(path: &Path) -> Result<Option<PathBuf>> {
    let mut aside = path.as_os_str().to_owned();
    aside.push(".deleting");
    let aside = PathBuf::from(aside);
    match fs::rename(path, &aside).await {
        Ok(()) => Ok(Some(aside)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

async fn restore(aside: Option<PathBuf>, path: &Path) {
    if let Some(aside) = aside {
        if let Err(e) = fs::rename(&aside, path).await {
            error!(error = %e, file = %strip_path(&path.to_string_lossy()), "Could not restore cached file");
        }
    }
}

async fn discard(aside: Option<PathBuf>) {
    if let Some(aside) = aside {
        if let Err(e) = files::remove_if_exists(&aside).await {
            warn!(error = %e, file = %strip_path(&aside.to_string_lossy()), "Could not remove deleted file");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bridge_traits::time::ManualClock;

    async fn open_store(dir: &Path, clock: Arc<ManualClock>, limit: u64) -> PersistentStore {
        PersistentStore::open(dir.join("MusicCache"), clock, limit, true)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_write_creates_file_and_entry() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path(), Arc::new(ManualClock::new(0)), 1_000).await;

        assert!(store
            .write("T1", Bytes::from_static(b"abc"), "flac")
            .await
            .unwrap());

        let path = store.file_path("T1").await.unwrap();
        assert!(path.ends_with("T1.flac"));
        assert_eq!(fs::read(&path).await.unwrap(), b"abc");
        assert!(store.has_complete("T1").await);
        assert_eq!(store.size("T1").await, 3);

        let entry = store.entry("T1").await.unwrap();
        assert_eq!(entry.checksum.as_deref(), Some(files::sha256_bytes(b"abc").as_str()));
    }

    #[tokio::test]
    async fn test_move_from_removes_source() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path(), Arc::new(ManualClock::new(0)), 1_000).await;
        let source = dir.path().join("T1.mp3.tmp");
        fs::write(&source, b"12345").await.unwrap();

        assert!(store.move_from(&source, "T1", "mp3").await.unwrap());
        assert!(files::file_len(&source).await.unwrap().is_none());
        assert_eq!(store.total_size().await, 5);
        assert_eq!(store.track_count().await, 1);

        assert!(!store.move_from(&source, "T1", "mp3").await.unwrap());
    }

    #[tokio::test]
    async fn test_evict_to_size_lru_with_exclusion() {
        let dir = tempfile::tempdir().unwrap();
        let clock = Arc::new(ManualClock::new(0));
        let store = open_store(dir.path(), clock.clone(), 1_000).await;

        for (id, at) in [("old", 100), ("playing", 50), ("mid", 200), ("new", 300)] {
            clock.set_millis(at);
            store.write(id, Bytes::from(vec![0u8; 10]), "mp3").await.unwrap();
        }

        let evicted = store.evict_to_size(20, &["playing"]).await.unwrap();
        assert_eq!(evicted, 2);
        assert!(store.has_complete("playing").await);
        assert!(store.has_complete("new").await);
        assert!(!store.has_complete("old").await);
        assert!(!store.has_complete("mid").await);
    }

    #[tokio::test]
    async fn test_reopen_drops_entries_without_files() {
        let dir = tempfile::tempdir().unwrap();
        let clock = Arc::new(ManualClock::new(0));
        {
            let store = open_store(dir.path(), clock.clone(), 1_000).await;
            store.write("keep", Bytes::from_static(b"k"), "mp3").await.unwrap();
            store.write("lost", Bytes::from_static(b"l"), "mp3").await.unwrap();
            let lost = store.file_path("lost").await.unwrap();
            fs::remove_file(lost).await.unwrap();
        }

        let reopened = open_store(dir.path(), clock, 1_000).await;
        assert!(reopened.entry("keep").await.is_some());
        assert!(reopened.entry("lost").await.is_none());
    }

    #[tokio::test]
    async fn test_read_range_and_delete() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path(), Arc::new(ManualClock::new(0)), 1_000).await;
        store
            .write("T1", Bytes::from_static(b"0123456789"), "mp3")
            .await
            .unwrap();

        let bytes = store.read_range("T1", 2, 3).await.unwrap().unwrap();
        assert_eq!(&bytes[..], b"234");
        assert!(store.read_range("T1", 8, 5).await.unwrap().is_none());
        assert!(store.read_range("T2", 0, 1).await.unwrap().is_none());

        assert!(store.delete("T1").await.unwrap());
        assert!(!store.delete("T1").await.unwrap());
        assert_eq!(store.clear_all().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_over_limit_and_play_time() {
        let dir = tempfile::tempdir().unwrap();
        let clock = Arc::new(ManualClock::new(0));
        let store = open_store(dir.path(), clock.clone(), 5).await;
        store.write("T1", Bytes::from(vec![1u8; 8]), "mp3").await.unwrap();
        assert!(store.is_over_limit().await);

        clock.advance_millis(10);
        assert!(store.update_play_time("T1").await.unwrap());
        assert_eq!(store.entry("T1").await.unwrap().last_play_time, 10);
    }

    /// Make ledger writes fail by putting a non-empty directory where the
    /// ledger file lives.
    async fn block_ledger(dir: &Path) {
        let ledger = dir.join("index.json");
        fs::remove_file(&ledger).await.unwrap();
        fs::create_dir_all(ledger.join("occupied")).await.unwrap();
    }

    #[tokio::test]
    async fn test_failed_ledger_write_keeps_file_on_delete() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path(), Arc::new(ManualClock::new(0)), 1_000).await;
        store.write("T1", Bytes::from_static(b"abcdef"), "mp3").await.unwrap();
        let path = store.file_path("T1").await.unwrap();

        block_ledger(&dir.path().join("MusicCache")).await;
        assert!(matches!(store.delete("T1").await, Err(PlaybackError::Io(_))));

        assert_eq!(fs::read(&path).await.unwrap(), b"abcdef");
        assert_eq!(store.size("T1").await, 6);
        assert!(store.has_complete("T1").await);
    }

    #[tokio::test]
    async fn test_failed_ledger_write_keeps_files_on_clear_all() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path(), Arc::new(ManualClock::new(0)), 1_000).await;
        store.write("T1", Bytes::from_static(b"one"), "mp3").await.unwrap();
        store.write("T2", Bytes::from_static(b"two!"), "flac").await.unwrap();

        block_ledger(&dir.path().join("MusicCache")).await;
        assert!(store.clear_all().await.is_err());

        assert_eq!(store.track_count().await, 2);
        assert_eq!(store.total_size().await, 7);
        assert!(store.has_complete("T1").await);
        assert!(store.has_complete("T2").await);
    }
}
