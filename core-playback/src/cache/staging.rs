//! # Staging Store (partial-file tier)
//!
//! One append-only `{id}.{ext}.tmp` file per track whose bytes have been
//! flushed out of memory but are not yet known to be complete.
//!
//! Every mutation of a file (append, delete, promotion, trim, expiry) runs
//! under the lock for that file's stem.

use crate::cache::files::{self, file_stem, temp_file_name};
use crate::cache::locks::KeyedLocks;
use crate::cache::persistent::PersistentStore;
use crate::error::{PlaybackError, Result};
use core_async::fs::{self, OpenOptions};
use core_async::io::AsyncWriteExt;
use core_async::sync::OwnedMutexGuard;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tracing::{debug, info, instrument, warn};

const TEMP_SUFFIX: &str = ".tmp";

struct StagedFile {
    path: PathBuf,
    len: u64,
    modified: SystemTime,
}

/// Partial-file tier.
pub struct StagingStore {
    directory: PathBuf,
    default_extension: String,
    expiry: Duration,
    /// File stem -> extension recorded at first append.
    extensions: Mutex<HashMap<String, String>>,
    locks: KeyedLocks,
}

impl StagingStore {
    /// Open the staging directory, creating it if needed and picking up
    /// partial files left by a previous run.
    pub async fn open(
        directory: impl Into<PathBuf>,
        default_extension: impl Into<String>,
        expiry: Duration,
    ) -> Result<Self> {
        let directory = directory.into();
        fs::create_dir_all(&directory).await?;

        let store = Self {
            directory,
            default_extension: default_extension.into(),
            expiry,
            extensions: Mutex::new(HashMap::new()),
            locks: KeyedLocks::new(),
        };

        let mut recovered = HashMap::new();
        for file in store.scan().await? {
            if let Some((stem, extension)) = parse_temp_name(&file.path) {
                recovered.insert(stem, extension);
            }
        }
        if !recovered.is_empty() {
            info!(files = recovered.len(), "Recovered staging files");
        }
        *store.extensions.lock() = recovered;

        Ok(store)
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// Extension recorded for a track's staging file.
    pub fn extension(&self, track_id: &str) -> Option<String> {
        self.extensions.lock().get(&file_stem(track_id)).cloned()
    }

    fn path_for(&self, track_id: &str) -> Option<PathBuf> {
        self.extension(track_id)
            .map(|ext| self.directory.join(temp_file_name(track_id, &ext)))
    }

    /// Append bytes at the current end of the track's staging file.
    ///
    /// The extension hint only applies to the first append. Returns the file
    /// size after the write.
    #[instrument(skip(self, data, extension_hint), fields(len = data.len()))]
    pub async fn append(
        &self,
        track_id: &str,
        data: &[u8],
        extension_hint: Option<&str>,
    ) -> Result<u64> {
        let _guard = self.lock(track_id).await;
        self.append_locked(track_id, data, extension_hint).await
    }

    /// Append the bytes `next_bytes` produces for the currently staged size.
    ///
    /// The size is read and the bytes written under the same lock, so the
    /// file cannot be trimmed or expired in between. An empty result writes
    /// nothing. Returns the file size afterwards.
    #[instrument(skip(self, extension_hint, next_bytes))]
    pub async fn append_at_end<F>(
        &self,
        track_id: &str,
        extension_hint: Option<&str>,
        next_bytes: F,
    ) -> Result<u64>
    where
        F: FnOnce(u64) -> Bytes,
    {
        let _guard = self.lock(track_id).await;
        let staged = self.size(track_id).await?;
        let data = next_bytes(staged);
        if data.is_empty() {
            return Ok(staged);
        }
        self.append_locked(track_id, &data, extension_hint).await
    }

    async fn append_locked(
        &self,
        track_id: &str,
        data: &[u8],
        extension_hint: Option<&str>,
    ) -> Result<u64> {
        let extension = {
            let mut extensions = self.extensions.lock();
            extensions
                .entry(file_stem(track_id))
                .or_insert_with(|| {
                    extension_hint
                        .unwrap_or(self.default_extension.as_str())
                        .to_string()
                })
                .clone()
        };
        let path = self.directory.join(temp_file_name(track_id, &extension));

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        file.write_all(data).await?;
        file.flush().await?;

        let size = file.metadata().await?.len();
        debug!(size, "Appended to staging file");
        Ok(size)
    }

    async fn lock(&self, track_id: &str) -> OwnedMutexGuard<()> {
        self.locks.lock(&file_stem(track_id)).await
    }

    /// Path of the staging file, if one exists on disk.
    pub async fn file_path(&self, track_id: &str) -> Option<PathBuf> {
        let path = self.path_for(track_id)?;
        match files::file_len(&path).await {
            Ok(Some(_)) => Some(path),
            _ => None,
        }
    }

    /// Staged size in bytes; 0 when there is no file.
    pub async fn size(&self, track_id: &str) -> Result<u64> {
        match self.path_for(track_id) {
            Some(path) => Ok(files::file_len(&path).await?.unwrap_or(0)),
            None => Ok(0),
        }
    }

    /// `true` iff a staging file exists and its size equals `expected_size`.
    pub async fn is_complete(&self, track_id: &str, expected_size: u64) -> Result<bool> {
        match self.path_for(track_id) {
            Some(path) => Ok(files::file_len(&path).await? == Some(expected_size)),
            None => Ok(false),
        }
    }

    /// Delete a track's staging file.
    pub async fn delete(&self, track_id: &str) -> Result<bool> {
        let _guard = self.lock(track_id).await;
        self.delete_locked(track_id).await
    }

    async fn delete_locked(&self, track_id: &str) -> Result<bool> {
        let Some(path) = self.path_for(track_id) else {
            return Ok(false);
        };
        let removed = files::remove_if_exists(&path).await?;
        self.extensions.lock().remove(&file_stem(track_id));
        Ok(removed)
    }

    /// Delete every staging file.
    #[instrument(skip(self))]
    pub async fn clear_all(&self) -> Result<usize> {
        let mut removed = 0;
        for file in self.scan().await? {
            if self.remove_scanned(&file.path, None).await? {
                removed += 1;
            }
        }
        info!(removed, "Cleared staging tier");
        Ok(removed)
    }

    /// Move a track's staging file into the persistent tier.
    ///
    /// Returns `false` if there is nothing staged. On error the staging file
    /// is left in place.
    pub async fn move_to_persistent(
        &self,
        track_id: &str,
        persistent: &PersistentStore,
    ) -> Result<bool> {
        let _guard = self.lock(track_id).await;
        self.move_locked(track_id, persistent).await
    }

    /// Promote only if the staged size equals `expected_size` exactly.
    ///
    /// An incomplete or missing file returns `false` and is left untouched.
    #[instrument(skip(self, persistent))]
    pub async fn confirm_complete_and_move(
        &self,
        track_id: &str,
        expected_size: u64,
        persistent: &PersistentStore,
    ) -> Result<bool> {
        let _guard = self.lock(track_id).await;

        let actual = self.size(track_id).await?;
        if actual == 0 || actual != expected_size {
            let mismatch = PlaybackError::IncompleteData {
                track_id: track_id.to_string(),
                expected: expected_size,
                actual,
            };
            debug!(%mismatch, "Staging file not ready for promotion");
            return Ok(false);
        }

        self.move_locked(track_id, persistent).await
    }

    async fn move_locked(&self, track_id: &str, persistent: &PersistentStore) -> Result<bool> {
        let (Some(path), Some(extension)) = (self.path_for(track_id), self.extension(track_id))
        else {
            return Ok(false);
        };

        let moved = persistent.move_from(&path, track_id, &extension).await?;
        if moved {
            self.extensions.lock().remove(&file_stem(track_id));
        }
        Ok(moved)
    }

    /// Delete staging files not modified within `max_age`.
    #[instrument(skip(self))]
    pub async fn expire_older_than(&self, max_age: Duration) -> Result<usize> {
        let cutoff = SystemTime::now()
            .checked_sub(max_age)
            .unwrap_or(SystemTime::UNIX_EPOCH);

        let mut removed = 0;
        for file in self.scan().await? {
            if file.modified < cutoff && self.remove_scanned(&file.path, Some(cutoff)).await? {
                removed += 1;
            }
        }

        if removed > 0 {
            info!(removed, "Expired staging files");
        }
        Ok(removed)
    }

    /// Expire using the configured window.
    pub async fn clean_expired(&self) -> Result<usize> {
        self.expire_older_than(self.expiry).await
    }

    /// Delete the oldest staging files until the tier fits in `target_bytes`.
    ///
    /// Tracks listed in `exclude` are never removed.
    #[instrument(skip(self))]
    pub async fn trim_to_size(&self, target_bytes: u64, exclude: &[&str]) -> Result<usize> {
        let mut staged = self.scan().await?;
        let mut total: u64 = staged.iter().map(|f| f.len).sum();
        if total <= target_bytes {
            return Ok(0);
        }

        let excluded: Vec<String> = exclude.iter().map(|id| file_stem(id)).collect();
        staged.sort_by_key(|f| f.modified);

        let mut removed = 0;
        for file in staged {
            if total <= target_bytes {
                break;
            }
            let protected = parse_temp_name(&file.path)
                .map(|(stem, _)| excluded.contains(&stem))
                .unwrap_or(false);
            if protected {
                continue;
            }
            if self.remove_scanned(&file.path, None).await? {
                total = total.saturating_sub(file.len);
                removed += 1;
            }
        }

        if total > target_bytes {
            warn!(total, target_bytes, "Staging tier still over budget after trim");
        }
        Ok(removed)
    }

    /// Remove a file found by [`scan`](Self::scan) under its stem's lock.
    ///
    /// With `stale_before`, the file is kept if it was written after that
    /// instant while the lock was being acquired.
    async fn remove_scanned(&self, path: &Path, stale_before: Option<SystemTime>) -> Result<bool> {
        let Some((stem, _)) = parse_temp_name(path) else {
            return files::remove_if_exists(path).await;
        };
        let _guard = self.locks.lock(&stem).await;

        if let Some(cutoff) = stale_before {
            match fs::metadata(path).await {
                Ok(meta) if meta.modified().map_or(false, |m| m >= cutoff) => return Ok(false),
                Ok(_) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
                Err(e) => return Err(e.into()),
            }
        }

        let removed = files::remove_if_exists(path).await?;
        self.extensions.lock().remove(&stem);
        Ok(removed)
    }

    pub async fn total_size(&self) -> Result<u64> {
        Ok(self.scan().await?.iter().map(|f| f.len).sum())
    }

    pub async fn file_count(&self) -> Result<usize> {
        Ok(self.scan().await?.len())
    }

    async fn scan(&self) -> Result<Vec<StagedFile>> {
        let mut entries = fs::read_dir(&self.directory).await?;
        let mut staged = Vec::new();

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let is_temp = path
                .file_name()
                .and_then(|n| n.to_str())
                .map(|n| n.ends_with(TEMP_SUFFIX))
                .unwrap_or(false);
            if !is_temp {
                continue;
            }

            let metadata = match entry.metadata().await {
                Ok(meta) if meta.is_file() => meta,
                _ => continue,
            };
            staged.push(StagedFile {
                path,
                len: metadata.len(),
                modified: metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH),
            });
        }

        Ok(staged)
    }
}

/// `{stem}.{ext}.tmp` -> `(stem, ext)`
fn parse_temp_name(path: &Path) -> Option<(String, String)> {
    let name = path.file_name()?.to_str()?;
    let base = name.strip_suffix(TEMP_SUFFIX)?;
    let (stem, extension) = base.rsplit_once('.')?;
    Some((stem.to_string(), extension.to_string()))
}
