//! # Cache Index
//!
//! The ledger of fully cached tracks, persisted as `index.json` next to the
//! cached files. It is the source of truth for persistent-tier occupancy:
//! every mutation is written to disk before it returns, and a mutation whose
//! write fails is undone in memory.

use crate::error::{PlaybackError, Result};
use bridge_traits::time::Clock;
use core_async::fs;
use core_async::sync::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

const LEDGER_VERSION: u32 = 1;

/// Ledger record for one fully cached track.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistentEntry {
    pub track_id: String,
    pub total_size: u64,
    /// Unix milliseconds when the file was promoted.
    pub cache_time: i64,
    /// Unix milliseconds of the last play (initially the cache time).
    pub last_play_time: i64,
    pub play_count: u32,
    /// Hex SHA-256 of the file, when integrity checks are enabled.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
    pub extension: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct LedgerFile {
    version: u32,
    entries: Vec<PersistentEntry>,
}

/// Persisted ledger of [`PersistentEntry`] records.
pub struct CacheIndex {
    path: PathBuf,
    entries: Mutex<HashMap<String, PersistentEntry>>,
    clock: Arc<dyn Clock>,
}

impl CacheIndex {
    /// Load the ledger at `path`; a missing file is an empty ledger.
    ///
    /// # Errors
    ///
    /// [`PlaybackError::LedgerCorrupted`] if the file exists but cannot be parsed.
    pub async fn open(path: impl Into<PathBuf>, clock: Arc<dyn Clock>) -> Result<Self> {
        let path = path.into();
        let entries = match fs::read(&path).await {
            Ok(raw) => {
                let ledger: LedgerFile = serde_json::from_slice(&raw).map_err(|e| {
                    PlaybackError::LedgerCorrupted(format!("{}: {}", path.display(), e))
                })?;
                ledger
                    .entries
                    .into_iter()
                    .map(|entry| (entry.track_id.clone(), entry))
                    .collect()
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => return Err(e.into()),
        };

        debug!(entries = entries.len(), "Loaded cache ledger");
        Ok(Self {
            path,
            entries: Mutex::new(entries),
            clock,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Build a fresh entry stamped with the current time.
    pub fn new_entry(
        &self,
        track_id: &str,
        total_size: u64,
        checksum: Option<String>,
        extension: &str,
    ) -> PersistentEntry {
        let now = self.clock.unix_timestamp_millis();
        PersistentEntry {
            track_id: track_id.to_string(),
            total_size,
            cache_time: now,
            last_play_time: now,
            play_count: 0,
            checksum,
            extension: extension.to_string(),
        }
    }

    pub async fn get(&self, track_id: &str) -> Option<PersistentEntry> {
        self.entries.lock().await.get(track_id).cloned()
    }

    pub async fn contains(&self, track_id: &str) -> bool {
        self.entries.lock().await.contains_key(track_id)
    }

    /// All entries, ordered by track id.
    pub async fn entries(&self) -> Vec<PersistentEntry> {
        let entries = self.entries.lock().await;
        let mut all: Vec<PersistentEntry> = entries.values().cloned().collect();
        all.sort_by(|a, b| a.track_id.cmp(&b.track_id));
        all
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }

    pub async fn total_size(&self) -> u64 {
        self.entries.lock().await.values().map(|e| e.total_size).sum()
    }

    /// Insert or replace an entry. Returns the replaced entry.
    pub async fn insert(&self, entry: PersistentEntry) -> Result<Option<PersistentEntry>> {
        let mut entries = self.entries.lock().await;
        let track_id = entry.track_id.clone();
        let previous = entries.insert(track_id.clone(), entry);

        if let Err(e) = self.persist(&entries).await {
            match previous {
                Some(old) => entries.insert(track_id, old),
                None => entries.remove(&track_id),
            };
            return Err(e);
        }
        Ok(previous)
    }

    /// Remove an entry. Returns it if it existed.
    pub async fn remove(&self, track_id: &str) -> Result<Option<PersistentEntry>> {
        let mut entries = self.entries.lock().await;
        let Some(removed) = entries.remove(track_id) else {
            return Ok(None);
        };

        if let Err(e) = self.persist(&entries).await {
            entries.insert(track_id.to_string(), removed);
            return Err(e);
        }
        Ok(Some(removed))
    }

    /// Remove several entries with a single ledger write.
    pub async fn remove_many(&self, track_ids: &[String]) -> Result<Vec<PersistentEntry>> {
        let mut entries = self.entries.lock().await;
        let removed: Vec<PersistentEntry> = track_ids
            .iter()
            .filter_map(|id| entries.remove(id))
            .collect();
        if removed.is_empty() {
            return Ok(removed);
        }

        if let Err(e) = self.persist(&entries).await {
            for entry in removed {
                entries.insert(entry.track_id.clone(), entry);
            }
            return Err(e);
        }
        Ok(removed)
    }

    /// Stamp a play: bump the play count and last play time.
    ///
    /// Returns `false` if the track has no entry.
    pub async fn record_play(&self, track_id: &str) -> Result<bool> {
        let mut entries = self.entries.lock().await;
        let now = self.clock.unix_timestamp_millis();
        let Some(entry) = entries.get_mut(track_id) else {
            return Ok(false);
        };

        let before = entry.clone();
        entry.last_play_time = now;
        entry.play_count = entry.play_count.saturating_add(1);

        if let Err(e) = self.persist(&entries).await {
            entries.insert(track_id.to_string(), before);
            return Err(e);
        }
        Ok(true)
    }

    /// Entries in eviction order: oldest play first, then oldest cache time,
    /// then track id. Excluded ids are left out.
    pub async fn eviction_candidates(&self, exclude: &[&str]) -> Vec<PersistentEntry> {
        let entries = self.entries.lock().await;
        let mut candidates: Vec<PersistentEntry> = entries
            .values()
            .filter(|e| !exclude.contains(&e.track_id.as_str()))
            .cloned()
            .collect();
        candidates.sort_by(|a, b| {
            a.last_play_time
                .cmp(&b.last_play_time)
                .then(a.cache_time.cmp(&b.cache_time))
                .then_with(|| a.track_id.cmp(&b.track_id))
        });
        candidates
    }

    /// Write the ledger via a sibling temp file and an atomic rename.
    async fn persist(&self, entries: &HashMap<String, PersistentEntry>) -> Result<()> {
        let mut sorted: Vec<PersistentEntry> = entries.values().cloned().collect();
        sorted.sort_by(|a, b| a.track_id.cmp(&b.track_id));

        let ledger = LedgerFile {
            version: LEDGER_VERSION,
            entries: sorted,
        };
        let raw = serde_json::to_vec_pretty(&ledger)
            .map_err(|e| PlaybackError::Internal(format!("Failed to encode ledger: {}", e)))?;

        let staging = self.path.with_extension("json.tmp");
        fs::write(&staging, &raw).await?;
        if let Err(e) = fs::rename(&staging, &self.path).await {
            warn!(error = %e, "Failed to replace cache ledger");
            let _ = fs::remove_file(&staging).await;
            return Err(e.into());
        }
        Ok(())
    }
}
