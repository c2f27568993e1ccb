//! # Segment Store (memory tier)
//!
//! Fixed-size byte ranges of tracks held in memory while they stream.
//!
//! - Cost is the summed payload size, bounded by the configured budget
//! - Over budget, the least recently touched segment goes first
//! - Segments of the priority track are evicted only when nothing else is left
//! - Lookups never block on I/O; the store sits behind a `parking_lot` mutex

use bytes::Bytes;
use lru::LruCache;
use parking_lot::Mutex;
use std::collections::BTreeSet;
use tracing::{debug, trace};

type SegmentKey = (String, u32);

/// One resident segment of a track.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub track_id: String,
    pub index: u32,
    /// Byte offset of the segment within the track (`index * segment_size`).
    pub offset: u64,
    pub size: u64,
    pub data: Bytes,
    pub downloaded: bool,
}

struct Inner {
    entries: LruCache<SegmentKey, Segment>,
    cost: u64,
    priority_track: Option<String>,
}

impl Inner {
    fn remove(&mut self, key: &SegmentKey) -> Option<Segment> {
        let removed = self.entries.pop(key)?;
        self.cost -= removed.size;
        Some(removed)
    }

    fn keys_where(&self, predicate: impl Fn(&SegmentKey) -> bool) -> Vec<SegmentKey> {
        self.entries
            .iter()
            .filter(|(key, _)| predicate(key))
            .map(|(key, _)| key.clone())
            .collect()
    }

    fn is_pinned(&self, track_id: &str) -> bool {
        self.priority_track.as_deref() == Some(track_id)
    }

    /// Least recently used key, preferring segments of unpinned tracks.
    fn eviction_victim(&self) -> Option<SegmentKey> {
        self.entries
            .iter()
            .rev()
            .find(|(key, _)| !self.is_pinned(&key.0))
            .or_else(|| self.entries.peek_lru())
            .map(|(key, _)| key.clone())
    }
}

/// Memory tier keyed by `(track_id, index)`.
pub struct SegmentStore {
    inner: Mutex<Inner>,
    segment_size: u64,
    memory_limit: u64,
}

impl SegmentStore {
    pub fn new(segment_size: u64, memory_limit: u64) -> Self {
        Self {
            inner: Mutex::new(Inner {
                entries: LruCache::unbounded(),
                cost: 0,
                priority_track: None,
            }),
            segment_size,
            memory_limit,
        }
    }

    pub fn segment_size(&self) -> u64 {
        self.segment_size
    }

    pub fn memory_limit(&self) -> u64 {
        self.memory_limit
    }

    /// Store or replace a segment, then evict down to the budget.
    pub fn put(&self, track_id: &str, index: u32, data: Bytes) {
        let size = data.len() as u64;
        let segment = Segment {
            track_id: track_id.to_string(),
            index,
            offset: u64::from(index) * self.segment_size,
            size,
            data,
            downloaded: true,
        };

        let mut inner = self.inner.lock();
        if let Some(previous) = inner.entries.put((track_id.to_string(), index), segment) {
            inner.cost -= previous.size;
        }
        inner.cost += size;

        while inner.cost > self.memory_limit {
            let Some(victim) = inner.eviction_victim() else {
                break;
            };
            if let Some(evicted) = inner.remove(&victim) {
                trace!(
                    track_id = %evicted.track_id,
                    index = evicted.index,
                    "Evicted segment over memory budget"
                );
            }
        }
    }

    /// Segment payload, refreshing its recency.
    pub fn get(&self, track_id: &str, index: u32) -> Option<Bytes> {
        let key = (track_id.to_string(), index);
        self.inner.lock().entries.get(&key).map(|s| s.data.clone())
    }

    pub fn has(&self, track_id: &str, index: u32) -> bool {
        let key = (track_id.to_string(), index);
        self.inner.lock().entries.contains(&key)
    }

    /// Every resident segment of a track, ordered by index.
    ///
    /// Taken under a single lock so the result is a consistent snapshot.
    pub fn all_segments(&self, track_id: &str) -> Vec<Segment> {
        let inner = self.inner.lock();
        let mut segments: Vec<Segment> = inner
            .entries
            .iter()
            .filter(|(key, _)| key.0 == track_id)
            .map(|(_, segment)| segment.clone())
            .collect();
        segments.sort_by_key(|s| s.index);
        segments
    }

    pub fn segment_count(&self, track_id: &str) -> usize {
        self.inner
            .lock()
            .entries
            .iter()
            .filter(|(key, _)| key.0 == track_id)
            .count()
    }

    pub fn max_index(&self, track_id: &str) -> Option<u32> {
        self.inner
            .lock()
            .entries
            .iter()
            .filter(|(key, _)| key.0 == track_id)
            .map(|(key, _)| key.1)
            .max()
    }

    /// Drop every segment of a track. Returns the number removed.
    pub fn clear(&self, track_id: &str) -> usize {
        let mut inner = self.inner.lock();
        let keys = inner.keys_where(|key| key.0 == track_id);
        for key in &keys {
            inner.remove(key);
        }
        keys.len()
    }

    /// Pin a track's segments against eviction, or clear the pin with `None`.
    pub fn set_priority_track(&self, track_id: Option<&str>) {
        let mut inner = self.inner.lock();
        inner.priority_track = track_id.map(str::to_string);
        debug!(priority_track = ?inner.priority_track, "Priority track updated");
    }

    pub fn priority_track(&self) -> Option<String> {
        self.inner.lock().priority_track.clone()
    }

    /// Drop every segment not belonging to the priority track.
    pub fn trim(&self) -> usize {
        let mut inner = self.inner.lock();
        let pinned = inner.priority_track.clone();
        let keys = inner.keys_where(|key| pinned.as_deref() != Some(key.0.as_str()));
        for key in &keys {
            inner.remove(key);
        }
        debug!(removed = keys.len(), remaining_bytes = inner.cost, "Trimmed memory tier");
        keys.len()
    }

    pub fn clear_all(&self) {
        let mut inner = self.inner.lock();
        inner.entries.clear();
        inner.cost = 0;
    }

    pub fn total_cost(&self) -> u64 {
        self.inner.lock().cost
    }

    pub fn total_segment_count(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn track_ids(&self) -> Vec<String> {
        let inner = self.inner.lock();
        let ids: BTreeSet<&String> = inner.entries.iter().map(|(key, _)| &key.0).collect();
        ids.into_iter().cloned().collect()
    }

    pub fn cached_track_count(&self) -> usize {
        self.track_ids().len()
    }
}
