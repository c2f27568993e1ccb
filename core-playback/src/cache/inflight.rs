//! Segments currently being downloaded.
//!
//! Every network fetch into the memory tier (player reads and preloads)
//! claims its segments here first. A segment already claimed is waited on
//! through a watch channel instead of being requested a second time.

use core_async::sync::watch;
use parking_lot::Mutex;
use std::collections::HashMap;

/// Outcome of a claimed segment, as seen by waiters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchStatus {
    Pending,
    Ready,
    Failed,
}

/// Result of trying to claim one segment.
pub enum Claim {
    /// The caller now owns the fetch.
    Owned,
    /// Someone else is fetching it.
    Busy(watch::Receiver<FetchStatus>),
}

type SegmentKey = (String, u32);

/// Registry of in-flight segment fetches, keyed by `(track_id, index)`.
#[derive(Default)]
pub struct InFlightSegments {
    entries: Mutex<HashMap<SegmentKey, watch::Receiver<FetchStatus>>>,
}

impl InFlightSegments {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a claim set for `track_id`. Nothing is registered yet.
    pub fn claims(&self, track_id: &str) -> SegmentClaims<'_> {
        SegmentClaims {
            registry: self,
            track_id: track_id.to_string(),
            senders: HashMap::new(),
        }
    }

    /// Receiver for a segment someone is fetching.
    pub fn watch(&self, track_id: &str, index: u32) -> Option<watch::Receiver<FetchStatus>> {
        self.entries
            .lock()
            .get(&(track_id.to_string(), index))
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

/// Segments one fetcher registered.
///
/// Dropping the set releases every registration not completed, waking
/// waiters with [`FetchStatus::Failed`].
pub struct SegmentClaims<'a> {
    registry: &'a InFlightSegments,
    track_id: String,
    senders: HashMap<u32, watch::Sender<FetchStatus>>,
}

impl SegmentClaims<'_> {
    /// Claim `index` unless another fetcher holds it.
    pub fn try_claim(&mut self, index: u32) -> Claim {
        if self.senders.contains_key(&index) {
            return Claim::Owned;
        }
        let mut entries = self.registry.entries.lock();
        let key = (self.track_id.clone(), index);
        if let Some(receiver) = entries.get(&key) {
            return Claim::Busy(receiver.clone());
        }
        let (sender, receiver) = watch::channel(FetchStatus::Pending);
        entries.insert(key, receiver);
        self.senders.insert(index, sender);
        Claim::Owned
    }

    /// Claimed indices, ascending.
    pub fn indices(&self) -> Vec<u32> {
        let mut indices: Vec<u32> = self.senders.keys().copied().collect();
        indices.sort_unstable();
        indices
    }

    pub fn holds(&self, index: u32) -> bool {
        self.senders.contains_key(&index)
    }

    /// Release `index` and tell its waiters how it went.
    pub fn complete(&mut self, index: u32, status: FetchStatus) {
        if let Some(sender) = self.senders.remove(&index) {
            self.registry
                .entries
                .lock()
                .remove(&(self.track_id.clone(), index));
            let _ = sender.send(status);
        }
    }
}

impl Drop for SegmentClaims<'_> {
    fn drop(&mut self) {
        if self.senders.is_empty() {
            return;
        }
        let mut entries = self.registry.entries.lock();
        for (index, sender) in self.senders.drain() {
            entries.remove(&(self.track_id.clone(), index));
            let _ = sender.send(FetchStatus::Failed);
        }
    }
}

/// Wait until a claimed segment is no longer pending.
///
/// A dropped sender counts as [`FetchStatus::Failed`].
pub async fn settled(mut receiver: watch::Receiver<FetchStatus>) -> FetchStatus {
    match receiver.wait_for(|status| *status != FetchStatus::Pending).await {
        Ok(status) => *status,
        Err(_) => FetchStatus::Failed,
    }
}
