//! Cache statistics and monitoring

use crate::cache::state::CacheState;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Occupancy of every tier at one point in time.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheStatistics {
    /// Bytes resident in the memory tier
    pub memory_bytes: u64,

    /// Number of resident segments
    pub memory_segments: usize,

    /// Number of tracks with at least one resident segment
    pub memory_tracks: usize,

    /// Bytes held in staging files
    pub temp_bytes: u64,

    /// Number of staging files
    pub temp_files: usize,

    /// Bytes held in the persistent tier
    pub complete_bytes: u64,

    /// Number of fully cached tracks
    pub complete_tracks: usize,

    /// Total play count across fully cached tracks
    pub total_plays: u64,

    /// Configured memory budget
    pub memory_limit_bytes: u64,

    /// Configured staging budget
    pub temp_limit_bytes: u64,

    /// Configured persistent budget
    pub disk_limit_bytes: u64,

    /// Track pinned against eviction, if any
    pub priority_track: Option<String>,
}

impl CacheStatistics {
    /// Bytes across all tiers.
    pub fn total_bytes(&self) -> u64 {
        self.memory_bytes + self.temp_bytes + self.complete_bytes
    }

    /// Bytes on disk (staging + persistent).
    pub fn disk_bytes(&self) -> u64 {
        self.temp_bytes + self.complete_bytes
    }

    /// Persistent tier usage as a percentage of its budget.
    pub fn disk_usage_percentage(&self) -> f64 {
        percentage(self.complete_bytes, self.disk_limit_bytes)
    }

    /// Memory tier usage as a percentage of its budget.
    pub fn memory_usage_percentage(&self) -> f64 {
        percentage(self.memory_bytes, self.memory_limit_bytes)
    }

    /// Returns true if the persistent tier is near capacity (>90%).
    pub fn is_disk_near_capacity(&self) -> bool {
        self.disk_usage_percentage() > 90.0
    }

    /// Bytes that must be evicted for the persistent tier to fit its budget.
    pub fn space_needed(&self) -> u64 {
        self.complete_bytes.saturating_sub(self.disk_limit_bytes)
    }

    /// Returns average bytes per fully cached track.
    pub fn average_track_size(&self) -> u64 {
        if self.complete_tracks == 0 {
            0
        } else {
            self.complete_bytes / self.complete_tracks as u64
        }
    }
}

impl fmt::Display for CacheStatistics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "memory {} / {} ({} segments), temp {} ({} files), complete {} / {} ({} tracks)",
            format_bytes(self.memory_bytes),
            format_bytes(self.memory_limit_bytes),
            self.memory_segments,
            format_bytes(self.temp_bytes),
            self.temp_files,
            format_bytes(self.complete_bytes),
            format_bytes(self.disk_limit_bytes),
            self.complete_tracks,
        )
    }
}

/// Per-track view across all tiers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackCacheInfo {
    pub track_id: String,
    pub state: CacheState,
    pub memory_segments: usize,
    pub temp_bytes: u64,
    pub complete_bytes: u64,
    pub play_count: u32,
    /// Unix milliseconds, when fully cached.
    pub last_play_time: Option<i64>,
    pub extension: Option<String>,
    pub is_priority: bool,
}

fn percentage(used: u64, limit: u64) -> f64 {
    if limit == 0 {
        return 0.0;
    }
    (used as f64 / limit as f64) * 100.0
}

/// Format a byte count as a human-readable string.
pub fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.1} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}
