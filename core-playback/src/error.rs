//! # Playback Error Types
//!
//! Error taxonomy for the cache tiers, the preload scheduler and the stream
//! bridge. A normal cache miss is never an error: lookups return `Option`.

use bridge_traits::error::BridgeError;
use thiserror::Error;

/// Errors that can occur during cache and streaming operations.
#[derive(Error, Debug)]
pub enum PlaybackError {
    // ========================================================================
    // Cache Errors
    // ========================================================================
    /// Track is not present in a tier where it was required.
    #[error("Track not cached: {0}")]
    NotCached(String),

    /// Staged size does not match the size the server declared.
    #[error("Incomplete data for track {track_id}: expected {expected} bytes, found {actual}")]
    IncompleteData {
        track_id: String,
        expected: u64,
        actual: u64,
    },

    /// The persisted cache ledger could not be read or parsed.
    #[error("Cache ledger corrupted: {0}")]
    LedgerCorrupted(String),

    // ========================================================================
    // Network Errors
    // ========================================================================
    /// Failure reported by the network collaborator.
    #[error("Network failure: {0}")]
    NetworkFailure(String),

    // ========================================================================
    // Control Errors
    // ========================================================================
    /// A preload task was explicitly stopped.
    #[error("Operation cancelled: {0}")]
    Cancelled(String),

    /// Configuration failed validation.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Requested byte range is malformed or outside the resource.
    #[error("Invalid byte range: {0}")]
    InvalidRange(String),

    /// Stream URL was never issued by this bridge.
    #[error("Unknown stream: {0}")]
    UnknownStream(String),

    // ========================================================================
    // Generic Errors
    // ========================================================================
    /// Disk read, write or rename failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Internal error (should not occur in normal operation).
    #[error("Internal error: {0}")]
    Internal(String),
}

impl PlaybackError {
    /// Returns `true` if this error is transient and the operation can be retried.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            PlaybackError::NetworkFailure(_) | PlaybackError::IncompleteData { .. }
        )
    }

    /// Returns `true` if this error is due to network issues.
    pub fn is_network_error(&self) -> bool {
        matches!(self, PlaybackError::NetworkFailure(_))
    }

    /// Returns `true` for an explicit stop rather than a failure.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, PlaybackError::Cancelled(_))
    }
}

impl From<BridgeError> for PlaybackError {
    fn from(error: BridgeError) -> Self {
        PlaybackError::NetworkFailure(error.to_string())
    }
}

/// Result type for playback operations.
pub type Result<T> = std::result::Result<T, PlaybackError>;
