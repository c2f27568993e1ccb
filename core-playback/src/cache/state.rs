//! Derived per-track cache state.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Highest tier holding data for a track.
///
/// Ordered so that `Complete > TempFile > InMemory > None`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheState {
    /// Nothing cached
    None,
    /// Segments resident in memory only
    InMemory,
    /// A staging file exists
    TempFile,
    /// The full file is in the persistent tier
    Complete,
}

impl CacheState {
    /// A file the player can open directly exists.
    pub fn is_on_disk(&self) -> bool {
        matches!(self, CacheState::TempFile | CacheState::Complete)
    }

    pub fn is_complete(&self) -> bool {
        *self == CacheState::Complete
    }
}

impl fmt::Display for CacheState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            CacheState::None => "none",
            CacheState::InMemory => "in_memory",
            CacheState::TempFile => "temp_file",
            CacheState::Complete => "complete",
        };
        f.write_str(label)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_ordering() {
        assert!(CacheState::Complete > CacheState::TempFile);
        assert!(CacheState::TempFile > CacheState::InMemory);
        assert!(CacheState::InMemory > CacheState::None);
    }

    #[test]
    fn test_state_helpers() {
        assert!(CacheState::TempFile.is_on_disk());
        assert!(!CacheState::InMemory.is_on_disk());
        assert!(CacheState::Complete.is_complete());
        assert_eq!(CacheState::TempFile.to_string(), "temp_file");
    }
}
