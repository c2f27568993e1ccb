//! Per-track async locks.

use core_async::sync::{Mutex, OwnedMutexGuard};
use parking_lot::Mutex as SyncMutex;
use std::collections::HashMap;
use std::sync::Arc;

/// Serializes work per key while letting different keys proceed in parallel.
///
/// Lock handles are created on demand and dropped once nobody holds or waits
/// on them.
#[derive(Default)]
pub struct KeyedLocks {
    locks: SyncMutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl KeyedLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `key`.
    pub async fn lock(&self, key: &str) -> OwnedMutexGuard<()> {
        let handle = {
            let mut locks = self.locks.lock();
            locks.retain(|_, lock| Arc::strong_count(lock) > 1);
            locks
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        handle.lock_owned().await
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.locks.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_same_key_is_serialized() {
        let locks = Arc::new(KeyedLocks::new());
        let guard = locks.lock("T1").await;

        let contender = {
            let locks = locks.clone();
            tokio::spawn(async move {
                let _guard = locks.lock("T1").await;
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!contender.is_finished());

        drop(guard);
        contender.await.unwrap();
    }

    #[tokio::test]
    async fn test_different_keys_do_not_block() {
        let locks = KeyedLocks::new();
        let _first = locks.lock("T1").await;
        let second = tokio::time::timeout(Duration::from_millis(50), locks.lock("T2")).await;
        assert!(second.is_ok());
    }

    #[tokio::test]
    async fn test_idle_handles_are_pruned() {
        let locks = KeyedLocks::new();
        drop(locks.lock("T1").await);
        drop(locks.lock("T2").await);
        let _held = locks.lock("T3").await;
        assert_eq!(locks.len(), 1);
    }
}
