//! In-memory state storage backend.
//!
//! Useful for dry runs and tests. Nothing survives the process.

use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::{Result, StateError};

use super::lock::LockInfo;
use super::store::StateStore;
use super::types::StateSnapshot;

/// In-memory state store.
#[derive(Debug, Default)]
pub struct MemoryStateStore {
    snapshot: Mutex<Option<StateSnapshot>>,
    lock: Mutex<Option<LockInfo>>,
    saves: AtomicUsize,
    fail_after: Mutex<Option<usize>>,
}

impl MemoryStateStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a store holding `snapshot`.
    #[must_use]
    pub fn with_snapshot(snapshot: StateSnapshot) -> Self {
        Self {
            snapshot: Mutex::new(Some(snapshot)),
            ..Self::default()
        }
    }

    /// Returns the number of successful saves.
    #[must_use]
    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }

    /// Makes every save after the first `saves` successful ones fail.
    pub async fn fail_saves_after(&self, saves: usize) {
        *self.fail_after.lock().await = Some(saves);
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn load(&self) -> Result<Option<StateSnapshot>> {
        Ok(self.snapshot.lock().await.clone())
    }

    async fn save(&self, snapshot: &StateSnapshot) -> Result<()> {
        if let Some(limit) = *self.fail_after.lock().await {
            if self.saves.load(Ordering::SeqCst) >= limit {
                return Err(StateError::io("state store is not writable").into());
            }
        }
        *self.snapshot.lock().await = Some(snapshot.clone());
        let count = self.saves.fetch_add(1, Ordering::SeqCst) + 1;
        debug!("Saved in-memory state (save #{count}, serial {})", snapshot.serial);
        Ok(())
    }

    async fn delete(&self) -> Result<()> {
        *self.snapshot.lock().await = None;
        *self.lock.lock().await = None;
        Ok(())
    }

    async fn exists(&self) -> Result<bool> {
        Ok(self.snapshot.lock().await.is_some())
    }

    async fn acquire_lock(&self, holder: &str) -> Result<LockInfo> {
        let mut guard = self.lock.lock().await;
        if let Some(existing) = guard.as_ref() {
            if !existing.is_expired() {
                return Err(StateError::LockedByOther {
                    holder: existing.holder.clone(),
                    since: existing.acquired_at.to_rfc3339(),
                }
                .into());
            }
        }
        let info = LockInfo::new(holder);
        *guard = Some(info.clone());
        Ok(info)
    }

    async fn release_lock(&self, lock_id: &str) -> Result<()> {
        let mut guard = self.lock.lock().await;
        if guard.as_ref().is_some_and(|l| l.lock_id == lock_id) {
            *guard = None;
        }
        Ok(())
    }

    async fn force_unlock(&self) -> Result<()> {
        *self.lock.lock().await = None;
        Ok(())
    }

    async fn get_lock_info(&self) -> Result<Option<LockInfo>> {
        Ok(self.lock.lock().await.clone())
    }

    fn backend_type(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_round_trip_and_count() {
        let store = MemoryStateStore::new();
        assert!(store.load().await.expect("load").is_none());

        let snapshot = StateSnapshot::new("demo", "dev");
        store.save(&snapshot).await.expect("save");
        assert_eq!(store.load().await.expect("load"), Some(snapshot));
        assert_eq!(store.save_count(), 1);
    }

    #[tokio::test]
    async fn test_injected_save_failure() {
        let store = MemoryStateStore::new();
        store.fail_saves_after(1).await;

        let snapshot = StateSnapshot::new("demo", "dev");
        store.save(&snapshot).await.expect("first save");
        assert!(store.save(&snapshot).await.is_err());
    }

    #[tokio::test]
    async fn test_lock_conflict_and_release() {
        let store = MemoryStateStore::new();
        let lock = store.acquire_lock("a").await.expect("lock");
        assert!(store.acquire_lock("b").await.is_err());
        store.release_lock(&lock.lock_id).await.expect("release");
        assert!(!store.is_locked().await.expect("is_locked"));
    }
}
