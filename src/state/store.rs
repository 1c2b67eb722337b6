//! State store trait definition.
//!
//! This module defines the common interface for state storage backends.

use async_trait::async_trait;

use crate::error::Result;

use super::lock::LockInfo;
use super::types::StateSnapshot;

/// Trait for state storage backends.
///
/// `save` must replace the stored snapshot atomically: a crash during a save
/// leaves either the old snapshot or the new one, never a partial write.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Loads the snapshot.
    ///
    /// Returns `None` if no snapshot exists yet.
    async fn load(&self) -> Result<Option<StateSnapshot>>;

    /// Saves the snapshot.
    async fn save(&self, snapshot: &StateSnapshot) -> Result<()>;

    /// Deletes the snapshot.
    async fn delete(&self) -> Result<()>;

    /// Checks if a snapshot exists.
    async fn exists(&self) -> Result<bool>;

    /// Acquires the state lock for `holder`.
    async fn acquire_lock(&self, holder: &str) -> Result<LockInfo>;

    /// Releases the lock if `lock_id` still owns it.
    async fn release_lock(&self, lock_id: &str) -> Result<()>;

    /// Removes the lock regardless of its holder.
    async fn force_unlock(&self) -> Result<()>;

    /// Gets current lock information if locked.
    async fn get_lock_info(&self) -> Result<Option<LockInfo>>;

    /// Gets the backend type name.
    fn backend_type(&self) -> &'static str;

    /// Checks if the state is locked by a live lock.
    async fn is_locked(&self) -> Result<bool> {
        Ok(self
            .get_lock_info()
            .await?
            .is_some_and(|lock| !lock.is_expired()))
    }

    /// Loads the snapshot, or an empty one if none exists.
    async fn load_or_default(&self, stack: &str, environment: &str) -> Result<StateSnapshot> {
        Ok(self
            .load()
            .await?
            .unwrap_or_else(|| StateSnapshot::new(stack, environment)))
    }
}

#[async_trait]
impl StateStore for Box<dyn StateStore> {
    async fn load(&self) -> Result<Option<StateSnapshot>> {
        (**self).load().await
    }

    async fn save(&self, snapshot: &StateSnapshot) -> Result<()> {
        (**self).save(snapshot).await
    }

    async fn delete(&self) -> Result<()> {
        (**self).delete().await
    }

    async fn exists(&self) -> Result<bool> {
        (**self).exists().await
    }

    async fn acquire_lock(&self, holder: &str) -> Result<LockInfo> {
        (**self).acquire_lock(holder).await
    }

    async fn release_lock(&self, lock_id: &str) -> Result<()> {
        (**self).release_lock(lock_id).await
    }

    async fn force_unlock(&self) -> Result<()> {
        (**self).force_unlock().await
    }

    async fn get_lock_info(&self) -> Result<Option<LockInfo>> {
        (**self).get_lock_info().await
    }

    fn backend_type(&self) -> &'static str {
        (**self).backend_type()
    }
}
