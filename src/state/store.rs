//! State store trait definition.
//!
//! This module defines the common interface for state storage backends.

use async_trait::async_trait;
use std::time::Duration;

use crate::error::{Result, StateError};

use super::lock::LockInfo;
use super::types::StateSnapshot;

/// Trait for state storage backends.
///
/// Writes are compare-and-swap on the snapshot serial: a save names the
/// serial it started from and fails if the store has moved on. An absent
/// snapshot counts as serial 0.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Loads the snapshot.
    ///
    /// Returns `None` if no state exists yet.
    async fn load(&self) -> Result<Option<StateSnapshot>>;

    /// Atomically replaces the snapshot.
    ///
    /// Fails with [`StateError::Conflict`] if the stored serial is not
    /// `expected_serial`, and with [`StateError::LineageMismatch`] if the
    /// stored lineage differs from the snapshot's.
    async fn save(&self, snapshot: &StateSnapshot, expected_serial: u64) -> Result<()>;

    /// Deletes the snapshot and any lock.
    async fn delete(&self) -> Result<()>;

    /// Checks if a snapshot exists.
    async fn exists(&self) -> Result<bool>;

    /// Makes a single attempt to take the lock for `ttl`.
    ///
    /// Fails with [`StateError::LockHeld`] if an unexpired lock exists.
    async fn acquire_lock(&self, holder: &str, ttl: Duration) -> Result<LockInfo>;

    /// Extends a held lock by its ttl.
    ///
    /// Fails with [`StateError::StaleToken`] if the lock is no longer held
    /// under this lock id.
    async fn renew_lock(&self, lock: &LockInfo) -> Result<LockInfo>;

    /// Releases a lock.
    ///
    /// Fails with [`StateError::StaleToken`] if the lock is no longer held
    /// under this lock id.
    async fn release_lock(&self, lock_id: &str) -> Result<()>;

    /// Gets current lock information, expired or not.
    async fn get_lock_info(&self) -> Result<Option<LockInfo>>;

    /// Checks if an unexpired lock exists.
    async fn is_locked(&self) -> Result<bool> {
        Ok(self
            .get_lock_info()
            .await?
            .is_some_and(|lock| !lock.is_expired()))
    }

    /// Removes any lock regardless of holder.
    async fn force_unlock(&self) -> Result<Option<LockInfo>>;

    /// Gets the backend type name.
    fn backend_type(&self) -> &'static str;
}

/// Checks the stored snapshot against a pending write.
///
/// # Errors
///
/// Returns [`StateError::Conflict`] or [`StateError::LineageMismatch`].
pub fn check_write(
    stored: Option<&StateSnapshot>,
    snapshot: &StateSnapshot,
    expected_serial: u64,
) -> std::result::Result<(), StateError> {
    let found = stored.map_or(0, |s| s.serial);
    if found != expected_serial {
        return Err(StateError::Conflict {
            expected: expected_serial,
            found,
        });
    }

    if let Some(stored) = stored
        && stored.lineage != snapshot.lineage
    {
        return Err(StateError::LineageMismatch {
            expected: stored.lineage.clone(),
            found: snapshot.lineage.clone(),
        });
    }

    Ok(())
}

/// Checks that a held lock still matches the stored one.
///
/// # Errors
///
/// Returns [`StateError::StaleToken`] on mismatch or absence.
pub fn check_token(stored: Option<&LockInfo>, lock_id: &str) -> std::result::Result<(), StateError> {
    match stored {
        Some(current) if current.lock_id == lock_id => Ok(()),
        _ => Err(StateError::StaleToken {
            lock_id: lock_id.to_string(),
        }),
    }
}

#[async_trait]
impl StateStore for Box<dyn StateStore> {
    async fn load(&self) -> Result<Option<StateSnapshot>> {
        (**self).load().await
    }

    async fn save(&self, snapshot: &StateSnapshot, expected_serial: u64) -> Result<()> {
        (**self).save(snapshot, expected_serial).await
    }

    async fn delete(&self) -> Result<()> {
        (**self).delete().await
    }

    async fn exists(&self) -> Result<bool> {
        (**self).exists().await
    }

    async fn acquire_lock(&self, holder: &str, ttl: Duration) -> Result<LockInfo> {
        (**self).acquire_lock(holder, ttl).await
    }

    async fn renew_lock(&self, lock: &LockInfo) -> Result<LockInfo> {
        (**self).renew_lock(lock).await
    }

    async fn release_lock(&self, lock_id: &str) -> Result<()> {
        (**self).release_lock(lock_id).await
    }

    async fn get_lock_info(&self) -> Result<Option<LockInfo>> {
        (**self).get_lock_info().await
    }

    async fn is_locked(&self) -> Result<bool> {
        (**self).is_locked().await
    }

    async fn force_unlock(&self) -> Result<Option<LockInfo>> {
        (**self).force_unlock().await
    }

    fn backend_type(&self) -> &'static str {
        (**self).backend_type()
    }
}
