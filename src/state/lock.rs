//! State locking for concurrent access protection.
//!
//! Locks live in the same backend as the state. The [`LockManager`] adds
//! waiting with a timeout, cancellation and heartbeat renewal on top of the
//! single-attempt operations of a [`StateStore`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::cancel::CancelToken;
use crate::error::{PipelineError, Result, StateError, TerraceError};

use super::store::StateStore;

/// Default lock time-to-live in seconds.
pub const DEFAULT_LOCK_TTL_SECS: u64 = 300;

/// Information about a state lock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockInfo {
    /// Unique lock identifier.
    pub lock_id: String,
    /// Who holds the lock.
    pub holder: String,
    /// When the lock was acquired.
    pub acquired_at: DateTime<Utc>,
    /// When the lock expires.
    pub expires_at: DateTime<Utc>,
    /// Lifetime granted on acquisition and on every renewal.
    pub ttl_secs: u64,
}

impl LockInfo {
    /// Creates a new lock info expiring after `ttl`.
    #[must_use]
    pub fn new(holder: &str, ttl: Duration) -> Self {
        let now = Utc::now();
        let ttl_secs = ttl.as_secs().max(1);
        Self {
            lock_id: Uuid::new_v4().to_string(),
            holder: holder.to_string(),
            acquired_at: now,
            expires_at: now + chrono::Duration::seconds(clamp_secs(ttl_secs)),
            ttl_secs,
        }
    }

    /// Checks if the lock has expired.
    #[must_use]
    pub fn is_expired(&self) -> bool {
        Utc::now() > self.expires_at
    }

    /// Pushes the expiry one ttl into the future.
    pub fn refresh(&mut self) {
        self.expires_at = Utc::now() + chrono::Duration::seconds(clamp_secs(self.ttl_secs));
    }

    /// Returns the remaining time until expiry in seconds.
    #[must_use]
    pub fn remaining_secs(&self) -> i64 {
        let remaining = self.expires_at - Utc::now();
        remaining.num_seconds().max(0)
    }
}

fn clamp_secs(secs: u64) -> i64 {
    i64::try_from(secs).unwrap_or(i64::MAX / 1000)
}

/// Generates a unique holder identifier for the current process.
#[must_use]
pub fn generate_holder_id() -> String {
    let hostname = hostname::get().map_or_else(
        |_| String::from("unknown"),
        |h| h.to_string_lossy().to_string(),
    );

    let pid = std::process::id();
    let uuid = Uuid::new_v4().simple().to_string();

    format!("{hostname}-{pid}-{}", &uuid[..8])
}

/// Acquires, renews and releases the state lock on behalf of a run.
#[derive(Clone)]
pub struct LockManager {
    store: Arc<dyn StateStore>,
    ttl: Duration,
    poll_interval: Duration,
}

impl std::fmt::Debug for LockManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockManager")
            .field("backend", &self.store.backend_type())
            .field("ttl", &self.ttl)
            .field("poll_interval", &self.poll_interval)
            .finish()
    }
}

impl LockManager {
    /// Creates a lock manager with the default ttl and a one second poll.
    #[must_use]
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        Self {
            store,
            ttl: Duration::from_secs(DEFAULT_LOCK_TTL_SECS),
            poll_interval: Duration::from_secs(1),
        }
    }

    /// Sets the lock lifetime.
    #[must_use]
    pub const fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Sets how often a waiting acquisition retries.
    #[must_use]
    pub const fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// The lock lifetime.
    #[must_use]
    pub const fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Acquires the lock, waiting up to `timeout` while another holder has it.
    ///
    /// A zero timeout makes a single attempt.
    ///
    /// # Errors
    ///
    /// - [`StateError::LockHeld`] when a single attempt finds the lock held
    /// - [`StateError::LockTimeout`] when the wait elapses
    /// - [`PipelineError::Cancelled`] when `cancel` fires while waiting
    pub async fn acquire(
        &self,
        holder: &str,
        timeout: Duration,
        cancel: &CancelToken,
    ) -> Result<LockInfo> {
        let started = Instant::now();

        loop {
            match self.store.acquire_lock(holder, self.ttl).await {
                Ok(lock) => return Ok(lock),
                Err(TerraceError::State(StateError::LockHeld { holder: current, since })) => {
                    if timeout.is_zero() {
                        return Err(StateError::LockHeld {
                            holder: current,
                            since,
                        }
                        .into());
                    }

                    let elapsed = started.elapsed();
                    if elapsed >= timeout {
                        return Err(StateError::LockTimeout {
                            holder: current,
                            waited_secs: elapsed.as_secs(),
                        }
                        .into());
                    }

                    debug!("State lock held by {current} since {since}, waiting");
                    let wait = self.poll_interval.min(timeout - elapsed);
                    tokio::select! {
                        () = tokio::time::sleep(wait) => {}
                        () = cancel.cancelled() => {
                            return Err(PipelineError::Cancelled {
                                run_id: holder.to_string(),
                            }
                            .into());
                        }
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Extends the lock's expiry.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::StaleToken`] if the lock is no longer ours.
    pub async fn renew(&self, lock: &LockInfo) -> Result<LockInfo> {
        self.store.renew_lock(lock).await
    }

    /// Releases the lock.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::StaleToken`] if the lock is no longer ours.
    pub async fn release(&self, lock: &LockInfo) -> Result<()> {
        self.store.release_lock(&lock.lock_id).await
    }

    /// Starts renewing `lock` every third of its ttl.
    #[must_use]
    pub fn start_heartbeat(&self, lock: LockInfo) -> LockHeartbeat {
        let interval = (self.ttl / 3).max(Duration::from_millis(10));
        self.start_heartbeat_every(lock, interval)
    }

    /// Starts renewing `lock` at an explicit interval.
    #[must_use]
    pub fn start_heartbeat_every(&self, lock: LockInfo, interval: Duration) -> LockHeartbeat {
        let (tx, rx) = watch::channel(lock);
        let lost = Arc::new(AtomicBool::new(false));
        let stop = CancelToken::new();

        let store = Arc::clone(&self.store);
        let task_lost = Arc::clone(&lost);
        let task_stop = stop.clone();

        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = tokio::time::sleep(interval) => {}
                    () = task_stop.cancelled() => break,
                }

                let current = tx.borrow().clone();
                match store.renew_lock(&current).await {
                    Ok(renewed) => {
                        debug!(
                            "Renewed state lock {} (expires {})",
                            renewed.lock_id, renewed.expires_at
                        );
                        tx.send_replace(renewed);
                    }
                    Err(TerraceError::State(StateError::StaleToken { lock_id })) => {
                        warn!("State lock {lock_id} lost, stopping heartbeat");
                        task_lost.store(true, Ordering::SeqCst);
                        break;
                    }
                    Err(e) => {
                        warn!("Failed to renew state lock: {e}");
                    }
                }
            }
        });

        LockHeartbeat {
            current: rx,
            lost,
            stop,
            handle,
        }
    }
}

/// Background renewal of a held lock.
#[derive(Debug)]
pub struct LockHeartbeat {
    current: watch::Receiver<LockInfo>,
    lost: Arc<AtomicBool>,
    stop: CancelToken,
    handle: JoinHandle<()>,
}

impl LockHeartbeat {
    /// The most recently renewed lock.
    #[must_use]
    pub fn current(&self) -> LockInfo {
        self.current.borrow().clone()
    }

    /// Returns true once a renewal found the lock held by someone else.
    #[must_use]
    pub fn is_lost(&self) -> bool {
        self.lost.load(Ordering::SeqCst)
    }

    /// Stops renewing and returns the latest lock.
    pub async fn stop(self) -> LockInfo {
        self.stop.cancel();
        if let Err(e) = self.handle.await {
            warn!("Lock heartbeat task failed: {e}");
        }
        let lock = self.current.borrow().clone();
        info!("Stopped heartbeat for state lock {}", lock.lock_id);
        lock
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::LocalStateStore;
    use tempfile::TempDir;
    use tokio_test::{assert_err, assert_ok};

    fn manager(temp: &TempDir) -> LockManager {
        let store: Arc<dyn StateStore> = Arc::new(LocalStateStore::with_base_dir(temp.path()));
        LockManager::new(store)
            .with_ttl(Duration::from_secs(30))
            .with_poll_interval(Duration::from_millis(20))
    }

    #[test]
    fn test_lock_info_creation() {
        let lock = LockInfo::new("test-holder", Duration::from_secs(60));
        assert_eq!(lock.holder, "test-holder");
        assert!(!lock.is_expired());
        assert!(lock.remaining_secs() > 0);
    }

    #[test]
    fn test_lock_refresh() {
        let mut lock = LockInfo::new("test-holder", Duration::from_secs(60));
        let original_expiry = lock.expires_at;

        std::thread::sleep(std::time::Duration::from_millis(10));
        lock.refresh();

        assert!(lock.expires_at >= original_expiry);
    }

    #[test]
    fn test_holder_id_generation() {
        let id1 = generate_holder_id();
        let id2 = generate_holder_id();

        assert_ne!(id1, id2);

        let pid = std::process::id().to_string();
        assert!(id1.contains(&pid));
    }

    #[tokio::test]
    async fn test_zero_timeout_reports_lock_held() {
        let temp = TempDir::new().expect("temp dir");
        let manager = manager(&temp);
        let cancel = CancelToken::new();

        let _first = assert_ok!(manager.acquire("a", Duration::ZERO, &cancel).await);
        let err = assert_err!(manager.acquire("b", Duration::ZERO, &cancel).await);
        assert!(matches!(
            err,
            TerraceError::State(StateError::LockHeld { ref holder, .. }) if holder == "a"
        ));
    }

    #[tokio::test]
    async fn test_wait_times_out() {
        let temp = TempDir::new().expect("temp dir");
        let manager = manager(&temp);
        let cancel = CancelToken::new();

        let _first = assert_ok!(manager.acquire("a", Duration::ZERO, &cancel).await);
        let err = assert_err!(
            manager
                .acquire("b", Duration::from_millis(100), &cancel)
                .await
        );
        assert!(matches!(
            err,
            TerraceError::State(StateError::LockTimeout { .. })
        ));
    }

    #[tokio::test]
    async fn test_waiter_acquires_after_release() {
        let temp = TempDir::new().expect("temp dir");
        let manager = manager(&temp);
        let cancel = CancelToken::new();

        let first = assert_ok!(manager.acquire("a", Duration::ZERO, &cancel).await);

        let releaser = manager.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            releaser.release(&first).await.expect("release");
        });

        let second = assert_ok!(
            manager
                .acquire("b", Duration::from_secs(5), &cancel)
                .await
        );
        assert_eq!(second.holder, "b");
    }

    #[tokio::test]
    async fn test_cancel_aborts_wait() {
        let temp = TempDir::new().expect("temp dir");
        let manager = manager(&temp);
        let cancel = CancelToken::new();

        let _first = assert_ok!(manager.acquire("a", Duration::ZERO, &cancel).await);

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            trigger.cancel();
        });

        let err = assert_err!(manager.acquire("b", Duration::from_secs(10), &cancel).await);
        assert!(matches!(
            err,
            TerraceError::Pipeline(PipelineError::Cancelled { .. })
        ));
    }

    #[tokio::test]
    async fn test_concurrent_acquires_yield_one_token() {
        let temp = TempDir::new().expect("temp dir");
        let manager = manager(&temp);
        let cancel = CancelToken::new();

        let (a, b) = tokio::join!(
            manager.acquire("a", Duration::ZERO, &cancel),
            manager.acquire("b", Duration::ZERO, &cancel)
        );
        assert_eq!(usize::from(a.is_ok()) + usize::from(b.is_ok()), 1);
    }

    #[tokio::test]
    async fn test_heartbeat_renews_and_detects_loss() {
        let temp = TempDir::new().expect("temp dir");
        let manager = manager(&temp);
        let cancel = CancelToken::new();

        let lock = assert_ok!(manager.acquire("a", Duration::ZERO, &cancel).await);
        let heartbeat = manager.start_heartbeat_every(lock.clone(), Duration::from_millis(20));

        tokio::time::sleep(Duration::from_millis(70)).await;
        assert!(heartbeat.current().expires_at >= lock.expires_at);
        assert!(!heartbeat.is_lost());

        assert_ok!(manager.store.force_unlock().await);
        tokio::time::sleep(Duration::from_millis(70)).await;
        assert!(heartbeat.is_lost());

        let last = heartbeat.stop().await;
        assert_eq!(last.lock_id, lock.lock_id);
    }
}
