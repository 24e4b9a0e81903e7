//! Local file-based state storage backend.
//!
//! Snapshots are written to a unique temporary file, synced and renamed over
//! the state file, so readers never see a partial write. The lock is a
//! separate file created with `create_new`, which makes acquisition atomic
//! across processes. A stale lock is renamed aside before it is replaced, so
//! only one acquirer can take it over.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{Result, StateError, TerraceError};

use super::lock::LockInfo;
use super::store::{StateStore, check_token, check_write};
use super::types::StateSnapshot;

/// Default state directory name.
pub const STATE_DIR: &str = ".terrace";

/// State file name.
const STATE_FILE: &str = "state.json";

/// Lock file name.
const LOCK_FILE: &str = "state.lock";

/// Contents of the lock file as seen by an acquirer.
enum LockFile {
    Missing,
    Held(LockInfo),
    /// Unparseable content, with the time since the file was last written.
    Unreadable { age: Duration },
}

/// The stale lock an acquirer expects to replace.
enum StaleLock {
    Expired(String),
    Abandoned,
}

/// Local file-based state store.
#[derive(Debug)]
pub struct LocalStateStore {
    /// Base directory for state files.
    base_dir: PathBuf,
    /// Path to the state file.
    state_path: PathBuf,
    /// Path to the lock file.
    lock_path: PathBuf,
    /// Serializes read-check-write sequences within this process.
    write_guard: Mutex<()>,
}

impl LocalStateStore {
    /// Creates a new local state store under `.terrace` in the working directory.
    ///
    /// # Errors
    ///
    /// Returns an error if the current directory cannot be determined.
    pub fn new() -> Result<Self> {
        let base_dir = std::env::current_dir()
            .map_err(|e| TerraceError::internal(format!("Cannot determine current directory: {e}")))?
            .join(STATE_DIR);

        Ok(Self::with_base_dir(base_dir))
    }

    /// Creates a new local state store with a custom base directory.
    #[must_use]
    pub fn with_base_dir(base_dir: impl Into<PathBuf>) -> Self {
        let base_dir = base_dir.into();
        let state_path = base_dir.join(STATE_FILE);
        Self::from_parts(base_dir, state_path)
    }

    /// Creates a new local state store from a custom state file path.
    #[must_use]
    pub fn with_state_path(state_path: impl Into<PathBuf>) -> Self {
        let state_path = state_path.into();
        let base_dir = state_path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map_or_else(|| PathBuf::from("."), Path::to_path_buf);
        Self::from_parts(base_dir, state_path)
    }

    fn from_parts(base_dir: PathBuf, state_path: PathBuf) -> Self {
        let lock_path = base_dir.join(LOCK_FILE);
        Self {
            base_dir,
            state_path,
            lock_path,
            write_guard: Mutex::new(()),
        }
    }

    /// Path of the state file.
    #[must_use]
    pub fn state_path(&self) -> &Path {
        &self.state_path
    }

    /// Ensures the state directory exists.
    async fn ensure_dir(&self) -> Result<()> {
        if !self.base_dir.exists() {
            debug!("Creating state directory: {}", self.base_dir.display());
            fs::create_dir_all(&self.base_dir).await.map_err(|e| {
                StateError::storage(format!("Failed to create state directory: {e}"))
            })?;
        }
        Ok(())
    }

    async fn read_snapshot(&self) -> Result<Option<StateSnapshot>> {
        let content = match fs::read_to_string(&self.state_path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(StateError::corrupted(format!("Failed to read state file: {e}")).into());
            }
        };

        let snapshot: StateSnapshot = serde_json::from_str(&content)
            .map_err(|e| StateError::corrupted(format!("Failed to parse state file: {e}")))?;
        snapshot.check_version()?;

        Ok(Some(snapshot))
    }

    /// Reads the lock file if it exists.
    async fn read_lock_file(&self) -> Result<Option<LockInfo>> {
        let content = match fs::read_to_string(&self.lock_path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(StateError::corrupted(format!("Failed to read lock file: {e}")).into());
            }
        };

        let lock_info: LockInfo = serde_json::from_str(&content)
            .map_err(|e| StateError::corrupted(format!("Failed to parse lock file: {e}")))?;

        Ok(Some(lock_info))
    }

    /// Creates the lock file, failing if it already exists.
    async fn create_lock_file(&self, lock_info: &LockInfo) -> Result<bool> {
        self.ensure_dir().await?;

        let content = serde_json::to_string_pretty(lock_info)
            .map_err(|e| StateError::serialization(format!("Failed to serialize lock: {e}")))?;

        let mut file = match fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&self.lock_path)
            .await
        {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => return Ok(false),
            Err(e) => {
                return Err(StateError::LockFailed {
                    message: format!("Failed to create lock file: {e}"),
                }
                .into());
            }
        };

        file.write_all(content.as_bytes()).await.map_err(|e| StateError::LockFailed {
            message: format!("Failed to write lock file: {e}"),
        })?;

        file.sync_all().await.map_err(|e| StateError::LockFailed {
            message: format!("Failed to sync lock file: {e}"),
        })?;

        Ok(true)
    }

    /// Reads a lock file without failing on unparseable content.
    async fn inspect_lock(path: &Path) -> Result<LockFile> {
        let content = match fs::read_to_string(path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(LockFile::Missing),
            Err(e) => {
                return Err(StateError::corrupted(format!("Failed to read lock file: {e}")).into());
            }
        };

        if let Ok(lock_info) = serde_json::from_str::<LockInfo>(&content) {
            return Ok(LockFile::Held(lock_info));
        }

        let age = fs::metadata(path)
            .await
            .ok()
            .and_then(|m| m.modified().ok())
            .and_then(|modified| modified.elapsed().ok())
            .unwrap_or_default();
        Ok(LockFile::Unreadable { age })
    }

    /// Moves a stale lock file aside so a fresh one can be created.
    ///
    /// The rename succeeds for one acquirer only. If the file it moved is no
    /// longer the stale lock it inspected, another acquirer already replaced
    /// it and the file is linked back. Returns true if the stale lock was
    /// retired by this call.
    async fn retire_lock_file(&self, stale: &StaleLock, ttl: Duration) -> Result<bool> {
        let tombstone = self
            .base_dir
            .join(format!(".{LOCK_FILE}.{}.stale", Uuid::new_v4().simple()));

        match fs::rename(&self.lock_path, &tombstone).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
            Err(e) => {
                return Err(StateError::LockFailed {
                    message: format!("Failed to move stale lock file: {e}"),
                }
                .into());
            }
        }

        let retired = match Self::inspect_lock(&tombstone).await {
            Ok(retired) => retired,
            Err(e) => {
                warn!("Could not inspect retired lock file: {e}");
                LockFile::Missing
            }
        };
        let still_stale = match (stale, &retired) {
            (StaleLock::Expired(lock_id), LockFile::Held(info)) => &info.lock_id == lock_id && info.is_expired(),
            (StaleLock::Abandoned, LockFile::Unreadable { age }) => *age >= ttl,
            _ => false,
        };

        // Linking never overwrites a lock created in the meantime.
        if !still_stale
            && let Err(e) = fs::hard_link(&tombstone, &self.lock_path).await
        {
            warn!("Could not restore lock file moved during takeover: {e}");
        }
        if let Err(e) = fs::remove_file(&tombstone).await {
            debug!("Could not remove {}: {e}", tombstone.display());
        }

        Ok(still_stale)
    }

    /// Error reported when the lock belongs to someone else.
    async fn held_error(&self) -> TerraceError {
        let holder = match Self::inspect_lock(&self.lock_path).await {
            Ok(LockFile::Held(info)) => info.holder,
            _ => String::from("unknown"),
        };
        StateError::LockHeld {
            holder,
            since: chrono::Utc::now().to_rfc3339(),
        }
        .into()
    }

    /// Deletes the lock file.
    async fn delete_lock_file(&self) -> Result<()> {
        match fs::remove_file(&self.lock_path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StateError::LockFailed {
                message: format!("Failed to delete lock file: {e}"),
            }
            .into()),
        }
    }

    /// Writes `content` to `target` through a synced temporary file.
    async fn write_atomic(&self, target: &Path, content: &str) -> Result<()> {
        self.ensure_dir().await?;

        let file_name = target
            .file_name()
            .map_or_else(|| String::from("state"), |n| n.to_string_lossy().to_string());
        let temp_path = self
            .base_dir
            .join(format!(".{file_name}.{}.tmp", Uuid::new_v4().simple()));

        let result = async {
            let mut file = fs::File::create(&temp_path).await.map_err(|e| {
                StateError::storage(format!("Failed to create temp state file: {e}"))
            })?;
            file.write_all(content.as_bytes())
                .await
                .map_err(|e| StateError::storage(format!("Failed to write state file: {e}")))?;
            file.sync_all()
                .await
                .map_err(|e| StateError::storage(format!("Failed to sync state file: {e}")))?;
            fs::rename(&temp_path, target)
                .await
                .map_err(|e| StateError::storage(format!("Failed to rename state file: {e}")))
        }
        .await;

        if result.is_err()
            && let Err(e) = fs::remove_file(&temp_path).await
        {
            debug!("Could not remove temp file {}: {e}", temp_path.display());
        }

        result.map_err(Into::into)
    }
}

#[async_trait]
impl StateStore for LocalStateStore {
    async fn load(&self) -> Result<Option<StateSnapshot>> {
        let snapshot = self.read_snapshot().await?;
        match &snapshot {
            Some(s) => info!(
                "Loaded state from: {} (serial {})",
                self.state_path.display(),
                s.serial
            ),
            None => debug!("State file does not exist: {}", self.state_path.display()),
        }
        Ok(snapshot)
    }

    async fn save(&self, snapshot: &StateSnapshot, expected_serial: u64) -> Result<()> {
        let _guard = self.write_guard.lock().await;

        let stored = self.read_snapshot().await?;
        check_write(stored.as_ref(), snapshot, expected_serial)?;

        info!(
            "Saving state to: {} (serial {} -> {})",
            self.state_path.display(),
            expected_serial,
            snapshot.serial
        );

        let content = serde_json::to_string_pretty(snapshot)
            .map_err(|e| StateError::serialization(format!("Failed to serialize state: {e}")))?;

        self.write_atomic(&self.state_path, &content).await?;

        debug!("State saved successfully");
        Ok(())
    }

    async fn delete(&self) -> Result<()> {
        let _guard = self.write_guard.lock().await;

        if self.state_path.exists() {
            info!("Deleting state file: {}", self.state_path.display());
            fs::remove_file(&self.state_path)
                .await
                .map_err(|e| StateError::storage(format!("Failed to delete state file: {e}")))?;
        }

        self.delete_lock_file().await
    }

    async fn exists(&self) -> Result<bool> {
        Ok(self.state_path.exists())
    }

    async fn acquire_lock(&self, holder: &str, ttl: Duration) -> Result<LockInfo> {
        let lock_info = LockInfo::new(holder, ttl);

        if self.create_lock_file(&lock_info).await? {
            info!(
                "Acquired state lock: {} (expires in {}s)",
                lock_info.lock_id, lock_info.ttl_secs
            );
            return Ok(lock_info);
        }

        match Self::inspect_lock(&self.lock_path).await? {
            LockFile::Missing => {}
            LockFile::Held(existing) if !existing.is_expired() => {
                return Err(StateError::LockHeld {
                    holder: existing.holder,
                    since: existing.acquired_at.to_rfc3339(),
                }
                .into());
            }
            LockFile::Held(existing) => {
                warn!(
                    "Expired lock {} held by {} found, taking over",
                    existing.lock_id, existing.holder
                );
                if !self.retire_lock_file(&StaleLock::Expired(existing.lock_id), ttl).await? {
                    return Err(self.held_error().await);
                }
            }
            // A creator mid-write leaves an unparseable file for a moment.
            LockFile::Unreadable { age } if age < ttl => {
                debug!("Lock file unreadable ({}ms old), treating as held", age.as_millis());
                return Err(self.held_error().await);
            }
            LockFile::Unreadable { age } => {
                warn!("Abandoned lock file ({}s old) found, taking over", age.as_secs());
                if !self.retire_lock_file(&StaleLock::Abandoned, ttl).await? {
                    return Err(self.held_error().await);
                }
            }
        }

        if self.create_lock_file(&lock_info).await? {
            info!(
                "Acquired state lock: {} (expires in {}s)",
                lock_info.lock_id, lock_info.ttl_secs
            );
            return Ok(lock_info);
        }

        Err(self.held_error().await)
    }

    async fn renew_lock(&self, lock: &LockInfo) -> Result<LockInfo> {
        let _guard = self.write_guard.lock().await;

        let stored = self.read_lock_file().await?;
        check_token(stored.as_ref(), &lock.lock_id)?;

        let mut renewed = lock.clone();
        renewed.refresh();

        let content = serde_json::to_string_pretty(&renewed)
            .map_err(|e| StateError::serialization(format!("Failed to serialize lock: {e}")))?;
        self.write_atomic(&self.lock_path, &content).await?;

        Ok(renewed)
    }

    async fn release_lock(&self, lock_id: &str) -> Result<()> {
        let _guard = self.write_guard.lock().await;

        let stored = self.read_lock_file().await?;
        if let Err(e) = check_token(stored.as_ref(), lock_id) {
            debug!(
                "Lock ID mismatch: expected {lock_id}, found {:?}",
                stored.map(|l| l.lock_id)
            );
            return Err(e.into());
        }

        self.delete_lock_file().await?;
        info!("Released state lock: {lock_id}");
        Ok(())
    }

    async fn get_lock_info(&self) -> Result<Option<LockInfo>> {
        self.read_lock_file().await
    }

    async fn force_unlock(&self) -> Result<Option<LockInfo>> {
        let _guard = self.write_guard.lock().await;

        let existing = self.read_lock_file().await?;
        if let Some(lock) = &existing {
            warn!("Force-unlocking state lock {} held by {}", lock.lock_id, lock.holder);
            self.delete_lock_file().await?;
        }
        Ok(existing)
    }

    fn backend_type(&self) -> &'static str {
        "local"
    }
}
