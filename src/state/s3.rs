//! S3-based state storage backend.
//!
//! Remote state for shared pipelines. Every write is conditional: the
//! snapshot is replaced with `If-Match` on the `ETag` read during the serial
//! check (or `If-None-Match: *` for the first write), and lock objects are
//! created and renewed the same way. A failed precondition means another
//! writer got there first.

use async_trait::async_trait;
use aws_sdk_s3::Client;
use aws_sdk_s3::error::ProvideErrorMetadata;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::error::{Result, StateError, TerraceError};

use super::lock::LockInfo;
use super::store::{StateStore, check_token, check_write};
use super::types::StateSnapshot;

/// State file key suffix.
const STATE_KEY: &str = "state.json";

/// Lock file key suffix.
const LOCK_KEY: &str = "state.lock";

/// S3 error codes returned when a conditional write loses a race.
const PRECONDITION_CODES: [&str; 2] = ["PreconditionFailed", "ConditionalRequestConflict"];

/// S3-based state store.
#[derive(Debug)]
pub struct S3StateStore {
    /// S3 client.
    client: Client,
    /// Bucket name.
    bucket: String,
    /// Key prefix.
    prefix: String,
}

/// An object body with the `ETag` it was read at.
struct Versioned {
    content: String,
    etag: Option<String>,
}

/// Precondition for a conditional put.
enum PutCondition<'a> {
    /// The object must not exist.
    Absent,
    /// The object must still have this `ETag`.
    Matches(&'a str),
}

impl S3StateStore {
    /// Creates a new S3 state store.
    ///
    /// # Errors
    ///
    /// Returns an error if the S3 client cannot be initialized.
    pub async fn new(bucket: &str, prefix: Option<&str>, region: Option<&str>) -> Result<Self> {
        let config = if let Some(region_str) = region {
            aws_config::from_env()
                .region(aws_config::Region::new(region_str.to_string()))
                .load()
                .await
        } else {
            aws_config::load_from_env().await
        };

        Ok(Self::with_client(Client::new(&config), bucket, prefix))
    }

    /// Creates a new S3 state store with an existing client.
    #[must_use]
    pub fn with_client(client: Client, bucket: &str, prefix: Option<&str>) -> Self {
        Self {
            client,
            bucket: bucket.to_string(),
            prefix: normalize_prefix(prefix),
        }
    }

    /// Gets the full S3 key for a file.
    fn key(&self, file: &str) -> String {
        format!("{}{file}", self.prefix)
    }

    /// Gets an object and its `ETag` from S3.
    async fn get_object(&self, key: &str) -> Result<Option<Versioned>> {
        let result = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await;

        match result {
            Ok(response) => {
                let etag = response.e_tag().map(ToString::to_string);
                let bytes = response
                    .body
                    .collect()
                    .await
                    .map_err(|e| StateError::s3(format!("Failed to read S3 object: {e}")))?;

                let content = String::from_utf8(bytes.to_vec())
                    .map_err(|e| StateError::corrupted(format!("Invalid UTF-8 in S3 object: {e}")))?;

                Ok(Some(Versioned { content, etag }))
            }
            Err(sdk_err) => {
                let service_err = sdk_err.into_service_error();
                if service_err.is_no_such_key() {
                    Ok(None)
                } else {
                    Err(StateError::s3(format!("S3 get error: {service_err}")).into())
                }
            }
        }
    }

    /// Puts an object to S3 under a precondition.
    ///
    /// Returns `false` if the precondition failed.
    async fn put_object(
        &self,
        key: &str,
        content: &str,
        condition: Option<PutCondition<'_>>,
    ) -> Result<bool> {
        let mut request = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(content.as_bytes().to_vec().into())
            .content_type("application/json");

        request = match condition {
            Some(PutCondition::Absent) => request.if_none_match("*"),
            Some(PutCondition::Matches(etag)) => request.if_match(etag),
            None => request,
        };

        match request.send().await {
            Ok(_) => Ok(true),
            Err(e) if e.code().is_some_and(|code| PRECONDITION_CODES.contains(&code)) => {
                debug!("Conditional put of s3://{}/{key} lost the race", self.bucket);
                Ok(false)
            }
            Err(e) => Err(StateError::s3(format!("S3 put error: {e}")).into()),
        }
    }

    /// Deletes an object from S3.
    async fn delete_object(&self, key: &str) -> Result<()> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| StateError::s3(format!("S3 delete error: {e}")))?;

        Ok(())
    }

    /// Checks if an object exists in S3.
    async fn object_exists(&self, key: &str) -> Result<bool> {
        let result = self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await;

        match result {
            Ok(_) => Ok(true),
            Err(sdk_err) => {
                let service_err = sdk_err.into_service_error();
                if service_err.is_not_found() {
                    Ok(false)
                } else {
                    Err(StateError::s3(format!("S3 head error: {service_err}")).into())
                }
            }
        }
    }

    async fn read_snapshot(&self) -> Result<Option<(StateSnapshot, Option<String>)>> {
        let Some(object) = self.get_object(&self.key(STATE_KEY)).await? else {
            return Ok(None);
        };

        let snapshot: StateSnapshot = serde_json::from_str(&object.content)
            .map_err(|e| StateError::corrupted(format!("Failed to parse state: {e}")))?;
        snapshot.check_version()?;

        Ok(Some((snapshot, object.etag)))
    }

    async fn read_lock(&self) -> Result<Option<(LockInfo, Option<String>)>> {
        let Some(object) = self.get_object(&self.key(LOCK_KEY)).await? else {
            return Ok(None);
        };

        let lock: LockInfo = serde_json::from_str(&object.content)
            .map_err(|e| StateError::corrupted(format!("Failed to parse lock: {e}")))?;

        Ok(Some((lock, object.etag)))
    }

    async fn current_serial(&self) -> Result<u64> {
        Ok(self.read_snapshot().await?.map_or(0, |(s, _)| s.serial))
    }
}

fn normalize_prefix(prefix: Option<&str>) -> String {
    prefix
        .map(|p| {
            let p = p.trim_matches('/');
            if p.is_empty() {
                String::new()
            } else {
                format!("{p}/")
            }
        })
        .unwrap_or_default()
}

fn to_json<T: serde::Serialize>(value: &T, what: &str) -> Result<String> {
    serde_json::to_string_pretty(value)
        .map_err(|e| StateError::serialization(format!("Failed to serialize {what}: {e}")).into())
}

#[async_trait]
impl StateStore for S3StateStore {
    async fn load(&self) -> Result<Option<StateSnapshot>> {
        let key = self.key(STATE_KEY);
        debug!("Loading state from s3://{}/{key}", self.bucket);

        match self.read_snapshot().await? {
            Some((snapshot, _)) => {
                info!(
                    "Loaded state lineage {} at serial {}",
                    snapshot.lineage, snapshot.serial
                );
                Ok(Some(snapshot))
            }
            None => {
                debug!("No state found in S3");
                Ok(None)
            }
        }
    }

    async fn save(&self, snapshot: &StateSnapshot, expected_serial: u64) -> Result<()> {
        let key = self.key(STATE_KEY);
        info!(
            "Saving state to s3://{}/{key} (serial {} -> {})",
            self.bucket, expected_serial, snapshot.serial
        );

        let stored = self.read_snapshot().await?;
        check_write(stored.as_ref().map(|(s, _)| s), snapshot, expected_serial)?;

        let condition = match &stored {
            None => PutCondition::Absent,
            Some((_, Some(etag))) => PutCondition::Matches(etag),
            Some((_, None)) => {
                return Err(StateError::s3("S3 returned no ETag for the stored state").into());
            }
        };

        let content = to_json(snapshot, "state")?;
        if !self.put_object(&key, &content, Some(condition)).await? {
            let found = self.current_serial().await?;
            return Err(StateError::Conflict {
                expected: expected_serial,
                found,
            }
            .into());
        }

        debug!("State saved successfully to S3");
        Ok(())
    }

    async fn delete(&self) -> Result<()> {
        let state_key = self.key(STATE_KEY);
        let lock_key = self.key(LOCK_KEY);

        info!("Deleting state from s3://{}/{state_key}", self.bucket);

        self.delete_object(&state_key).await?;
        self.delete_object(&lock_key).await?;

        Ok(())
    }

    async fn exists(&self) -> Result<bool> {
        let key = self.key(STATE_KEY);
        self.object_exists(&key).await
    }

    async fn acquire_lock(&self, holder: &str, ttl: Duration) -> Result<LockInfo> {
        let key = self.key(LOCK_KEY);

        let condition = match self.read_lock().await? {
            Some((existing, _)) if !existing.is_expired() => {
                return Err(StateError::LockHeld {
                    holder: existing.holder,
                    since: existing.acquired_at.to_rfc3339(),
                }
                .into());
            }
            Some((existing, etag)) => {
                warn!(
                    "Expired lock {} held by {} found, taking over",
                    existing.lock_id, existing.holder
                );
                etag
            }
            None => None,
        };

        let lock_info = LockInfo::new(holder, ttl);
        let content = to_json(&lock_info, "lock")?;

        let put_condition = condition
            .as_deref()
            .map_or(PutCondition::Absent, PutCondition::Matches);
        if !self.put_object(&key, &content, Some(put_condition)).await? {
            let holder = self
                .read_lock()
                .await?
                .map_or_else(|| String::from("unknown"), |(l, _)| l.holder);
            return Err(StateError::LockHeld {
                holder,
                since: chrono::Utc::now().to_rfc3339(),
            }
            .into());
        }

        info!(
            "Acquired state lock: {} (expires in {}s)",
            lock_info.lock_id, lock_info.ttl_secs
        );

        Ok(lock_info)
    }

    async fn renew_lock(&self, lock: &LockInfo) -> Result<LockInfo> {
        let key = self.key(LOCK_KEY);
        let stored = self.read_lock().await?;
        check_token(stored.as_ref().map(|(l, _)| l), &lock.lock_id)?;

        let mut renewed = lock.clone();
        renewed.refresh();
        let content = to_json(&renewed, "lock")?;

        let condition = stored
            .as_ref()
            .and_then(|(_, etag)| etag.as_deref())
            .map(PutCondition::Matches);
        if !self.put_object(&key, &content, condition).await? {
            return Err(StateError::StaleToken {
                lock_id: lock.lock_id.clone(),
            }
            .into());
        }

        Ok(renewed)
    }

    async fn release_lock(&self, lock_id: &str) -> Result<()> {
        let key = self.key(LOCK_KEY);

        let stored = self.read_lock().await?;
        if let Err(e) = check_token(stored.as_ref().map(|(l, _)| l), lock_id) {
            debug!(
                "Lock ID mismatch: expected {lock_id}, found {:?}",
                stored.map(|(l, _)| l.lock_id)
            );
            return Err(TerraceError::State(e));
        }

        self.delete_object(&key).await?;
        info!("Released state lock: {lock_id}");

        Ok(())
    }

    async fn get_lock_info(&self) -> Result<Option<LockInfo>> {
        Ok(self.read_lock().await?.map(|(lock, _)| lock))
    }

    async fn force_unlock(&self) -> Result<Option<LockInfo>> {
        let existing = self.get_lock_info().await?;
        if let Some(lock) = &existing {
            warn!("Force-unlocking state lock {} held by {}", lock.lock_id, lock.holder);
            self.delete_object(&self.key(LOCK_KEY)).await?;
        }
        Ok(existing)
    }

    fn backend_type(&self) -> &'static str {
        "s3"
    }
}
