//! Trigger sources for the pipeline.
//!
//! Triggers arrive over a tokio channel. A [`FileWatcher`] emits a revision
//! whenever the desired graph file's content changes and a [`DriftSchedule`]
//! emits drift checks on an interval.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::cancel::CancelToken;
use crate::config::parse_graph;
use crate::error::{PipelineError, Result};
use crate::graph::ResourceGraph;

/// Why a run was started.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TriggerKind {
    /// A new revision of the desired graph.
    Revision {
        /// Where to load the desired graph from.
        desired_graph_ref: String,
    },
    /// A scheduled drift check of the configured desired graph.
    DriftCheck,
}

/// A change notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerEvent {
    /// Revision identifier.
    pub revision_id: String,
    /// What to do.
    #[serde(flatten)]
    pub kind: TriggerKind,
    /// When the notification arrived.
    pub received_at: DateTime<Utc>,
}

impl TriggerEvent {
    /// Creates a revision trigger.
    #[must_use]
    pub fn revision(revision_id: impl Into<String>, desired_graph_ref: impl Into<String>) -> Self {
        Self {
            revision_id: revision_id.into(),
            kind: TriggerKind::Revision {
                desired_graph_ref: desired_graph_ref.into(),
            },
            received_at: Utc::now(),
        }
    }

    /// Creates a drift-check trigger.
    #[must_use]
    pub fn drift_check() -> Self {
        let id = Uuid::new_v4().simple().to_string();
        Self {
            revision_id: format!("drift-{}", &id[..8]),
            kind: TriggerKind::DriftCheck,
            received_at: Utc::now(),
        }
    }

    /// Returns true for drift-check triggers.
    #[must_use]
    pub const fn is_drift_check(&self) -> bool {
        matches!(self.kind, TriggerKind::DriftCheck)
    }
}

impl std::fmt::Display for TriggerEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            TriggerKind::Revision { desired_graph_ref } => {
                write!(f, "revision {} ({desired_graph_ref})", self.revision_id)
            }
            TriggerKind::DriftCheck => write!(f, "drift check {}", self.revision_id),
        }
    }
}

/// Loads a desired graph from a reference.
#[async_trait]
pub trait GraphLoader: Send + Sync {
    /// Loads the graph named by `reference`.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::SourceUnavailable`] if it cannot be read, or
    /// a graph error if the document is not a valid graph.
    async fn load(&self, reference: &str) -> Result<ResourceGraph>;
}

/// Loads desired graphs from YAML or JSON files.
#[derive(Debug, Clone, Default)]
pub struct FileGraphLoader {
    base_path: Option<PathBuf>,
}

impl FileGraphLoader {
    /// Creates a loader resolving relative references from the working directory.
    #[must_use]
    pub const fn new() -> Self {
        Self { base_path: None }
    }

    /// Resolves relative references against `base_path`.
    #[must_use]
    pub fn with_base_path(mut self, base_path: impl Into<PathBuf>) -> Self {
        self.base_path = Some(base_path.into());
        self
    }

    fn resolve(&self, reference: &str) -> PathBuf {
        let path = Path::new(reference);
        match &self.base_path {
            Some(base) if path.is_relative() => base.join(path),
            _ => path.to_path_buf(),
        }
    }
}

#[async_trait]
impl GraphLoader for FileGraphLoader {
    async fn load(&self, reference: &str) -> Result<ResourceGraph> {
        let path = self.resolve(reference);
        let content = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| PipelineError::SourceUnavailable {
                reference: reference.to_string(),
                message: e.to_string(),
            })?;

        parse_graph(&content, &path)
    }
}

/// Hex SHA-256 of file content, used as the revision id.
fn content_revision(content: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content);
    hex::encode(hasher.finalize())
}

/// Polls a desired graph file and emits a revision when its content changes.
#[derive(Debug, Clone)]
pub struct FileWatcher {
    path: PathBuf,
    interval: Duration,
}

impl FileWatcher {
    /// Creates a watcher for `path`.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>, interval: Duration) -> Self {
        Self {
            path: path.into(),
            interval,
        }
    }

    /// Starts watching. The first observation of the file emits a revision.
    ///
    /// The task ends when `stop` fires or the receiver is dropped.
    #[must_use]
    pub fn spawn(self, sender: mpsc::Sender<TriggerEvent>, stop: CancelToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let reference = self.path.display().to_string();
            let mut last_revision: Option<String> = None;
            info!("Watching {reference} every {:?}", self.interval);

            loop {
                match tokio::fs::read(&self.path).await {
                    Ok(content) => {
                        let revision = content_revision(&content);
                        if last_revision.as_deref() != Some(revision.as_str()) {
                            debug!("{reference} changed, revision {}", &revision[..12]);
                            let event = TriggerEvent::revision(&revision[..12], reference.clone());
                            if sender.send(event).await.is_err() {
                                break;
                            }
                            last_revision = Some(revision);
                        }
                    }
                    Err(e) => warn!("Cannot read {reference}: {e}"),
                }

                tokio::select! {
                    () = tokio::time::sleep(self.interval) => {}
                    () = stop.cancelled() => break,
                }
            }
        })
    }
}

/// Emits drift checks on a fixed interval.
#[derive(Debug, Clone, Copy)]
pub struct DriftSchedule {
    interval: Duration,
}

impl DriftSchedule {
    /// Creates a schedule firing every `interval`.
    #[must_use]
    pub const fn new(interval: Duration) -> Self {
        Self { interval }
    }

    /// Starts the schedule. The first check fires one interval from now.
    #[must_use]
    pub fn spawn(self, sender: mpsc::Sender<TriggerEvent>, stop: CancelToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    () = stop.cancelled() => break,
                }
                if sender.send(TriggerEvent::drift_check()).await.is_err() {
                    break;
                }
            }
        })
    }
}
