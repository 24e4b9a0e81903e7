//! Drift detection.
//!
//! Compares live state, as reported by the provider, against both the
//! recorded snapshot and the desired graph. Detection never writes state
//! and never takes the lock.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use tracing::{info, warn};

use crate::cancel::CancelToken;
use crate::error::Result;
use crate::graph::{ResourceGraph, ResourceId};
use crate::planner::{ChangeEntry, ChangeSummary, DiffEngine};
use crate::reconciler::Converger;

/// What a pipeline does when a scheduled drift check finds drift.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DriftPolicy {
    /// Report drift and leave resources alone.
    #[default]
    ReportOnly,
    /// Refresh from live state and converge.
    AutoRemediate,
}

/// Detects drift between live, recorded and desired state.
#[derive(Debug, Clone)]
pub struct DriftDetector {
    converger: Converger,
    diff_engine: DiffEngine,
}

/// Result of a drift check.
#[derive(Debug, Clone, Serialize)]
pub struct DriftReport {
    /// Whether live state differs from the recorded snapshot.
    pub has_drift: bool,
    /// Counts of the changes needed to bring live state back to desired.
    pub summary: ChangeSummary,
    /// Changes needed to bring live state back to desired.
    pub changes: Vec<ChangeEntry>,
    /// Recorded resources that no longer exist.
    pub missing: Vec<ResourceId>,
    /// Recorded resources whose live values changed.
    pub modified: Vec<ResourceId>,
    /// Serial of the snapshot that was checked.
    pub serial: u64,
    /// When the check ran.
    pub checked_at: DateTime<Utc>,
}

impl DriftDetector {
    /// Creates a detector sharing the converger's store, provider and schemas.
    #[must_use]
    pub fn new(converger: Converger) -> Self {
        let diff_engine = DiffEngine::new(converger.schemas().clone());
        Self {
            converger,
            diff_engine,
        }
    }

    /// Checks live state for drift.
    ///
    /// # Errors
    ///
    /// Returns an error if the desired graph is invalid, or the recorded
    /// state cannot be loaded or observed.
    pub async fn detect(&self, desired: &ResourceGraph, cancel: &CancelToken) -> Result<DriftReport> {
        self.converger.validate(desired)?;

        let stored = self.converger.load_baseline().await?;
        let observed = self.converger.observer().observe(&stored, cancel).await?;
        let live = observed.refresh(&stored);

        let modified: Vec<ResourceId> = observed
            .resources
            .iter()
            .filter(|(id, live)| {
                stored
                    .get(id)
                    .is_some_and(|r| r.attributes != live.attributes || r.outputs != live.outputs)
            })
            .map(|(id, _)| id.clone())
            .collect();
        let missing: Vec<ResourceId> = observed.missing.iter().cloned().collect();

        let change_set = self.diff_engine.diff(desired, &live)?;
        let summary = change_set.summary();
        let changes: Vec<ChangeEntry> = change_set.changes().cloned().collect();

        let has_drift = !missing.is_empty() || !modified.is_empty();
        if has_drift {
            warn!(
                "Drift detected: {} missing, {} modified",
                missing.len(),
                modified.len()
            );
        } else {
            info!("No drift detected in {} resources", stored.len());
        }

        Ok(DriftReport {
            has_drift,
            summary,
            changes,
            missing,
            modified,
            serial: stored.serial,
            checked_at: Utc::now(),
        })
    }
}

impl DriftReport {
    /// Identities that need a change to match the desired graph.
    #[must_use]
    pub fn affected(&self) -> BTreeSet<ResourceId> {
        self.changes.iter().map(|c| c.id.clone()).collect()
    }
}

impl std::fmt::Display for DriftPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ReportOnly => write!(f, "report_only"),
            Self::AutoRemediate => write!(f, "auto_remediate"),
        }
    }
}

impl std::fmt::Display for DriftReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if !self.has_drift && self.changes.is_empty() {
            return write!(f, "No drift: live state matches recorded state (serial {})", self.serial);
        }

        if self.has_drift {
            writeln!(f, "Drift detected at serial {}:", self.serial)?;
            for id in &self.missing {
                writeln!(f, "  missing  {id}")?;
            }
            for id in &self.modified {
                writeln!(f, "  modified {id}")?;
            }
        } else {
            writeln!(f, "No drift, but the desired graph has unapplied changes:")?;
        }

        for change in &self.changes {
            writeln!(f, "  {change}")?;
            for attr in &change.changes {
                writeln!(f, "      {attr}")?;
            }
        }
        write!(f, "{}", self.summary)
    }
}
