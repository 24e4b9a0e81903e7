//! Pipeline run records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::drift::DriftReport;
use crate::error::PipelineError;
use crate::graph::ResourceId;
use crate::planner::ChangeSummary;

use super::trigger::TriggerEvent;

/// Stage of the pipeline state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Stage {
    /// Waiting for a trigger.
    Idle,
    /// A trigger arrived; the desired graph is being loaded.
    Triggered,
    /// Waiting for the state lock.
    Locking,
    /// Computing the change-set.
    Planning,
    /// Executing the plan.
    Applying,
    /// Every change was applied.
    Succeeded,
    /// The run failed.
    Failed,
    /// Nothing needed to change.
    NoChanges,
    /// The run was cancelled.
    Cancelled,
}

/// Terminal status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RunStatus {
    /// Every change was applied.
    Succeeded,
    /// The run failed.
    Failed,
    /// Nothing needed to change.
    NoChanges,
    /// The run was cancelled.
    Cancelled,
}

/// Named unit of work within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageName {
    /// Loading and validating the desired graph.
    Source,
    /// Acquiring the state lock.
    Lock,
    /// Planning or drift detection.
    Plan,
    /// Executing the plan.
    Apply,
}

/// A recorded stage change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transition {
    /// Stage entered.
    pub stage: Stage,
    /// When it was entered.
    pub at: DateTime<Utc>,
}

/// Outcome of one stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageOutcome {
    /// Which stage.
    pub stage: StageName,
    /// Whether it succeeded.
    pub success: bool,
    /// Details.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// When it finished.
    pub at: DateTime<Utc>,
}

/// Record of one pipeline run. Immutable once terminal.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineRun {
    /// Unique run identifier.
    pub run_id: String,
    /// What started the run.
    pub trigger: TriggerEvent,
    /// When the run started.
    pub started_at: DateTime<Utc>,
    /// Current stage.
    pub stage: Stage,
    /// Every stage entered, in order.
    pub transitions: Vec<Transition>,
    /// Outcome of every stage that ran.
    pub stages: Vec<StageOutcome>,
    /// Change summary of the plan or drift check.
    pub summary: ChangeSummary,
    /// Resources changed by the run.
    pub changed: Vec<ResourceId>,
    /// Resources still pending after the run.
    pub pending: Vec<ResourceId>,
    /// Errors encountered.
    pub errors: Vec<String>,
    /// Drift report for drift checks.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub drift: Option<DriftReport>,
    /// When the run reached a terminal stage.
    pub finished_at: Option<DateTime<Utc>>,
}

/// What report sinks receive for a finished run.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    /// Run identifier.
    pub run_id: String,
    /// What started the run.
    pub trigger: TriggerEvent,
    /// Terminal status.
    pub status: RunStatus,
    /// Change summary.
    pub change_summary: ChangeSummary,
    /// Wall-clock duration in milliseconds.
    pub duration_ms: u64,
    /// Errors encountered.
    pub errors: Vec<String>,
    /// Resources changed by the run.
    pub changed: Vec<ResourceId>,
    /// Resources still pending after the run.
    pub pending: Vec<ResourceId>,
    /// Drift report for drift checks.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub drift: Option<DriftReport>,
    /// When the run started.
    pub started_at: DateTime<Utc>,
    /// When the run finished.
    pub finished_at: DateTime<Utc>,
}

impl Stage {
    /// Returns true for stages that end a run.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Succeeded | Self::Failed | Self::NoChanges | Self::Cancelled
        )
    }

    /// Stages a run may move to from this one.
    #[must_use]
    pub const fn can_move_to(self, next: Self) -> bool {
        use Stage::{Applying, Cancelled, Failed, Idle, Locking, NoChanges, Planning, Succeeded, Triggered};
        matches!(
            (self, next),
            (Idle, Triggered)
                | (Triggered, Locking | Planning | Failed | Cancelled)
                | (Locking, Planning | Failed | Cancelled)
                | (Planning, Applying | NoChanges | Succeeded | Failed | Cancelled)
                | (Applying, Succeeded | Failed | Cancelled)
        )
    }
}

impl From<RunStatus> for Stage {
    fn from(status: RunStatus) -> Self {
        match status {
            RunStatus::Succeeded => Self::Succeeded,
            RunStatus::Failed => Self::Failed,
            RunStatus::NoChanges => Self::NoChanges,
            RunStatus::Cancelled => Self::Cancelled,
        }
    }
}

impl PipelineRun {
    /// Starts a run for `trigger` in the triggered stage.
    #[must_use]
    pub fn new(trigger: TriggerEvent) -> Self {
        let now = Utc::now();
        Self {
            run_id: Uuid::new_v4().to_string(),
            trigger,
            started_at: now,
            stage: Stage::Triggered,
            transitions: vec![Transition {
                stage: Stage::Triggered,
                at: now,
            }],
            stages: Vec::new(),
            summary: ChangeSummary::default(),
            changed: Vec::new(),
            pending: Vec::new(),
            errors: Vec::new(),
            drift: None,
            finished_at: None,
        }
    }

    /// Returns true once the run reached a terminal stage.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        self.stage.is_terminal()
    }

    /// Terminal status, if the run has finished.
    #[must_use]
    pub const fn status(&self) -> Option<RunStatus> {
        match self.stage {
            Stage::Succeeded => Some(RunStatus::Succeeded),
            Stage::Failed => Some(RunStatus::Failed),
            Stage::NoChanges => Some(RunStatus::NoChanges),
            Stage::Cancelled => Some(RunStatus::Cancelled),
            _ => None,
        }
    }

    fn ensure_open(&self, to: Stage) -> Result<(), PipelineError> {
        if self.is_terminal() {
            return Err(PipelineError::InvalidTransition {
                run_id: self.run_id.clone(),
                from: self.stage.to_string(),
                to: to.to_string(),
            });
        }
        Ok(())
    }

    /// Moves to `next`.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::InvalidTransition`] if the move is not
    /// allowed from the current stage.
    pub fn transition(&mut self, next: Stage) -> Result<(), PipelineError> {
        if !self.stage.can_move_to(next) {
            return Err(PipelineError::InvalidTransition {
                run_id: self.run_id.clone(),
                from: self.stage.to_string(),
                to: next.to_string(),
            });
        }

        let now = Utc::now();
        self.stage = next;
        self.transitions.push(Transition { stage: next, at: now });
        if next.is_terminal() {
            self.finished_at = Some(now);
        }
        Ok(())
    }

    /// Ends the run with `status`.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::InvalidTransition`] if the run is already
    /// terminal or `status` cannot follow the current stage.
    pub fn finish(&mut self, status: RunStatus) -> Result<(), PipelineError> {
        self.transition(status.into())
    }

    /// Records the outcome of a stage.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::InvalidTransition`] if the run is terminal.
    pub fn record_stage(
        &mut self,
        stage: StageName,
        success: bool,
        message: Option<String>,
    ) -> Result<(), PipelineError> {
        self.ensure_open(self.stage)?;
        if !success && let Some(message) = &message {
            self.errors.push(message.clone());
        }
        self.stages.push(StageOutcome {
            stage,
            success,
            message,
            at: Utc::now(),
        });
        Ok(())
    }

    /// Records an error that does not belong to a single stage.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::InvalidTransition`] if the run is terminal.
    pub fn record_error(&mut self, error: impl fmt::Display) -> Result<(), PipelineError> {
        self.ensure_open(self.stage)?;
        self.errors.push(error.to_string());
        Ok(())
    }

    /// Records what the run changed.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::InvalidTransition`] if the run is terminal.
    pub fn record_changes(
        &mut self,
        summary: ChangeSummary,
        changed: Vec<ResourceId>,
        pending: Vec<ResourceId>,
    ) -> Result<(), PipelineError> {
        self.ensure_open(self.stage)?;
        self.summary = summary;
        self.changed = changed;
        self.pending = pending;
        Ok(())
    }

    /// Attaches a drift report.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::InvalidTransition`] if the run is terminal.
    pub fn attach_drift(&mut self, report: DriftReport) -> Result<(), PipelineError> {
        self.ensure_open(self.stage)?;
        self.summary = report.summary;
        self.drift = Some(report);
        Ok(())
    }

    /// Builds the report sinks receive. `None` until the run is terminal.
    #[must_use]
    pub fn report(&self) -> Option<RunReport> {
        let status = self.status()?;
        let finished_at = self.finished_at.unwrap_or_else(Utc::now);
        let duration_ms: u64 = (finished_at - self.started_at)
            .num_milliseconds()
            .try_into()
            .unwrap_or(0);

        Some(RunReport {
            run_id: self.run_id.clone(),
            trigger: self.trigger.clone(),
            status,
            change_summary: self.summary,
            duration_ms,
            errors: self.errors.clone(),
            changed: self.changed.clone(),
            pending: self.pending.clone(),
            drift: self.drift.clone(),
            started_at: self.started_at,
            finished_at,
        })
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let stage = match self {
            Self::Idle => "idle",
            Self::Triggered => "triggered",
            Self::Locking => "locking",
            Self::Planning => "planning",
            Self::Applying => "applying",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::NoChanges => "no-changes",
            Self::Cancelled => "cancelled",
        };
        write!(f, "{stage}")
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        Stage::from(*self).fmt(f)
    }
}

impl fmt::Display for RunReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Run {} ({}) {} in {}ms: {}",
            self.run_id, self.trigger, self.status, self.duration_ms, self.change_summary
        )?;
        if !self.errors.is_empty() {
            write!(f, "; errors: {}", self.errors.join("; "))?;
        }
        Ok(())
    }
}
