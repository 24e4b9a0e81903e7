//! Converger for one plan/apply cycle.
//!
//! The converger loads the recorded state, optionally refreshes it from the
//! provider, diffs it against the desired graph, orders the change-set into
//! batches, and hands the plan to the executor. Planning is read-only; only
//! the executor writes the state store.

use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::cancel::CancelToken;
use crate::error::{Result, StateError};
use crate::graph::{ResourceGraph, SchemaRegistry};
use crate::planner::{
    ChangeSet, ChangeSummary, DiffEngine, ExecutionPlan, ExecutionReport, PlanExecutor, Planner,
    RunContext,
};
use crate::provider::StateObserver;
use crate::state::{StateSnapshot, StateStore};

/// Runs Differ, Planner and Executor against a state store.
#[derive(Clone)]
pub struct Converger {
    store: Arc<dyn StateStore>,
    observer: StateObserver,
    diff_engine: DiffEngine,
    planner: Planner,
    executor: PlanExecutor,
    expected_lineage: Option<String>,
}

/// A computed plan and everything it was computed from.
#[derive(Debug, Clone, Serialize)]
pub struct ConvergencePlan {
    /// Snapshot the plan is based on (refreshed if requested).
    #[serde(skip)]
    pub baseline: StateSnapshot,
    /// Serial of the stored snapshot the plan started from.
    pub base_serial: u64,
    /// Whether the baseline was refreshed from live state.
    pub refreshed: bool,
    /// Per-resource changes.
    pub changes: ChangeSet,
    /// Ordered batches.
    pub plan: ExecutionPlan,
}

/// Result of a full convergence cycle.
#[derive(Debug, Clone, Serialize)]
pub struct ConvergenceResult {
    /// Counts of the change-set.
    pub summary: ChangeSummary,
    /// Executor report, absent when there was nothing to do.
    pub report: Option<ExecutionReport>,
}

impl std::fmt::Debug for Converger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Converger")
            .field("backend", &self.store.backend_type())
            .field("executor", &self.executor)
            .field("expected_lineage", &self.expected_lineage)
            .finish_non_exhaustive()
    }
}

impl Converger {
    /// Creates a new converger.
    #[must_use]
    pub fn new(
        store: Arc<dyn StateStore>,
        observer: StateObserver,
        executor: PlanExecutor,
        schemas: SchemaRegistry,
    ) -> Self {
        Self {
            store,
            observer,
            diff_engine: DiffEngine::new(schemas),
            planner: Planner::new(),
            executor,
            expected_lineage: None,
        }
    }

    /// Requires the stored snapshot to carry this lineage.
    #[must_use]
    pub fn with_expected_lineage(mut self, lineage: Option<String>) -> Self {
        self.expected_lineage = lineage;
        self
    }

    /// Gets the state store.
    #[must_use]
    pub fn store(&self) -> &Arc<dyn StateStore> {
        &self.store
    }

    /// Gets the live state observer.
    #[must_use]
    pub const fn observer(&self) -> &StateObserver {
        &self.observer
    }

    /// Gets the schema registry used for validation and diffing.
    #[must_use]
    pub const fn schemas(&self) -> &SchemaRegistry {
        self.diff_engine.schemas()
    }

    /// Validates a desired graph against structure and type schemas.
    ///
    /// # Errors
    ///
    /// Returns the first graph or schema problem found.
    pub fn validate(&self, desired: &ResourceGraph) -> Result<()> {
        self.schemas().validate_graph(desired)?;
        Ok(())
    }

    /// Loads the recorded snapshot, or an empty one on first use.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read, the snapshot format is
    /// unsupported, or the lineage differs from the expected one.
    pub async fn load_baseline(&self) -> Result<StateSnapshot> {
        let snapshot = match self.store.load().await? {
            Some(snapshot) => {
                snapshot.check_version()?;
                snapshot
            }
            None => {
                info!("No recorded state, starting from an empty snapshot");
                self.expected_lineage
                    .as_ref()
                    .map_or_else(StateSnapshot::new, StateSnapshot::with_lineage)
            }
        };

        if let Some(expected) = &self.expected_lineage
            && &snapshot.lineage != expected
        {
            return Err(StateError::LineageMismatch {
                expected: expected.clone(),
                found: snapshot.lineage,
            }
            .into());
        }

        debug!(
            "Baseline: lineage {}, serial {}, {} resources",
            snapshot.lineage,
            snapshot.serial,
            snapshot.len()
        );
        Ok(snapshot)
    }

    /// Computes the plan for `desired` without changing anything.
    ///
    /// With `refresh`, the baseline takes live values from the provider first.
    ///
    /// # Errors
    ///
    /// Returns an error if the graph is invalid, the baseline cannot be
    /// loaded or observed, or the plan has an ordering cycle.
    pub async fn plan(&self, desired: &ResourceGraph, refresh: bool, cancel: &CancelToken) -> Result<ConvergencePlan> {
        self.validate(desired)?;

        let stored = self.load_baseline().await?;
        let base_serial = stored.serial;
        let baseline = if refresh && !stored.is_empty() {
            let observed = self.observer.observe(&stored, cancel).await?;
            if observed.differs_from(&stored) {
                warn!("Live state differs from recorded state, planning against live values");
            }
            observed.refresh(&stored)
        } else {
            stored
        };

        let changes = self.diff_engine.diff(desired, &baseline)?;
        let plan = self.planner.plan(&changes, desired, &baseline)?;
        info!("Plan: {}", plan.summary);

        Ok(ConvergencePlan {
            baseline,
            base_serial,
            refreshed: refresh,
            changes,
            plan,
        })
    }

    /// Applies a plan computed by [`Converger::plan`].
    ///
    /// Must be called while holding the state lock.
    pub async fn apply(&self, planned: ConvergencePlan, ctx: &RunContext) -> ExecutionReport {
        self.executor.execute(&planned.plan, planned.baseline, ctx).await
    }

    /// Plans and, if anything changes, applies.
    ///
    /// # Errors
    ///
    /// Returns an error if planning fails. Execution failures are reported
    /// in the result.
    pub async fn converge(&self, desired: &ResourceGraph, refresh: bool, ctx: &RunContext) -> Result<ConvergenceResult> {
        let planned = self.plan(desired, refresh, &ctx.cancel).await?;
        let summary = planned.plan.summary;

        if planned.plan.is_empty() {
            info!("No changes required - state is converged");
            return Ok(ConvergenceResult { summary, report: None });
        }

        let report = self.apply(planned, ctx).await;
        Ok(ConvergenceResult {
            summary,
            report: Some(report),
        })
    }
}

impl ConvergencePlan {
    /// Returns true if the plan changes something.
    #[must_use]
    pub fn has_changes(&self) -> bool {
        !self.plan.is_empty()
    }
}

impl ConvergenceResult {
    /// Returns true if nothing needed to change or every step succeeded.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.report.as_ref().is_none_or(ExecutionReport::is_success)
    }
}

impl std::fmt::Display for ConvergenceResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.report {
            None => write!(f, "No changes required - state is converged"),
            Some(report) => {
                writeln!(f, "{report}")?;
                write!(f, "Planned: {}", self.summary)
            }
        }
    }
}
