//! Planning module for convergence runs.
//!
//! This module compares desired and recorded state, orders the resulting
//! changes into dependency-safe batches, and applies those batches through
//! the provider.

mod diff;
mod executor;
mod plan;

pub use diff::{
    AttributeChange, ChangeAction, ChangeEntry, ChangeSet, ChangeSummary, DiffEngine, TAINTED_REASON,
};
pub use executor::{
    DEFAULT_MAX_CONCURRENCY, ExecutionReport, ExecutionStatus, FailedStep, PlanExecutor, RunContext,
    StepRef,
};
pub use plan::{Batch, ExecutionPlan, PlanStep, Planner, StepKind};
