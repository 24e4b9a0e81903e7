// ============================================================================
// Strict linting - Dangerous or non-idiomatic practices are forbidden
// ============================================================================

#![deny(unsafe_code)]                 // Unsafe code is forbidden
#![deny(missing_docs)]                // All public items must be documented
#![deny(non_camel_case_types)]        // Types must follow CamelCase convention
#![warn(dead_code)]                   // Unused code is reported
#![warn(unused_imports)]              // Unused imports are reported
#![warn(unused_variables)]            // Unused variables are reported
#![deny(unused_must_use)]             // Must handle Result and Option explicitly
#![deny(non_snake_case)]              // Variables and functions must be snake_case
#![deny(non_upper_case_globals)]      // Constants must be UPPER_CASE
#![deny(nonstandard_style)]           // Non-standard code style is forbidden
#![forbid(unsafe_op_in_unsafe_fn)]    // Unsafe ops in unsafe fns are forbidden

// Clippy lints (warnings only)
#![warn(clippy::all)]                 // All standard Clippy lints
#![warn(clippy::pedantic)]            // Very strict Clippy lints
#![warn(clippy::nursery)]             // Experimental lints
#![warn(clippy::unwrap_used)]         // unwrap() warning
#![warn(clippy::expect_used)]         // expect() warning
#![warn(clippy::panic)]               // panic!() warning
#![warn(clippy::print_stdout)]        // println!() warning
#![warn(clippy::todo)]                // TODO warning
#![warn(clippy::unimplemented)]       // unimplemented!() warning
#![warn(clippy::missing_const_for_fn)] // Force const when possible
#![warn(clippy::unwrap_in_result)]    // unwrap() in Result warning
#![warn(clippy::redundant_clone)]     // Useless clones warning
#![warn(clippy::shadow_unrelated)]    // Shadowing unrelated variables warning
#![warn(clippy::too_many_arguments)]  // Limit function arguments
#![warn(clippy::cognitive_complexity)] // Limit cognitive complexity
#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used, clippy::panic))]

// Safety and robustness lints
#![deny(overflowing_literals)]        // Overflowing literals are forbidden
#![deny(arithmetic_overflow)]         // Arithmetic overflow is forbidden

// ============================================================================
// Crate Documentation
// ============================================================================

//! # Terrace
//!
//! A plan, apply and drift-detection engine that converges cloud
//! infrastructure to a declarative resource graph.
//!
//! ## Overview
//!
//! Terrace keeps a versioned snapshot of what it last applied and, on every
//! run, computes the smallest dependency-ordered set of provider calls that
//! brings the recorded state to the desired graph:
//!
//! - Declare resources and their references in a YAML or JSON document
//! - Preview changes before anything is touched
//! - Apply in parallel, dependency-safe batches under a state lock
//! - Detect and optionally remediate out-of-band changes
//! - Run continuously as a pipeline driven by graph revisions
//!
//! ## Architecture
//!
//! 1. **Desired state**: a [`graph::ResourceGraph`] loaded from the graph document
//! 2. **Recorded state**: a [`state::StateSnapshot`] in a local or S3 store
//! 3. **Differ and planner**: change-set and ordered batches
//! 4. **Executor**: provider calls with retries, polling and checkpoints
//! 5. **Pipeline**: a state machine serialising triggered runs
//!
//! ## Modules
//!
//! - [`graph`]: Resource graph model, schemas and hashing
//! - [`state`]: Snapshot storage backends (local, S3) and locking
//! - [`provider`]: Provider interface, HTTP and in-memory providers
//! - [`planner`]: Diff computation, batch planning and execution
//! - [`reconciler`]: Plan-and-apply convergence cycle
//! - [`drift`]: Drift detection against live state
//! - [`pipeline`]: Trigger-driven pipeline state machine
//! - [`config`]: Configuration parsing and validation
//! - [`cli`]: Command-line interface
//!
//! ## Example
//!
//! ```yaml
//! resources:
//!   - id: vpc.main
//!     attributes:
//!       cidr_block: 10.0.0.0/16
//!   - id: subnet.a
//!     attributes:
//!       cidr_block: 10.0.1.0/24
//!       vpc_id: { $ref: vpc.main, attribute: id }
//! ```

// ============================================================================
// Modules
// ============================================================================

pub mod cancel;
pub mod cli;
pub mod config;
pub mod drift;
pub mod error;
pub mod graph;
pub mod pipeline;
pub mod planner;
pub mod provider;
pub mod reconciler;
pub mod state;

// ============================================================================
// Re-exports
// ============================================================================

pub use cancel::CancelToken;
pub use cli::{Cli, Commands, OutputFormatter};
pub use config::{ConfigParser, ConfigValidator, EngineConfig};
pub use drift::{DriftDetector, DriftPolicy, DriftReport};
pub use error::{Result, TerraceError};
pub use graph::{Resource, ResourceGraph, ResourceId, SchemaRegistry};
pub use pipeline::{PipelineMachine, PipelineRun, RunReport, TriggerEvent};
pub use planner::{ChangeSet, DiffEngine, ExecutionPlan, ExecutionReport, PlanExecutor, Planner};
pub use provider::{HttpProvider, InMemoryProvider, Provider};
pub use reconciler::{ConvergencePlan, ConvergenceResult, Converger};
pub use state::{LocalStateStore, LockManager, S3StateStore, StateSnapshot, StateStore};
