//! Pipeline state machine driving convergence from change notifications.
//!
//! Triggers (desired graph revisions and scheduled drift checks) arrive on a
//! channel; the [`PipelineMachine`] processes them one at a time and keeps an
//! auditable record of every run.

mod machine;
mod report;
mod run;
mod trigger;

pub use machine::{DEFAULT_HISTORY_LIMIT, PipelineMachine, PipelineSettings, RunCanceller};
pub use report::{JsonLinesSink, MemorySink, ReportSink, TracingSink};
pub use run::{PipelineRun, RunReport, RunStatus, Stage, StageName, StageOutcome, Transition};
pub use trigger::{
    DriftSchedule, FileGraphLoader, FileWatcher, GraphLoader, TriggerEvent, TriggerKind,
};
