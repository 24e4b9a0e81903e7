//! Output formatting for CLI commands.
//!
//! This module provides formatting utilities for displaying
//! information to the user in various formats.

use colored::Colorize;
use serde::Serialize;
use std::fmt::Write;
use tabled::{Table, Tabled};

use crate::config::ValidationResult;
use crate::drift::DriftReport;
use crate::graph::ResourceId;
use crate::pipeline::{RunReport, RunStatus};
use crate::planner::{
    ChangeAction, ChangeEntry, ChangeSummary, ExecutionReport, ExecutionStatus, FailedStep,
    StepRef,
};
use crate::reconciler::ConvergencePlan;
use crate::state::{LockInfo, ResourceStatus, StateSnapshot};

use super::commands::OutputFormat;

/// Output formatter for CLI.
#[derive(Debug, Clone, Copy)]
pub struct OutputFormatter {
    /// Output format.
    format: OutputFormat,
}

/// Change row for table display.
#[derive(Tabled)]
struct ChangeRow {
    #[tabled(rename = "#")]
    index: usize,
    #[tabled(rename = "Action")]
    action: String,
    #[tabled(rename = "Resource")]
    resource: String,
    #[tabled(rename = "Reason")]
    reason: String,
}

/// Resource row for state display.
#[derive(Tabled)]
struct ResourceRow {
    #[tabled(rename = "Resource")]
    resource: String,
    #[tabled(rename = "Status")]
    status: String,
    #[tabled(rename = "Provider ID")]
    provider_id: String,
    #[tabled(rename = "Updated")]
    updated: String,
}

impl OutputFormatter {
    /// Creates a new output formatter.
    #[must_use]
    pub const fn new(format: OutputFormat) -> Self {
        Self { format }
    }

    /// Returns true when emitting JSON.
    #[must_use]
    pub const fn is_json(&self) -> bool {
        matches!(self.format, OutputFormat::Json)
    }

    /// Formats a convergence plan for display.
    #[must_use]
    pub fn format_plan(&self, plan: &ConvergencePlan, detailed: bool) -> String {
        match self.format {
            OutputFormat::Json => to_json(&PlanJson::from(plan)),
            OutputFormat::Text => Self::format_plan_text(plan, detailed),
        }
    }

    /// Formats a plan as text.
    fn format_plan_text(plan: &ConvergencePlan, detailed: bool) -> String {
        if !plan.has_changes() {
            return format!(
                "{} No changes required - state is converged.\n",
                "✓".green()
            );
        }

        let mut output = String::new();

        let _ = writeln!(output, "\nConvergence Plan");
        let _ = write!(output, "   Base serial: {}", plan.base_serial);
        if plan.refreshed {
            let _ = write!(output, " (refreshed)");
        }
        output.push_str("\n\n");

        let changes: Vec<&ChangeEntry> = plan.changes.changes().collect();
        let rows: Vec<ChangeRow> = changes
            .iter()
            .enumerate()
            .map(|(i, entry)| ChangeRow {
                index: i + 1,
                action: Self::format_action(entry.action),
                resource: entry.id.to_string(),
                reason: Self::truncate(&Self::reason(entry), 48),
            })
            .collect();

        output.push_str(&Table::new(rows).to_string());
        output.push('\n');

        if detailed {
            output.push('\n');
            for entry in &changes {
                let _ = writeln!(output, "{entry}");
                for change in &entry.changes {
                    let _ = writeln!(output, "    {change}");
                }
            }
            output.push('\n');
            for batch in &plan.plan.batches {
                let steps: Vec<String> = batch.steps.iter().map(ToString::to_string).collect();
                let _ = writeln!(output, "Batch {}: {}", batch.index + 1, steps.join(", "));
            }
        }

        let _ = write!(output, "\n{}\n", Self::format_summary(&plan.changes.summary()));
        output
    }

    /// Formats an execution report.
    #[must_use]
    pub fn format_execution(&self, report: &ExecutionReport) -> String {
        match self.format {
            OutputFormat::Json => to_json(&ExecutionJson::from(report)),
            OutputFormat::Text => {
                let status = match report.status {
                    ExecutionStatus::Succeeded => format!("{} Apply complete", "✓".green()),
                    ExecutionStatus::Failed => format!("{} Apply failed", "✗".red()),
                    ExecutionStatus::Cancelled => format!("{} Apply cancelled", "⚠".yellow()),
                };

                let mut output = format!("{status}\n\n");
                let _ = writeln!(output, "   Completed: {}", report.completed.len());
                let _ = writeln!(output, "   Failed: {}", report.failed.len());
                let _ = writeln!(output, "   Not attempted: {}", report.not_attempted.len());
                if let Some(serial) = report.persisted_serial {
                    let _ = writeln!(output, "   State serial: {serial}");
                }

                if !report.tainted.is_empty() {
                    let _ = write!(output, "\n{} Tainted (replaced on next run):\n", "⚠".yellow());
                    for id in &report.tainted {
                        let _ = writeln!(output, "   - {id}");
                    }
                }

                if !report.failed.is_empty() {
                    let _ = write!(output, "\n{} Errors:\n", "⚠".yellow());
                    for failed in &report.failed {
                        let _ = writeln!(output, "   - {}: {}", failed.step, failed.error);
                    }
                }

                if let Some(error) = &report.persist_error {
                    let _ = write!(output, "\n{} State not saved: {error}\n", "✗".red());
                }

                let pending = report.pending_resources();
                if !pending.is_empty() {
                    let _ = write!(output, "\nPending: {}\n", join_ids(&pending));
                }

                output
            }
        }
    }

    /// Formats a drift report.
    #[must_use]
    pub fn format_drift(&self, report: &DriftReport) -> String {
        match self.format {
            OutputFormat::Json => to_json(report),
            OutputFormat::Text => {
                if !report.has_drift {
                    let mut output = format!(
                        "{} No drift detected - live state matches serial {}.\n",
                        "✓".green(),
                        report.serial
                    );
                    if !report.changes.is_empty() {
                        let _ = writeln!(
                            output,
                            "   Desired graph has unapplied changes: {}",
                            report.summary
                        );
                    }
                    return output;
                }

                let mut output = format!("{} Drift detected:\n\n", "⚠".yellow());
                for id in &report.missing {
                    let _ = writeln!(output, "   {} {id}", "missing ".red());
                }
                for id in &report.modified {
                    let _ = writeln!(output, "   {} {id}", "modified".yellow());
                }

                if !report.changes.is_empty() {
                    output.push_str("\nTo converge:\n");
                    for change in &report.changes {
                        let _ = writeln!(
                            output,
                            "   {} {}",
                            Self::format_action(change.action),
                            change.id
                        );
                    }
                }

                let _ = write!(
                    output,
                    "\n{} resources have drifted.\n",
                    report.missing.len() + report.modified.len()
                );
                output
            }
        }
    }

    /// Formats a recorded snapshot and the current lock, if any.
    #[must_use]
    pub fn format_state(&self, snapshot: &StateSnapshot, lock: Option<&LockInfo>) -> String {
        match self.format {
            OutputFormat::Json => to_json(&StateJson { snapshot, lock }),
            OutputFormat::Text => {
                let mut output = String::new();

                let _ = writeln!(output, "\nState: {}", snapshot.lineage);
                let _ = writeln!(output, "   Version: {}", snapshot.version);
                let _ = writeln!(output, "   Serial: {}", snapshot.serial);
                let _ = writeln!(
                    output,
                    "   Revision: {}",
                    snapshot.desired_revision.as_deref().unwrap_or("-")
                );
                let _ = writeln!(output, "   Last updated: {}", snapshot.last_updated);
                let _ = writeln!(output, "   Resources: {}", snapshot.len());
                for deposed in &snapshot.deposed {
                    let _ = writeln!(
                        output,
                        "   {} {} ({}), awaiting delete",
                        "Deposed:".yellow(),
                        deposed.id(),
                        deposed.provider_id
                    );
                }

                match lock {
                    Some(lock) => {
                        let _ = writeln!(
                            output,
                            "   Lock: {} held by {} ({}s left)",
                            lock.lock_id,
                            lock.holder,
                            lock.remaining_secs()
                        );
                    }
                    None => {
                        let _ = writeln!(output, "   Lock: {}", "unlocked".dimmed());
                    }
                }

                if !snapshot.is_empty() {
                    let rows: Vec<ResourceRow> = snapshot
                        .resources
                        .iter()
                        .map(|(id, state)| ResourceRow {
                            resource: id.to_string(),
                            status: Self::format_status(state.status),
                            provider_id: Self::truncate(&state.provider_id, 24),
                            updated: state.updated_at.format("%Y-%m-%d %H:%M").to_string(),
                        })
                        .collect();
                    output.push('\n');
                    output.push_str(&Table::new(rows).to_string());
                    output.push('\n');
                }

                if !snapshot.history.is_empty() {
                    let _ = writeln!(output, "\n   Recent history ({}):", snapshot.history.len());
                    for entry in snapshot.history.iter().rev().take(5) {
                        let status = if entry.success { "✓" } else { "✗" };
                        let _ = writeln!(
                            output,
                            "     {status} {} - {} {} ({})",
                            entry.timestamp.format("%Y-%m-%d %H:%M"),
                            entry.operation,
                            entry.run_id,
                            entry.changed.join(", ")
                        );
                    }
                }

                output
            }
        }
    }

    /// Formats a pipeline run report.
    #[must_use]
    pub fn format_run(&self, report: &RunReport) -> String {
        match self.format {
            OutputFormat::Json => serde_json::to_string(report).unwrap_or_default(),
            OutputFormat::Text => {
                let status = match report.status {
                    RunStatus::Succeeded => "succeeded".green(),
                    RunStatus::NoChanges => "no changes".dimmed(),
                    RunStatus::Failed => "failed".red(),
                    RunStatus::Cancelled => "cancelled".yellow(),
                };
                let mut output = format!(
                    "[{}] {} {} in {}ms: {}",
                    report.finished_at.format("%H:%M:%S"),
                    report.trigger,
                    status,
                    report.duration_ms,
                    report.change_summary
                );
                for error in &report.errors {
                    let _ = write!(output, "\n   {} {error}", "✗".red());
                }
                if !report.pending.is_empty() {
                    let _ = write!(output, "\n   pending: {}", join_ids(&report.pending));
                }
                output
            }
        }
    }

    /// Formats a configuration validation result.
    #[must_use]
    pub fn format_validation(
        &self,
        result: &ValidationResult,
        resources: usize,
        show_warnings: bool,
    ) -> String {
        match self.format {
            OutputFormat::Json => to_json(&ValidationJson {
                valid: result.is_valid(),
                resources,
                errors: result.errors.iter().map(ToString::to_string).collect(),
                warnings: &result.warnings,
            }),
            OutputFormat::Text => {
                let mut output = if result.is_valid() {
                    format!(
                        "{} Configuration is valid ({resources} resources in the desired graph)\n",
                        "✓".green()
                    )
                } else {
                    let mut output = format!("{} Configuration is invalid:\n", "✗".red());
                    for error in &result.errors {
                        let _ = writeln!(output, "   - {error}");
                    }
                    output
                };

                if result.warning_count() > 0 {
                    if show_warnings {
                        let _ = write!(output, "\n{} Warnings:\n", "⚠".yellow());
                        for warning in &result.warnings {
                            let _ = writeln!(output, "   - {warning}");
                        }
                    } else {
                        let _ = writeln!(
                            output,
                            "   {} warnings (use --warnings to show)",
                            result.warning_count()
                        );
                    }
                }

                output
            }
        }
    }

    /// Formats a one-line status message.
    #[must_use]
    pub fn message(&self, level: MessageLevel, message: &str) -> String {
        match self.format {
            OutputFormat::Json => serde_json::json!({ "status": level.as_str(), "message": message })
                .to_string(),
            OutputFormat::Text => {
                let marker = match level {
                    MessageLevel::Success => "✓".green(),
                    MessageLevel::Warning => "⚠".yellow(),
                    MessageLevel::Error => "✗".red(),
                };
                format!("{marker} {message}")
            }
        }
    }

    /// Formats an action with color.
    fn format_action(action: ChangeAction) -> String {
        let label = format!("{} {}", action.symbol(), action);
        match action {
            ChangeAction::Create => label.green().to_string(),
            ChangeAction::Update => label.yellow().to_string(),
            ChangeAction::Delete => label.red().to_string(),
            ChangeAction::Replace(_) => label.magenta().to_string(),
            ChangeAction::NoOp => label.dimmed().to_string(),
        }
    }

    fn format_status(status: ResourceStatus) -> String {
        match status {
            ResourceStatus::Ready => "ready".green().to_string(),
            ResourceStatus::Tainted => "tainted".red().to_string(),
        }
    }

    fn format_summary(summary: &ChangeSummary) -> String {
        format!(
            "Plan: {} to create, {} to update, {} to replace, {} to delete",
            summary.create.to_string().green(),
            summary.update.to_string().yellow(),
            summary.replace.to_string().magenta(),
            summary.delete.to_string().red()
        )
    }

    fn reason(entry: &ChangeEntry) -> String {
        if !entry.replace_reasons.is_empty() {
            return entry.replace_reasons.join(", ");
        }
        entry
            .changes
            .iter()
            .map(|c| c.attribute.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    }

    /// Truncates a string to a maximum number of characters.
    fn truncate(s: &str, max_len: usize) -> String {
        if s.chars().count() <= max_len {
            s.to_string()
        } else {
            let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
            format!("{kept}...")
        }
    }
}

/// Severity of a status message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageLevel {
    /// Operation succeeded.
    Success,
    /// Something needs attention.
    Warning,
    /// Operation failed.
    Error,
}

impl MessageLevel {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Warning => "warning",
            Self::Error => "error",
        }
    }
}

fn to_json(value: &impl Serialize) -> String {
    serde_json::to_string_pretty(value).unwrap_or_default()
}

fn join_ids(ids: &[ResourceId]) -> String {
    ids.iter().map(ToString::to_string).collect::<Vec<_>>().join(", ")
}

// JSON serialization helpers

#[derive(Serialize)]
struct PlanJson<'a> {
    base_serial: u64,
    refreshed: bool,
    summary: ChangeSummary,
    changes: Vec<&'a ChangeEntry>,
    batches: Vec<Vec<String>>,
}

impl<'a> From<&'a ConvergencePlan> for PlanJson<'a> {
    fn from(plan: &'a ConvergencePlan) -> Self {
        Self {
            base_serial: plan.base_serial,
            refreshed: plan.refreshed,
            summary: plan.changes.summary(),
            changes: plan.changes.changes().collect(),
            batches: plan
                .plan
                .batches
                .iter()
                .map(|b| b.steps.iter().map(ToString::to_string).collect())
                .collect(),
        }
    }
}

#[derive(Serialize)]
struct ExecutionJson<'a> {
    status: ExecutionStatus,
    completed: &'a [StepRef],
    failed: &'a [FailedStep],
    not_attempted: &'a [StepRef],
    tainted: &'a [ResourceId],
    changed: Vec<ResourceId>,
    pending: Vec<ResourceId>,
    persisted_serial: Option<u64>,
    persist_error: Option<&'a str>,
}

impl<'a> From<&'a ExecutionReport> for ExecutionJson<'a> {
    fn from(report: &'a ExecutionReport) -> Self {
        Self {
            status: report.status,
            completed: &report.completed,
            failed: &report.failed,
            not_attempted: &report.not_attempted,
            tainted: &report.tainted,
            changed: report.changed_resources(),
            pending: report.pending_resources(),
            persisted_serial: report.persisted_serial,
            persist_error: report.persist_error.as_deref(),
        }
    }
}

#[derive(Serialize)]
struct StateJson<'a> {
    snapshot: &'a StateSnapshot,
    lock: Option<&'a LockInfo>,
}

#[derive(Serialize)]
struct ValidationJson<'a> {
    valid: bool,
    resources: usize,
    errors: Vec<String>,
    warnings: &'a [String],
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::CancelToken;
    use crate::graph::{Resource, ResourceGraph, SchemaRegistry};
    use crate::planner::{PlanExecutor, RunContext};
    use crate::provider::{InMemoryProvider, PollPolicy, Provider, RetryPolicy, StateObserver};
    use crate::reconciler::Converger;
    use crate::state::{LocalStateStore, StateStore};
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::TempDir;

    fn desired() -> ResourceGraph {
        ResourceGraph::from_resources(vec![
            Resource::new("vpc", "main").with_attribute("cidr_block", "10.0.0.0/16"),
            Resource::new("subnet", "a")
                .with_reference("vpc_id", &ResourceId::new("vpc", "main"), "id")
                .with_attribute("cidr_block", "10.0.1.0/24"),
        ])
        .unwrap()
    }

    fn converger(dir: &TempDir) -> Converger {
        let store: Arc<dyn StateStore> = Arc::new(LocalStateStore::with_base_dir(dir.path()));
        let provider: Arc<dyn Provider> = Arc::new(InMemoryProvider::new());
        let executor = PlanExecutor::new(Arc::clone(&provider), Arc::clone(&store))
            .with_retry(RetryPolicy::none())
            .with_poll(PollPolicy::new(
                Duration::from_millis(1),
                Duration::from_millis(2),
                Duration::from_secs(1),
            ));
        Converger::new(
            store,
            StateObserver::new(provider, RetryPolicy::none()),
            executor,
            SchemaRegistry::builtin(),
        )
    }

    #[tokio::test]
    async fn test_plan_text_and_json() {
        let dir = TempDir::new().unwrap();
        let plan = converger(&dir)
            .plan(&desired(), false, &CancelToken::new())
            .await
            .unwrap();

        let text = OutputFormatter::new(OutputFormat::Text).format_plan(&plan, true);
        assert!(text.contains("vpc.main"));
        assert!(text.contains("Batch 2: create subnet.a"));

        let json = OutputFormatter::new(OutputFormat::Json).format_plan(&plan, false);
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["summary"]["create"], 2);
        assert_eq!(value["batches"][0][0], "create vpc.main");
        assert_eq!(value["changes"][1]["id"], "subnet.a");
    }

    #[tokio::test]
    async fn test_execution_and_state_output() {
        let dir = TempDir::new().unwrap();
        let converger = converger(&dir);
        let result = converger
            .converge(&desired(), false, &RunContext::new("run-1", CancelToken::new()))
            .await
            .unwrap();
        let report = result.report.unwrap();

        let text = OutputFormatter::new(OutputFormat::Text).format_execution(&report);
        assert!(text.contains("Completed: 2"));
        assert!(text.contains("State serial: 1"));

        let json = OutputFormatter::new(OutputFormat::Json).format_execution(&report);
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["status"], "succeeded");
        assert_eq!(value["changed"].as_array().unwrap().len(), 2);

        let snapshot = converger.load_baseline().await.unwrap();
        let state = OutputFormatter::new(OutputFormat::Text).format_state(&snapshot, None);
        assert!(state.contains("Serial: 1"));
        assert!(state.contains("subnet.a"));
        assert!(state.contains("run-1"));
    }

    #[tokio::test]
    async fn test_empty_plan_reports_converged() {
        let dir = TempDir::new().unwrap();
        let converger = converger(&dir);
        let ctx = RunContext::new("run", CancelToken::new());
        converger.converge(&desired(), false, &ctx).await.unwrap();

        let plan = converger
            .plan(&desired(), false, &CancelToken::new())
            .await
            .unwrap();
        let text = OutputFormatter::new(OutputFormat::Text).format_plan(&plan, false);
        assert!(text.contains("No changes required"));
    }

    #[test]
    fn test_validation_output() {
        let mut result = ValidationResult::default();
        result.warnings.push(String::from("lock wait is zero"));

        let hidden = OutputFormatter::new(OutputFormat::Text).format_validation(&result, 3, false);
        assert!(hidden.contains("3 resources"));
        assert!(hidden.contains("1 warnings"));

        let json = OutputFormatter::new(OutputFormat::Json).format_validation(&result, 3, true);
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["valid"], true);
        assert_eq!(value["warnings"][0], "lock wait is zero");
    }

    #[test]
    fn test_message_and_truncate() {
        let json = OutputFormatter::new(OutputFormat::Json).message(MessageLevel::Error, "boom");
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["status"], "error");
        assert_eq!(value["message"], "boom");
        assert_eq!(OutputFormatter::truncate("abcdefgh", 6), "abc...");
        assert_eq!(OutputFormatter::truncate("abc", 6), "abc");
    }
}
