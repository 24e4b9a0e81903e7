//! Report sinks for finished runs.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};

use crate::error::{PipelineError, Result};

use super::run::{RunReport, RunStatus};

/// Receives a report for every finished run.
#[async_trait]
pub trait ReportSink: Send + Sync {
    /// Sink name used in logs and errors.
    fn name(&self) -> &str;

    /// Emits one report.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::ReportFailed`] if the report cannot be delivered.
    async fn emit(&self, report: &RunReport) -> Result<()>;
}

/// Logs run reports through `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

#[async_trait]
impl ReportSink for TracingSink {
    fn name(&self) -> &str {
        "tracing"
    }

    async fn emit(&self, report: &RunReport) -> Result<()> {
        match report.status {
            RunStatus::Failed | RunStatus::Cancelled => warn!("{report}"),
            RunStatus::Succeeded | RunStatus::NoChanges => info!("{report}"),
        }
        Ok(())
    }
}

/// Appends run reports to a JSON-lines file.
#[derive(Debug, Clone)]
pub struct JsonLinesSink {
    path: PathBuf,
}

impl JsonLinesSink {
    /// Creates a sink appending to `path`.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Default report file in the user's data directory.
    #[must_use]
    pub fn default_path() -> Option<PathBuf> {
        dirs::data_local_dir().map(|dir| dir.join("terrace").join("runs.jsonl"))
    }

    /// Gets the report file path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn failed(&self, message: impl std::fmt::Display) -> PipelineError {
        PipelineError::ReportFailed {
            sink: format!("jsonl:{}", self.path.display()),
            message: message.to_string(),
        }
    }
}

#[async_trait]
impl ReportSink for JsonLinesSink {
    fn name(&self) -> &str {
        "jsonl"
    }

    async fn emit(&self, report: &RunReport) -> Result<()> {
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| self.failed(e))?;
        }

        let mut line = serde_json::to_string(report).map_err(|e| self.failed(e))?;
        line.push('\n');

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(|e| self.failed(e))?;
        file.write_all(line.as_bytes())
            .await
            .map_err(|e| self.failed(e))?;
        file.flush().await.map_err(|e| self.failed(e))?;
        Ok(())
    }
}

/// Keeps run reports in memory.
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    reports: Arc<Mutex<Vec<RunReport>>>,
}

impl MemorySink {
    /// Creates an empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Reports received so far.
    #[must_use]
    pub fn reports(&self) -> Vec<RunReport> {
        self.reports
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl ReportSink for MemorySink {
    fn name(&self) -> &str {
        "memory"
    }

    async fn emit(&self, report: &RunReport) -> Result<()> {
        self.reports
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(report.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::{PipelineRun, Stage, TriggerEvent};
    use tempfile::TempDir;

    fn finished() -> RunReport {
        let mut run = PipelineRun::new(TriggerEvent::revision("r1", "graph.yaml"));
        run.transition(Stage::Planning).expect("plan");
        run.transition(Stage::NoChanges).expect("finish");
        run.report().expect("terminal")
    }

    #[tokio::test]
    async fn test_jsonl_appends_one_line_per_report() {
        let dir = TempDir::new().expect("temp dir");
        let sink = JsonLinesSink::new(dir.path().join("nested").join("runs.jsonl"));

        sink.emit(&finished()).await.expect("emit");
        sink.emit(&finished()).await.expect("emit");

        let content = std::fs::read_to_string(sink.path()).expect("read");
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        let first: serde_json::Value = serde_json::from_str(lines[0]).expect("json");
        assert_eq!(first["status"], "no-changes");
        assert_eq!(first["change_summary"]["create"], 0);
    }

    #[tokio::test]
    async fn test_jsonl_unwritable_path_fails() {
        let dir = TempDir::new().expect("temp dir");
        let blocker = dir.path().join("file");
        std::fs::write(&blocker, "x").expect("write");

        let sink = JsonLinesSink::new(blocker.join("runs.jsonl"));
        let err = sink.emit(&finished()).await.expect_err("parent is a file");
        assert!(err.to_string().contains("report sink"));
    }

    #[tokio::test]
    async fn test_memory_and_tracing_sinks() {
        let memory = MemorySink::new();
        let report = finished();
        memory.emit(&report).await.expect("emit");
        TracingSink.emit(&report).await.expect("emit");

        let stored = memory.reports();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].run_id, report.run_id);
    }
}
