//! The pipeline state machine.
//!
//! One trigger is processed at a time. A run loads the desired graph, takes
//! the state lock, plans, applies with a lock heartbeat, releases the lock
//! and reports. Report-only drift checks skip the lock entirely.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::cancel::CancelToken;
use crate::drift::{DriftDetector, DriftPolicy};
use crate::error::TerraceError;
use crate::graph::{ResourceGraph, ResourceId};
use crate::planner::{ChangeSummary, ExecutionStatus, RunContext};
use crate::reconciler::Converger;
use crate::state::{HistoryOperation, LockHeartbeat, LockManager, generate_holder_id};

use super::report::ReportSink;
use super::run::{PipelineRun, RunStatus, Stage, StageName};
use super::trigger::{GraphLoader, TriggerEvent, TriggerKind};

/// Default number of runs kept in memory.
pub const DEFAULT_HISTORY_LIMIT: usize = 50;

/// Pipeline behaviour.
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    /// Lock holder identity.
    pub holder: String,
    /// How long to wait for the state lock.
    pub lock_timeout: Duration,
    /// What drift checks do.
    pub drift_policy: DriftPolicy,
    /// Desired graph checked by drift triggers.
    pub desired_graph_ref: String,
    /// Refresh from live state before every plan.
    pub refresh: bool,
    /// Number of finished runs kept.
    pub history_limit: usize,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            holder: generate_holder_id(),
            lock_timeout: Duration::from_secs(60),
            drift_policy: DriftPolicy::default(),
            desired_graph_ref: String::from("graph.yaml"),
            refresh: false,
            history_limit: DEFAULT_HISTORY_LIMIT,
        }
    }
}

/// Cancels whichever run the machine is processing.
#[derive(Debug, Clone)]
pub struct RunCanceller {
    current: Arc<Mutex<CancelToken>>,
}

impl RunCanceller {
    /// Cancels the current run. Later runs are unaffected.
    pub fn cancel_current(&self) {
        self.current
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .cancel();
    }
}

/// Reacts to triggers by converging the state store.
pub struct PipelineMachine {
    converger: Converger,
    drift: DriftDetector,
    locks: LockManager,
    loader: Arc<dyn GraphLoader>,
    sinks: Vec<Arc<dyn ReportSink>>,
    settings: PipelineSettings,
    stage: watch::Sender<Stage>,
    history: VecDeque<PipelineRun>,
    current: Arc<Mutex<CancelToken>>,
}

impl std::fmt::Debug for PipelineMachine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineMachine")
            .field("converger", &self.converger)
            .field("locks", &self.locks)
            .field("settings", &self.settings)
            .field("stage", &*self.stage.borrow())
            .field("history", &self.history.len())
            .finish_non_exhaustive()
    }
}

impl PipelineMachine {
    /// Creates a machine.
    #[must_use]
    pub fn new(
        converger: Converger,
        locks: LockManager,
        loader: Arc<dyn GraphLoader>,
        settings: PipelineSettings,
    ) -> Self {
        let (stage, _) = watch::channel(Stage::Idle);
        Self {
            drift: DriftDetector::new(converger.clone()),
            converger,
            locks,
            loader,
            sinks: Vec::new(),
            settings,
            stage,
            history: VecDeque::new(),
            current: Arc::new(Mutex::new(CancelToken::new())),
        }
    }

    /// Adds a report sink.
    #[must_use]
    pub fn with_sink(mut self, sink: Arc<dyn ReportSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    /// Current stage.
    #[must_use]
    pub fn stage(&self) -> Stage {
        *self.stage.borrow()
    }

    /// Watches stage changes.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<Stage> {
        self.stage.subscribe()
    }

    /// Handle that cancels the run in progress.
    #[must_use]
    pub fn canceller(&self) -> RunCanceller {
        RunCanceller {
            current: Arc::clone(&self.current),
        }
    }

    /// Finished runs, oldest first.
    pub fn history(&self) -> impl Iterator<Item = &PipelineRun> {
        self.history.iter()
    }

    /// The most recent finished run.
    #[must_use]
    pub fn last_run(&self) -> Option<&PipelineRun> {
        self.history.back()
    }

    /// Processes triggers until the channel closes or `shutdown` fires.
    ///
    /// A shutdown signal stops the loop after the run in progress.
    pub async fn run(&mut self, mut triggers: mpsc::Receiver<TriggerEvent>, shutdown: CancelToken) {
        info!("Pipeline started");
        loop {
            tokio::select! {
                biased;
                () = shutdown.cancelled() => {
                    info!("Pipeline shutting down");
                    break;
                }
                event = triggers.recv() => match event {
                    Some(event) => {
                        self.process(event).await;
                    }
                    None => {
                        info!("Trigger channel closed");
                        break;
                    }
                },
            }
        }
    }

    /// Processes one trigger to a terminal outcome.
    pub async fn process(&mut self, event: TriggerEvent) -> PipelineRun {
        let cancel = CancelToken::new();
        *self.current.lock().unwrap_or_else(PoisonError::into_inner) = cancel.clone();

        let mut run = PipelineRun::new(event);
        self.stage.send_replace(Stage::Triggered);
        info!("Run {} started by {}", run.run_id, run.trigger);

        let status = self.drive(&mut run, &cancel).await;
        self.advance(&mut run, status.into());
        self.stage.send_replace(Stage::Idle);

        self.record(run.clone()).await;
        run
    }

    /// Runs every stage and returns the terminal status.
    async fn drive(&self, run: &mut PipelineRun, cancel: &CancelToken) -> RunStatus {
        let reference = match &run.trigger.kind {
            TriggerKind::Revision { desired_graph_ref } => desired_graph_ref.clone(),
            TriggerKind::DriftCheck => self.settings.desired_graph_ref.clone(),
        };

        let desired = match self.load_source(&reference).await {
            Ok(graph) => {
                self.note(run, StageName::Source, true, Some(format!("{} resources", graph.len())));
                graph
            }
            Err(e) => {
                self.note(run, StageName::Source, false, Some(e.to_string()));
                return RunStatus::Failed;
            }
        };

        if cancel.is_cancelled() {
            return RunStatus::Cancelled;
        }

        let remediate = run.trigger.is_drift_check();
        if remediate && self.settings.drift_policy == DriftPolicy::ReportOnly {
            return self.check_drift(run, &desired, cancel).await;
        }

        self.advance(run, Stage::Locking);
        let lock = match self
            .locks
            .acquire(&self.settings.holder, self.settings.lock_timeout, cancel)
            .await
        {
            Ok(lock) => {
                self.note(run, StageName::Lock, true, Some(format!("lock {}", lock.lock_id)));
                lock
            }
            Err(e) => {
                let status = failure_status(&e);
                self.note(run, StageName::Lock, false, Some(e.to_string()));
                return status;
            }
        };

        let heartbeat = self.locks.start_heartbeat(lock);
        let status = self.converge_locked(run, &desired, remediate, &heartbeat, cancel).await;

        if heartbeat.is_lost() {
            warn!("State lock was lost during run {}", run.run_id);
            self.error(run, "state lock was lost during the run");
        }
        let lock = heartbeat.stop().await;
        match self.locks.release(&lock).await {
            Ok(()) => debug!("Released state lock {}", lock.lock_id),
            Err(e) => {
                warn!("Failed to release state lock {}: {e}", lock.lock_id);
                self.error(run, format!("failed to release state lock: {e}"));
            }
        }

        status
    }

    /// Planning and applying while holding the lock.
    async fn converge_locked(
        &self,
        run: &mut PipelineRun,
        desired: &ResourceGraph,
        remediate: bool,
        heartbeat: &LockHeartbeat,
        cancel: &CancelToken,
    ) -> RunStatus {
        self.advance(run, Stage::Planning);
        let refresh = self.settings.refresh || remediate;
        let planned = match self.converger.plan(desired, refresh, cancel).await {
            Ok(planned) => planned,
            Err(e) => {
                let status = failure_status(&e);
                self.note(run, StageName::Plan, false, Some(e.to_string()));
                return status;
            }
        };

        let summary = planned.plan.summary;
        self.note(run, StageName::Plan, true, Some(summary.to_string()));
        if !planned.has_changes() {
            self.changes(run, summary, Vec::new(), Vec::new());
            info!("Run {}: no changes", run.run_id);
            return RunStatus::NoChanges;
        }

        if cancel.is_cancelled() {
            return RunStatus::Cancelled;
        }

        self.advance(run, Stage::Applying);
        let operation = if remediate {
            HistoryOperation::Remediate
        } else {
            HistoryOperation::Apply
        };
        let ctx = RunContext::new(run.run_id.clone(), cancel.clone())
            .with_revision(Some(run.trigger.revision_id.clone()))
            .with_operation(operation)
            .with_lock(heartbeat.current());

        let report = self.converger.apply(planned, &ctx).await;
        self.changes(run, summary, report.changed_resources(), report.pending_resources());

        for failed in &report.failed {
            self.error(run, format!("{}: {}", failed.step, failed.error));
        }
        if let Some(persist_error) = &report.persist_error {
            self.error(run, format!("state not persisted: {persist_error}"));
        }
        let message = report.to_string();
        let status = match report.status {
            ExecutionStatus::Succeeded => RunStatus::Succeeded,
            ExecutionStatus::Failed => RunStatus::Failed,
            ExecutionStatus::Cancelled => RunStatus::Cancelled,
        };
        self.note(run, StageName::Apply, status == RunStatus::Succeeded, None);
        debug!("{message}");

        status
    }

    /// Report-only drift check: read only, no lock.
    async fn check_drift(&self, run: &mut PipelineRun, desired: &ResourceGraph, cancel: &CancelToken) -> RunStatus {
        self.advance(run, Stage::Planning);
        match self.drift.detect(desired, cancel).await {
            Ok(report) => {
                let has_drift = report.has_drift;
                self.note(run, StageName::Plan, true, Some(report.summary.to_string()));
                if let Err(e) = run.attach_drift(report) {
                    warn!("{e}");
                }
                if has_drift {
                    RunStatus::Succeeded
                } else {
                    RunStatus::NoChanges
                }
            }
            Err(e) => {
                let status = failure_status(&e);
                self.note(run, StageName::Plan, false, Some(e.to_string()));
                status
            }
        }
    }

    async fn load_source(&self, reference: &str) -> crate::error::Result<ResourceGraph> {
        let graph = self.loader.load(reference).await?;
        self.converger.validate(&graph)?;
        Ok(graph)
    }

    fn advance(&self, run: &mut PipelineRun, next: Stage) {
        match run.transition(next) {
            Ok(()) => {
                self.stage.send_replace(next);
            }
            Err(e) => error!("{e}"),
        }
    }

    fn note(&self, run: &mut PipelineRun, stage: StageName, success: bool, message: Option<String>) {
        if let Err(e) = run.record_stage(stage, success, message) {
            warn!("{e}");
        }
    }

    fn error(&self, run: &mut PipelineRun, error: impl std::fmt::Display) {
        if let Err(e) = run.record_error(error) {
            warn!("{e}");
        }
    }

    fn changes(
        &self,
        run: &mut PipelineRun,
        summary: ChangeSummary,
        changed: Vec<ResourceId>,
        pending: Vec<ResourceId>,
    ) {
        if let Err(e) = run.record_changes(summary, changed, pending) {
            warn!("{e}");
        }
    }

    /// Keeps the run in bounded history and emits it to every sink.
    async fn record(&mut self, run: PipelineRun) {
        if let Some(report) = run.report() {
            for sink in &self.sinks {
                if let Err(e) = sink.emit(&report).await {
                    warn!("Report sink {} failed: {e}", sink.name());
                }
            }
        }

        self.history.push_back(run);
        while self.history.len() > self.settings.history_limit.max(1) {
            self.history.pop_front();
        }
    }
}

/// Cancellation errors end a run as cancelled, everything else as failed.
const fn failure_status(error: &TerraceError) -> RunStatus {
    if error.is_cancellation() {
        RunStatus::Cancelled
    } else {
        RunStatus::Failed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::SchemaRegistry;
    use crate::pipeline::{FileGraphLoader, MemorySink};
    use crate::planner::PlanExecutor;
    use crate::provider::{InMemoryProvider, OperationKind, PollPolicy, Provider, RetryPolicy, StateObserver};
    use crate::state::{LocalStateStore, StateStore};
    use tempfile::TempDir;

    const GRAPH: &str = r"
resources:
  - id: vpc.main
    attributes:
      cidr_block: 10.0.0.0/16
  - id: subnet.a
    attributes:
      cidr_block: 10.0.1.0/24
      vpc_id: { $ref: vpc.main, attribute: id }
  - id: instance.web
    attributes:
      ami: ami-1
      instance_type: t3.small
      subnet_id: { $ref: subnet.a, attribute: id }
";

    struct Fixture {
        dir: TempDir,
        provider: InMemoryProvider,
        store: Arc<dyn StateStore>,
        sink: MemorySink,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = TempDir::new().expect("temp dir");
            std::fs::write(dir.path().join("graph.yaml"), GRAPH).expect("write graph");
            let store: Arc<dyn StateStore> = Arc::new(LocalStateStore::with_base_dir(dir.path()));
            Self {
                dir,
                provider: InMemoryProvider::new(),
                store,
                sink: MemorySink::new(),
            }
        }

        fn machine(&self, settings: PipelineSettings) -> PipelineMachine {
            let provider: Arc<dyn Provider> = Arc::new(self.provider.clone());
            let executor = PlanExecutor::new(Arc::clone(&provider), Arc::clone(&self.store))
                .with_retry(RetryPolicy::none())
                .with_poll(PollPolicy::new(
                    Duration::from_millis(1),
                    Duration::from_millis(2),
                    Duration::from_secs(1),
                ));
            let converger = Converger::new(
                Arc::clone(&self.store),
                StateObserver::new(provider, RetryPolicy::none()),
                executor,
                SchemaRegistry::builtin(),
            );
            let locks = LockManager::new(Arc::clone(&self.store))
                .with_poll_interval(Duration::from_millis(10));
            let loader = Arc::new(FileGraphLoader::new().with_base_path(self.dir.path()));
            PipelineMachine::new(converger, locks, loader, settings)
                .with_sink(Arc::new(self.sink.clone()))
        }

        fn settings() -> PipelineSettings {
            PipelineSettings {
                holder: String::from("pipeline-test"),
                lock_timeout: Duration::ZERO,
                ..PipelineSettings::default()
            }
        }
    }

    fn stages(run: &PipelineRun) -> Vec<Stage> {
        run.transitions.iter().map(|t| t.stage).collect()
    }

    #[tokio::test]
    async fn test_revision_converges_and_releases_lock() {
        let fx = Fixture::new();
        let mut machine = fx.machine(Fixture::settings());

        let run = machine.process(TriggerEvent::revision("r1", "graph.yaml")).await;
        assert_eq!(run.status(), Some(RunStatus::Succeeded), "errors: {:?}", run.errors);
        assert_eq!(
            stages(&run),
            vec![
                Stage::Triggered,
                Stage::Locking,
                Stage::Planning,
                Stage::Applying,
                Stage::Succeeded
            ]
        );
        assert_eq!(run.summary.create, 3);
        assert_eq!(run.changed.len(), 3);
        assert!(run.pending.is_empty());
        assert_eq!(machine.stage(), Stage::Idle);

        assert!(fx.store.get_lock_info().await.expect("lock info").is_none());
        let snapshot = fx.store.load().await.expect("load").expect("snapshot");
        assert_eq!(snapshot.serial, 1);
        assert_eq!(snapshot.desired_revision.as_deref(), Some("r1"));
        assert_eq!(fx.sink.reports().len(), 1);
    }

    #[tokio::test]
    async fn test_unchanged_revision_is_no_changes() {
        let fx = Fixture::new();
        let mut machine = fx.machine(Fixture::settings());
        machine.process(TriggerEvent::revision("r1", "graph.yaml")).await;

        let run = machine.process(TriggerEvent::revision("r2", "graph.yaml")).await;
        assert_eq!(run.status(), Some(RunStatus::NoChanges));
        assert!(!stages(&run).contains(&Stage::Applying));
        assert_eq!(run.summary.no_op, 3);
        assert!(fx.store.get_lock_info().await.expect("lock info").is_none());
    }

    #[tokio::test]
    async fn test_missing_source_fails_without_lock() {
        let fx = Fixture::new();
        let mut machine = fx.machine(Fixture::settings());

        let run = machine.process(TriggerEvent::revision("r1", "absent.yaml")).await;
        assert_eq!(run.status(), Some(RunStatus::Failed));
        assert_eq!(stages(&run), vec![Stage::Triggered, Stage::Failed]);
        assert!(run.errors[0].contains("absent.yaml"));
        assert!(fx.provider.calls().is_empty());
    }

    #[tokio::test]
    async fn test_held_lock_fails_run() {
        let fx = Fixture::new();
        let other = fx
            .store
            .acquire_lock("someone-else", Duration::from_secs(300))
            .await
            .expect("foreign lock");
        let mut machine = fx.machine(Fixture::settings());

        let run = machine.process(TriggerEvent::revision("r1", "graph.yaml")).await;
        assert_eq!(run.status(), Some(RunStatus::Failed));
        assert_eq!(stages(&run), vec![Stage::Triggered, Stage::Locking, Stage::Failed]);
        assert!(run.errors[0].contains("someone-else"));
        assert!(fx.provider.calls().is_empty());

        let still = fx.store.get_lock_info().await.expect("lock info").expect("held");
        assert_eq!(still.lock_id, other.lock_id);
    }

    #[tokio::test]
    async fn test_report_only_drift_check() {
        let fx = Fixture::new();
        let mut machine = fx.machine(Fixture::settings());
        machine.process(TriggerEvent::revision("r1", "graph.yaml")).await;

        let clean = machine.process(TriggerEvent::drift_check()).await;
        assert_eq!(clean.status(), Some(RunStatus::NoChanges));

        let subnet = ResourceId::new("subnet", "a");
        let pid = fx.provider.provider_ids_for(&subnet).pop().expect("subnet");
        assert!(fx.provider.remove_out_of_band(&pid));

        let run = machine.process(TriggerEvent::drift_check()).await;
        assert_eq!(run.status(), Some(RunStatus::Succeeded));
        assert_eq!(stages(&run), vec![Stage::Triggered, Stage::Planning, Stage::Succeeded]);
        let drift = run.drift.as_ref().expect("drift report");
        assert!(drift.has_drift);
        assert_eq!(drift.missing, vec![subnet.clone()]);
        assert_eq!(run.summary.create, 1);

        // Nothing was recreated and the stored serial is untouched.
        assert_eq!(fx.provider.calls_of(OperationKind::Create).len(), 3);
        assert_eq!(fx.store.load().await.expect("load").expect("snapshot").serial, 1);
    }

    #[tokio::test]
    async fn test_auto_remediate_recreates_missing_resource() {
        let fx = Fixture::new();
        let settings = PipelineSettings {
            drift_policy: DriftPolicy::AutoRemediate,
            ..Fixture::settings()
        };
        let mut machine = fx.machine(settings);
        machine.process(TriggerEvent::revision("r1", "graph.yaml")).await;

        let subnet = ResourceId::new("subnet", "a");
        let pid = fx.provider.provider_ids_for(&subnet).pop().expect("subnet");
        assert!(fx.provider.remove_out_of_band(&pid));

        let run = machine.process(TriggerEvent::drift_check()).await;
        assert_eq!(run.status(), Some(RunStatus::Succeeded), "errors: {:?}", run.errors);
        assert_eq!(run.summary.create, 1);
        assert_eq!(run.summary.update, 1);

        let snapshot = fx.store.load().await.expect("load").expect("snapshot");
        assert_eq!(snapshot.serial, 2);
        assert_eq!(
            snapshot.history.last().map(|h| h.operation),
            Some(HistoryOperation::Remediate)
        );
    }

    #[tokio::test]
    async fn test_failed_apply_reports_pending() {
        let fx = Fixture::new();
        fx.provider.fail_next(
            OperationKind::Create,
            &ResourceId::new("subnet", "a"),
            crate::error::ProviderError::permanent("quota exceeded"),
        );
        let mut machine = fx.machine(Fixture::settings());

        let run = machine.process(TriggerEvent::revision("r1", "graph.yaml")).await;
        assert_eq!(run.status(), Some(RunStatus::Failed));
        assert_eq!(run.changed, vec![ResourceId::new("vpc", "main")]);
        assert!(run.pending.contains(&ResourceId::new("instance", "web")));
        assert!(run.errors.iter().any(|e| e.contains("quota exceeded")));
        assert!(fx.store.get_lock_info().await.expect("lock info").is_none());

        let report = &fx.sink.reports()[0];
        assert_eq!(report.status, RunStatus::Failed);
    }

    #[tokio::test]
    async fn test_cancel_current_run() {
        let fx = Fixture::new();
        let provider = fx.provider.clone().with_latency(Duration::from_millis(200));
        let fx = Fixture { provider, ..fx };
        let mut machine = fx.machine(Fixture::settings());
        let canceller = machine.canceller();

        let handle = tokio::spawn(async move {
            machine.process(TriggerEvent::revision("r1", "graph.yaml")).await
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        canceller.cancel_current();

        let run = handle.await.expect("run task");
        assert_eq!(run.status(), Some(RunStatus::Cancelled));
        assert!(fx.store.get_lock_info().await.expect("lock info").is_none());
        let snapshot = fx.store.load().await.expect("load").expect("partial snapshot");
        assert_eq!(snapshot.len(), 1);
    }

    #[tokio::test]
    async fn test_run_loop_queues_and_bounds_history() {
        let fx = Fixture::new();
        let settings = PipelineSettings {
            history_limit: 2,
            ..Fixture::settings()
        };
        let mut machine = fx.machine(settings);

        let (tx, rx) = mpsc::channel(8);
        for i in 0..3 {
            tx.send(TriggerEvent::revision(format!("r{i}"), "graph.yaml"))
                .await
                .expect("send");
        }
        drop(tx);

        machine.run(rx, CancelToken::new()).await;
        let statuses: Vec<Option<RunStatus>> = machine.history().map(PipelineRun::status).collect();
        assert_eq!(statuses, vec![Some(RunStatus::NoChanges), Some(RunStatus::NoChanges)]);
        assert_eq!(fx.sink.reports().len(), 3);
        assert_eq!(machine.last_run().map(|r| r.trigger.revision_id.as_str()), Some("r2"));
    }

    #[tokio::test]
    async fn test_shutdown_stops_loop() {
        let fx = Fixture::new();
        let mut machine = fx.machine(Fixture::settings());
        let (tx, rx) = mpsc::channel(8);
        tx.send(TriggerEvent::revision("r1", "graph.yaml")).await.expect("send");

        let shutdown = CancelToken::new();
        shutdown.cancel();
        machine.run(rx, shutdown).await;
        assert_eq!(machine.history().count(), 0);
    }
}
