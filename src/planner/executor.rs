//! Plan executor.
//!
//! Applies an execution plan batch by batch through the provider. Steps of a
//! batch run concurrently under a semaphore; results are folded into a
//! working snapshot one resource at a time, and the snapshot is always
//! persisted, whether the run succeeds, fails or is cancelled.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::cancel::CancelToken;
use crate::error::{PlanError, ProviderError};
use crate::graph::{AttributeRef, AttributeValue, GraphHasher, ResourceId};
use crate::provider::{
    Completion, PendingOperation, PollPolicy, Provider, ProvisionedResource, ResolvedResource,
    RetryPolicy,
};
use crate::state::{
    HistoryEntry, HistoryOperation, LockInfo, ResourceState, ResourceStatus, StateSnapshot,
    StateStore,
};

use super::plan::{Batch, ExecutionPlan, PlanStep, StepKind};

/// Default number of provider calls in flight.
pub const DEFAULT_MAX_CONCURRENCY: usize = 8;

/// Applies execution plans.
#[derive(Clone)]
pub struct PlanExecutor {
    provider: Arc<dyn Provider>,
    store: Arc<dyn StateStore>,
    retry: RetryPolicy,
    poll: PollPolicy,
    max_concurrency: usize,
    checkpoint_each_batch: bool,
}

/// Per-run inputs to the executor.
#[derive(Debug, Clone)]
pub struct RunContext {
    /// Identifier recorded in the snapshot history.
    pub run_id: String,
    /// Desired revision being applied.
    pub revision: Option<String>,
    /// Kind of run recorded in the history.
    pub operation: HistoryOperation,
    /// Lock the snapshot is stamped with.
    pub lock: Option<LockInfo>,
    /// Cancellation token for the run.
    pub cancel: CancelToken,
}

/// Overall outcome of an execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    /// Every step completed and the snapshot was persisted.
    Succeeded,
    /// A step failed or the snapshot could not be persisted.
    Failed,
    /// The run was cancelled before every step ran.
    Cancelled,
}

/// Reference to a plan step.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StepRef {
    /// Resource identity.
    pub id: ResourceId,
    /// Step kind.
    pub kind: StepKind,
}

/// A step that did not complete.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedStep {
    /// The step.
    pub step: StepRef,
    /// Why it failed.
    pub error: String,
}

/// What an execution did.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionReport {
    /// Overall outcome.
    pub status: ExecutionStatus,
    /// Steps that completed, in completion order.
    pub completed: Vec<StepRef>,
    /// Steps that failed.
    pub failed: Vec<FailedStep>,
    /// Steps never dispatched.
    pub not_attempted: Vec<StepRef>,
    /// Resources recorded as tainted by this run.
    pub tainted: Vec<ResourceId>,
    /// Serial of the last snapshot written.
    pub persisted_serial: Option<u64>,
    /// Why the final write failed, if it did.
    pub persist_error: Option<String>,
    /// The working snapshot at the end of the run.
    #[serde(skip)]
    pub snapshot: StateSnapshot,
}

/// Result of dispatching one step.
#[derive(Debug)]
enum StepOutcome {
    Provisioned(ProvisionedResource),
    Deleted,
    Failed {
        error: String,
        provider_id: Option<String>,
    },
}

/// A dispatched step and its outcome.
struct StepResult {
    position: usize,
    resolved: Option<ResolvedResource>,
    outcome: StepOutcome,
}

impl fmt::Debug for PlanExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PlanExecutor")
            .field("backend", &self.store.backend_type())
            .field("retry", &self.retry)
            .field("poll", &self.poll)
            .field("max_concurrency", &self.max_concurrency)
            .field("checkpoint_each_batch", &self.checkpoint_each_batch)
            .finish_non_exhaustive()
    }
}

impl RunContext {
    /// Creates a context for an apply run.
    #[must_use]
    pub fn new(run_id: impl Into<String>, cancel: CancelToken) -> Self {
        Self {
            run_id: run_id.into(),
            revision: None,
            operation: HistoryOperation::Apply,
            lock: None,
            cancel,
        }
    }

    /// Sets the desired revision.
    #[must_use]
    pub fn with_revision(mut self, revision: Option<String>) -> Self {
        self.revision = revision;
        self
    }

    /// Sets the history operation.
    #[must_use]
    pub const fn with_operation(mut self, operation: HistoryOperation) -> Self {
        self.operation = operation;
        self
    }

    /// Sets the lock the snapshot is stamped with.
    #[must_use]
    pub fn with_lock(mut self, lock: LockInfo) -> Self {
        self.lock = Some(lock);
        self
    }
}

impl PlanExecutor {
    /// Creates a new executor.
    #[must_use]
    pub fn new(provider: Arc<dyn Provider>, store: Arc<dyn StateStore>) -> Self {
        Self {
            provider,
            store,
            retry: RetryPolicy::default(),
            poll: PollPolicy::default(),
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
            checkpoint_each_batch: false,
        }
    }

    /// Sets the retry policy for provider calls.
    #[must_use]
    pub const fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Sets the polling policy for pending operations.
    #[must_use]
    pub const fn with_poll(mut self, poll: PollPolicy) -> Self {
        self.poll = poll;
        self
    }

    /// Sets the maximum number of concurrent provider calls.
    #[must_use]
    pub const fn with_max_concurrency(mut self, max_concurrency: usize) -> Self {
        self.max_concurrency = max_concurrency;
        self
    }

    /// Sets whether the snapshot is written after every batch.
    #[must_use]
    pub const fn with_checkpoint_each_batch(mut self, checkpoint_each_batch: bool) -> Self {
        self.checkpoint_each_batch = checkpoint_each_batch;
        self
    }

    /// Executes `plan` starting from `baseline`, the snapshot it was planned
    /// against.
    ///
    /// Never returns early: failures and cancellation stop dispatching, let
    /// in-flight steps finish, and still persist what completed.
    pub async fn execute(
        &self,
        plan: &ExecutionPlan,
        baseline: StateSnapshot,
        ctx: &RunContext,
    ) -> ExecutionReport {
        info!(
            "Executing plan with {} steps in {} batches",
            plan.step_count(),
            plan.batches.len()
        );

        let hasher = GraphHasher::new();
        let semaphore = Arc::new(Semaphore::new(self.max_concurrency.max(1)));
        let mut expected_serial = baseline.serial;
        let mut report = ExecutionReport {
            status: ExecutionStatus::Succeeded,
            completed: Vec::new(),
            failed: Vec::new(),
            not_attempted: Vec::new(),
            tainted: Vec::new(),
            persisted_serial: None,
            persist_error: None,
            snapshot: baseline,
        };
        let mut stopped: Option<ExecutionStatus> = None;
        let last_batch = plan.batches.len().saturating_sub(1);

        for batch in &plan.batches {
            if stopped.is_none() && ctx.cancel.is_cancelled() {
                warn!("Run {} cancelled before batch {}", ctx.run_id, batch.index + 1);
                stopped = Some(ExecutionStatus::Cancelled);
            }
            if stopped.is_some() {
                report
                    .not_attempted
                    .extend(batch.steps.iter().map(StepRef::from));
                continue;
            }

            info!(
                "Batch {}/{}: {} steps",
                batch.index + 1,
                plan.batches.len(),
                batch.steps.len()
            );
            let results = self.run_batch(batch, &report.snapshot, &semaphore, &ctx.cancel).await;

            let mut batch_failed = false;
            for result in results {
                let step = &batch.steps[result.position];
                batch_failed |= !apply_result(&mut report, step, result, &hasher);
            }

            if batch_failed {
                stopped = Some(if ctx.cancel.is_cancelled() {
                    ExecutionStatus::Cancelled
                } else {
                    ExecutionStatus::Failed
                });
            } else if self.checkpoint_each_batch && batch.index < last_batch {
                if let Err(e) = self.persist(&mut report, &mut expected_serial, ctx).await {
                    error!("Checkpoint after batch {} failed: {}", batch.index + 1, e);
                    report.persist_error = Some(e.to_string());
                    stopped = Some(ExecutionStatus::Failed);
                }
            }
        }

        report.status = stopped.unwrap_or(ExecutionStatus::Succeeded);
        self.finish(&mut report, &mut expected_serial, ctx).await;
        info!("{report}");
        report
    }

    /// Dispatches every step of a batch and waits for all of them.
    async fn run_batch(
        &self,
        batch: &Batch,
        working: &StateSnapshot,
        semaphore: &Arc<Semaphore>,
        cancel: &CancelToken,
    ) -> Vec<StepResult> {
        let mut tasks = JoinSet::new();
        let mut results: Vec<Option<StepResult>> = batch.steps.iter().map(|_| None).collect();

        for (position, step) in batch.steps.iter().enumerate() {
            let resolved = match resolve_step(step, working) {
                Ok(resolved) => resolved,
                Err(e) => {
                    results[position] = Some(StepResult {
                        position,
                        resolved: None,
                        outcome: StepOutcome::Failed {
                            error: e.to_string(),
                            provider_id: None,
                        },
                    });
                    continue;
                }
            };

            let provider = Arc::clone(&self.provider);
            let semaphore = Arc::clone(semaphore);
            let cancel = cancel.clone();
            let retry = self.retry;
            let poll = self.poll;
            let step = step.clone();

            tasks.spawn(async move {
                let outcome = match semaphore.acquire_owned().await {
                    Ok(permit) => {
                        let outcome =
                            dispatch(provider.as_ref(), &retry, &poll, &step, resolved.as_ref(), &cancel).await;
                        drop(permit);
                        outcome
                    }
                    Err(e) => StepOutcome::Failed {
                        error: e.to_string(),
                        provider_id: None,
                    },
                };
                StepResult {
                    position,
                    resolved,
                    outcome,
                }
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(result) => {
                    let position = result.position;
                    results[position] = Some(result);
                }
                Err(e) => error!("Step task aborted: {}", e),
            }
        }

        results
            .into_iter()
            .enumerate()
            .map(|(position, result)| {
                result.unwrap_or(StepResult {
                    position,
                    resolved: None,
                    outcome: StepOutcome::Failed {
                        error: String::from("step task aborted"),
                        provider_id: None,
                    },
                })
            })
            .collect()
    }

    /// Records history and writes the final snapshot.
    async fn finish(&self, report: &mut ExecutionReport, expected_serial: &mut u64, ctx: &RunContext) {
        let changed: Vec<String> = report.changed_resources().iter().map(ToString::to_string).collect();
        let mut entry = HistoryEntry::new(&ctx.run_id, ctx.operation, ctx.revision.clone(), changed);
        match report.status {
            ExecutionStatus::Succeeded => {}
            ExecutionStatus::Failed => {
                let message = report.failed.first().map_or_else(
                    || String::from("execution failed"),
                    |f| format!("{}: {}", f.step, f.error),
                );
                entry = entry.with_error(message);
            }
            ExecutionStatus::Cancelled => entry = entry.with_error("cancelled"),
        }
        report.snapshot.add_history(entry);

        if let Err(e) = self.persist(report, expected_serial, ctx).await {
            error!("Failed to persist state after run {}: {}", ctx.run_id, e);
            report.persist_error = Some(e.to_string());
            if report.status == ExecutionStatus::Succeeded {
                report.status = ExecutionStatus::Failed;
            }
        }
    }

    /// Writes the working snapshot with the next serial.
    async fn persist(
        &self,
        report: &mut ExecutionReport,
        expected_serial: &mut u64,
        ctx: &RunContext,
    ) -> crate::error::Result<()> {
        let snapshot = &mut report.snapshot;
        let next = *expected_serial + 1;

        snapshot.serial = next;
        snapshot.lock.clone_from(&ctx.lock);
        if ctx.revision.is_some() {
            snapshot.desired_revision.clone_from(&ctx.revision);
        }
        snapshot.last_updated = chrono::Utc::now();

        if let Err(e) = self.store.save(snapshot, *expected_serial).await {
            snapshot.serial = *expected_serial;
            return Err(e);
        }

        *expected_serial = next;
        report.persisted_serial = Some(next);
        info!("Persisted state at serial {}", next);
        Ok(())
    }
}

/// Resolves the references of a create-like step against the working
/// snapshot. Delete-like steps need no resolution.
fn resolve_step(step: &PlanStep, working: &StateSnapshot) -> Result<Option<ResolvedResource>, PlanError> {
    if !step.kind.is_create_like() {
        return Ok(None);
    }
    let Some(resource) = &step.desired else {
        return Err(PlanError::UnresolvedReference {
            resource: step.id.clone(),
            reference: String::from("(declaration)"),
        });
    };

    let mut missing: Option<AttributeRef> = None;
    let resolve = |reference: &AttributeRef| {
        working
            .value_of(&reference.resource, &reference.attribute)
            .filter(|value| !value.contains_unknown())
            .cloned()
            .unwrap_or_else(AttributeValue::unknown)
    };
    let attributes: BTreeMap<String, AttributeValue> = resource
        .attributes
        .iter()
        .map(|(name, value)| {
            let resolved = value.resolve_with(&resolve);
            if missing.is_none() && resolved.contains_unknown() {
                let mut refs = Vec::new();
                value.collect_references(&mut refs);
                missing = refs.into_iter().next().cloned();
            }
            (name.clone(), resolved)
        })
        .collect();

    if let Some(reference) = missing {
        return Err(PlanError::UnresolvedReference {
            resource: step.id.clone(),
            reference: format!("{}.{}", reference.resource, reference.attribute),
        });
    }

    Ok(Some(ResolvedResource {
        id: step.id.clone(),
        attributes,
    }))
}

/// Runs one step against the provider, retrying and polling as needed.
async fn dispatch(
    provider: &dyn Provider,
    retry: &RetryPolicy,
    poll: &PollPolicy,
    step: &PlanStep,
    resolved: Option<&ResolvedResource>,
    cancel: &CancelToken,
) -> StepOutcome {
    let what = step.to_string();
    debug!("Dispatching {what}");

    match step.kind {
        StepKind::Create | StepKind::CreateReplacement => {
            let Some(resource) = resolved else {
                return StepOutcome::failed("no resolved attributes", None);
            };
            match retry.run(&what, cancel, || provider.create(resource)).await {
                Ok(Completion::Done(provisioned)) => StepOutcome::Provisioned(provisioned),
                Ok(Completion::Pending(operation)) => {
                    settle(provider, retry, poll, operation, resource, cancel).await
                }
                Err(e) => StepOutcome::failed(e, None),
            }
        }
        StepKind::Update => {
            let (Some(resource), Some(prior)) = (resolved, step.prior.as_ref()) else {
                return StepOutcome::failed("no recorded state to update", None);
            };
            let result = retry
                .run(&what, cancel, || {
                    provider.update(&step.id, &prior.provider_id, resource, &step.changes)
                })
                .await;
            match result {
                Ok(Completion::Done(provisioned)) => StepOutcome::Provisioned(provisioned),
                Ok(Completion::Pending(operation)) => {
                    settle(provider, retry, poll, operation, resource, cancel).await
                }
                Err(e) => StepOutcome::failed(e, None),
            }
        }
        StepKind::Delete | StepKind::DeletePrior | StepKind::DeleteDeposed => {
            let Some(prior) = step.prior.as_ref() else {
                return StepOutcome::failed("no recorded state to delete", None);
            };
            let result = match retry
                .run(&what, cancel, || provider.delete(&step.id, &prior.provider_id))
                .await
            {
                Ok(Completion::Done(())) => Ok(()),
                Ok(Completion::Pending(operation)) => {
                    poll.wait(provider, retry, operation, cancel).await.map(|_| ())
                }
                Err(e) => Err(e),
            };
            match result {
                Ok(()) => StepOutcome::Deleted,
                Err(ProviderError::NotFound { .. }) => {
                    debug!("{} already gone", prior.provider_id);
                    StepOutcome::Deleted
                }
                Err(e) => StepOutcome::failed(e, Some(prior.provider_id.clone())),
            }
        }
    }
}

/// Polls a pending create or update until it settles.
async fn settle(
    provider: &dyn Provider,
    retry: &RetryPolicy,
    poll: &PollPolicy,
    operation: PendingOperation,
    resource: &ResolvedResource,
    cancel: &CancelToken,
) -> StepOutcome {
    let provider_id = operation.provider_id.clone();
    debug!("{} pending as {}", resource.id, operation.token);

    match poll.wait(provider, retry, operation, cancel).await {
        Ok(Some(provisioned)) => StepOutcome::Provisioned(provisioned),
        Ok(None) => match provider_id {
            Some(id) => StepOutcome::Provisioned(ProvisionedResource::new(id, resource.attributes.clone())),
            None => StepOutcome::failed("operation finished without a resource", None),
        },
        Err(e) => StepOutcome::failed(e, provider_id),
    }
}

/// Folds a step result into the working snapshot. Returns false on failure.
fn apply_result(report: &mut ExecutionReport, step: &PlanStep, result: StepResult, hasher: &GraphHasher) -> bool {
    let working = &mut report.snapshot;
    let step_ref = StepRef::from(step);

    match result.outcome {
        StepOutcome::Provisioned(provisioned) => {
            let (Some(resource), Some(resolved)) = (step.desired.clone(), result.resolved) else {
                report.failed.push(FailedStep {
                    step: step_ref,
                    error: String::from("no declaration for provisioned resource"),
                });
                return false;
            };
            let outputs = provisioned
                .attributes
                .into_iter()
                .filter(|(key, _)| !resolved.attributes.contains_key(key))
                .collect();
            let hash = hasher.hash_attributes(&resolved.attributes);
            let mut state = ResourceState::new(resource, provisioned.provider_id, resolved.attributes, outputs, hash);
            if step.kind == StepKind::Update
                && let Some(prior) = &step.prior
            {
                state.created_at = prior.created_at;
            }

            if step.kind == StepKind::CreateReplacement
                && working
                    .get(&step.id)
                    .is_some_and(|recorded| recorded.provider_id != state.provider_id)
                && let Some(old) = working.depose(&step.id)
            {
                debug!("{} deposed {} until it is deleted", step.id, old.provider_id);
            }

            info!("{} completed ({})", step, state.provider_id);
            working.set_resource(state);
            report.completed.push(step_ref);
            true
        }
        StepOutcome::Deleted => {
            if let Some(prior_id) = step.prior.as_ref().map(|p| p.provider_id.as_str()) {
                // After a create-before-delete replacement the prior instance
                // is deposed and the new one is recorded.
                if !working.remove_deposed(&step.id, prior_id)
                    && working.get(&step.id).is_some_and(|r| r.provider_id == prior_id)
                {
                    working.remove_resource(&step.id);
                }
            }
            info!("{} completed", step);
            report.completed.push(step_ref);
            true
        }
        StepOutcome::Failed { error, provider_id } => {
            error!("{} failed: {}", step, error);

            if matches!(step.kind, StepKind::Create | StepKind::CreateReplacement)
                && let (Some(provider_id), Some(resource), Some(resolved)) =
                    (provider_id, step.desired.clone(), result.resolved)
            {
                if let Some(old) = working.depose(&step.id) {
                    warn!("{} deposed {} behind an unconfirmed replacement", step.id, old.provider_id);
                }
                let hash = hasher.hash_attributes(&resolved.attributes);
                let mut state =
                    ResourceState::new(resource, provider_id, resolved.attributes, BTreeMap::new(), hash);
                state.set_status(ResourceStatus::Tainted);
                warn!("{} recorded as tainted ({})", step.id, state.provider_id);
                working.set_resource(state);
                report.tainted.push(step.id.clone());
            }

            report.failed.push(FailedStep {
                step: step_ref,
                error,
            });
            false
        }
    }
}

impl StepOutcome {
    fn failed(error: impl ToString, provider_id: Option<String>) -> Self {
        Self::Failed {
            error: error.to_string(),
            provider_id,
        }
    }
}

impl ExecutionReport {
    /// Returns true if the run succeeded.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.status == ExecutionStatus::Succeeded
    }

    /// Resources changed by completed steps.
    #[must_use]
    pub fn changed_resources(&self) -> Vec<ResourceId> {
        self.completed
            .iter()
            .map(|s| s.id.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    /// Resources with failed or never-dispatched steps.
    #[must_use]
    pub fn pending_resources(&self) -> Vec<ResourceId> {
        self.failed
            .iter()
            .map(|f| f.step.id.clone())
            .chain(self.not_attempted.iter().map(|s| s.id.clone()))
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }
}

impl From<&PlanStep> for StepRef {
    fn from(step: &PlanStep) -> Self {
        Self {
            id: step.id.clone(),
            kind: step.kind,
        }
    }
}

impl fmt::Display for StepRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.kind, self.id)
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Succeeded => write!(f, "succeeded"),
            Self::Failed => write!(f, "failed"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl fmt::Display for ExecutionReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Execution {}: {} completed, {} failed, {} not attempted",
            self.status,
            self.completed.len(),
            self.failed.len(),
            self.not_attempted.len()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{Resource, ResourceGraph, SchemaRegistry};
    use crate::planner::{ChangeAction, DiffEngine, Planner};
    use crate::provider::{InMemoryProvider, OperationKind};
    use crate::state::LocalStateStore;
    use std::time::Duration;
    use tempfile::TempDir;

    fn vpc() -> Resource {
        Resource::new("vpc", "main").with_attribute("cidr_block", "10.0.0.0/16")
    }

    fn subnet() -> Resource {
        Resource::new("subnet", "a")
            .with_reference("vpc_id", &ResourceId::new("vpc", "main"), "id")
            .with_attribute("cidr_block", "10.0.1.0/24")
    }

    fn instance(ami: &str) -> Resource {
        Resource::new("instance", "web")
            .with_attribute("ami", ami)
            .with_attribute("instance_type", "t3.small")
            .with_reference("subnet_id", &ResourceId::new("subnet", "a"), "id")
    }

    struct Harness {
        _dir: TempDir,
        provider: InMemoryProvider,
        store: Arc<LocalStateStore>,
        executor: PlanExecutor,
    }

    impl Harness {
        fn new() -> Self {
            Self::with_provider(InMemoryProvider::new())
        }

        fn with_provider(provider: InMemoryProvider) -> Self {
            let dir = TempDir::new().expect("temp dir");
            let store = Arc::new(LocalStateStore::with_base_dir(dir.path()));
            let executor = PlanExecutor::new(Arc::new(provider.clone()), store.clone())
                .with_retry(RetryPolicy::none())
                .with_poll(PollPolicy::new(
                    Duration::from_millis(1),
                    Duration::from_millis(2),
                    Duration::from_secs(2),
                ));
            Self {
                _dir: dir,
                provider,
                store,
                executor,
            }
        }

        async fn stored(&self) -> StateSnapshot {
            self.store
                .load()
                .await
                .expect("load")
                .unwrap_or_else(|| StateSnapshot::with_lineage("lin"))
        }

        async fn plan(&self, desired: &[Resource]) -> (ExecutionPlan, StateSnapshot) {
            let graph = ResourceGraph::from_resources(desired.to_vec()).expect("graph");
            let baseline = self.stored().await;
            let changes = DiffEngine::new(SchemaRegistry::builtin())
                .diff(&graph, &baseline)
                .expect("diff");
            let plan = Planner::new().plan(&changes, &graph, &baseline).expect("plan");
            (plan, baseline)
        }

        async fn apply(&self, desired: &[Resource]) -> ExecutionReport {
            self.apply_with(desired, CancelToken::new()).await
        }

        async fn apply_with(&self, desired: &[Resource], cancel: CancelToken) -> ExecutionReport {
            let (plan, baseline) = self.plan(desired).await;
            self.executor
                .execute(&plan, baseline, &RunContext::new("run-1", cancel))
                .await
        }
    }

    #[tokio::test]
    async fn test_creates_in_dependency_order_with_one_write() {
        let harness = Harness::new();
        let (plan, _) = harness.plan(&[vpc(), subnet(), instance("ami-1")]).await;
        assert_eq!(plan.batches.len(), 3);

        let report = harness.apply(&[vpc(), subnet(), instance("ami-1")]).await;
        assert_eq!(report.status, ExecutionStatus::Succeeded);
        assert_eq!(report.completed.len(), 3);
        assert_eq!(report.persisted_serial, Some(1));

        let stored = harness.stored().await;
        assert_eq!(stored.serial, 1);
        assert_eq!(stored.len(), 3);
        assert_eq!(stored.history.len(), 1);

        let vpc_id = stored
            .value_of(&ResourceId::new("vpc", "main"), "id")
            .cloned()
            .expect("vpc output");
        assert_eq!(
            stored.get(&ResourceId::new("subnet", "a")).map(|s| &s.attributes["vpc_id"]),
            Some(&vpc_id)
        );
        assert_eq!(
            harness.provider.calls_of(OperationKind::Create),
            vec![
                ResourceId::new("vpc", "main"),
                ResourceId::new("subnet", "a"),
                ResourceId::new("instance", "web"),
            ]
        );
    }

    #[tokio::test]
    async fn test_second_apply_is_all_no_op() {
        let harness = Harness::new();
        harness.apply(&[vpc(), subnet(), instance("ami-1")]).await;

        let (plan, _) = harness.plan(&[vpc(), subnet(), instance("ami-1")]).await;
        assert!(plan.is_empty());
        assert_eq!(plan.summary.no_op, 3);
    }

    #[tokio::test]
    async fn test_failure_persists_completed_batches_only() {
        let harness = Harness::new();
        harness.provider.fail_next(
            OperationKind::Create,
            &ResourceId::new("subnet", "a"),
            ProviderError::permanent("quota exceeded"),
        );

        let report = harness.apply(&[vpc(), subnet(), instance("ami-1")]).await;
        assert_eq!(report.status, ExecutionStatus::Failed);
        assert_eq!(report.completed.len(), 1);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.not_attempted.len(), 1);
        assert_eq!(
            report.pending_resources(),
            vec![ResourceId::new("instance", "web"), ResourceId::new("subnet", "a")]
        );

        let stored = harness.stored().await;
        assert_eq!(stored.serial, 1);
        assert_eq!(stored.len(), 1);
        assert!(stored.contains(&ResourceId::new("vpc", "main")));
        assert!(!stored.history[0].success);

        // The retry only creates what is missing.
        let (plan, _) = harness.plan(&[vpc(), subnet(), instance("ami-1")]).await;
        let steps: Vec<String> = plan.steps().map(ToString::to_string).collect();
        assert_eq!(steps, vec!["create subnet.a", "create instance.web"]);

        let report = harness.apply(&[vpc(), subnet(), instance("ami-1")]).await;
        assert!(report.is_success());
        assert_eq!(harness.stored().await.serial, 2);
    }

    #[tokio::test]
    async fn test_concurrency_is_bounded() {
        let provider = InMemoryProvider::new().with_latency(Duration::from_millis(20));
        let mut harness = Harness::with_provider(provider);
        harness.executor = harness.executor.clone().with_max_concurrency(2);

        let vpcs: Vec<Resource> = (0..6)
            .map(|i| Resource::new("vpc", format!("v{i}")).with_attribute("cidr_block", format!("10.{i}.0.0/16")))
            .collect();
        let report = harness.apply(&vpcs).await;

        assert!(report.is_success());
        assert_eq!(report.completed.len(), 6);
        assert!(harness.provider.max_in_flight() <= 2);
    }

    #[tokio::test]
    async fn test_pending_create_is_polled() {
        let harness = Harness::new();
        harness
            .provider
            .pend_next(OperationKind::Create, &ResourceId::new("vpc", "main"), 2);

        let report = harness.apply(&[vpc()]).await;
        assert!(report.is_success());
        assert!(
            harness
                .stored()
                .await
                .value_of(&ResourceId::new("vpc", "main"), "id")
                .is_some()
        );
    }

    #[tokio::test]
    async fn test_unconfirmed_create_is_tainted_and_replaced() {
        let mut harness = Harness::new();
        harness.executor = harness.executor.clone().with_poll(PollPolicy::new(
            Duration::from_millis(5),
            Duration::from_millis(5),
            Duration::from_millis(30),
        ));
        let id = ResourceId::new("vpc", "main");
        harness.provider.pend_next(OperationKind::Create, &id, 1_000);

        let report = harness.apply(&[vpc()]).await;
        assert_eq!(report.status, ExecutionStatus::Failed);
        assert_eq!(report.tainted, vec![id.clone()]);

        let stored = harness.stored().await;
        let recorded = stored.get(&id).expect("tainted resource recorded");
        assert!(recorded.is_tainted());
        assert!(harness.provider.object(&recorded.provider_id).is_some());

        let graph = ResourceGraph::from_resources(vec![vpc()]).expect("graph");
        let changes = DiffEngine::default().diff(&graph, &stored).expect("diff");
        assert!(matches!(changes.get(&id).map(|e| e.action), Some(ChangeAction::Replace(_))));
    }

    #[tokio::test]
    async fn test_cancelled_run_still_persists() {
        let harness = Harness::new();
        let cancel = CancelToken::new();
        cancel.cancel();

        let report = harness.apply_with(&[vpc(), subnet()], cancel).await;
        assert_eq!(report.status, ExecutionStatus::Cancelled);
        assert!(report.completed.is_empty());
        assert_eq!(report.not_attempted.len(), 2);
        assert!(harness.provider.calls().is_empty());

        let stored = harness.stored().await;
        assert_eq!(stored.serial, 1);
        assert_eq!(stored.history[0].error.as_deref(), Some("cancelled"));
    }

    #[tokio::test]
    async fn test_checkpoint_each_batch() {
        let mut harness = Harness::new();
        harness.executor = harness.executor.clone().with_checkpoint_each_batch(true);

        let report = harness.apply(&[vpc(), subnet(), instance("ami-1")]).await;
        assert!(report.is_success());
        assert_eq!(report.persisted_serial, Some(3));
        assert_eq!(harness.stored().await.serial, 3);
    }

    #[tokio::test]
    async fn test_delete_of_vanished_resource_succeeds() {
        let harness = Harness::new();
        harness.apply(&[vpc()]).await;
        let stored = harness.stored().await;
        let provider_id = &stored.get(&ResourceId::new("vpc", "main")).expect("vpc").provider_id;
        assert!(harness.provider.remove_out_of_band(provider_id));

        let report = harness.apply(&[]).await;
        assert!(report.is_success());
        assert!(harness.stored().await.is_empty());
    }

    #[tokio::test]
    async fn test_removing_leaf_deletes_only_leaf() {
        let harness = Harness::new();
        harness.apply(&[vpc(), subnet(), instance("ami-1")]).await;

        let report = harness.apply(&[vpc(), subnet()]).await;
        assert!(report.is_success());
        assert_eq!(harness.provider.calls_of(OperationKind::Delete), vec![ResourceId::new("instance", "web")]);

        let stored = harness.stored().await;
        assert_eq!(stored.len(), 2);
        assert!(!stored.contains(&ResourceId::new("instance", "web")));
    }

    #[tokio::test]
    async fn test_create_before_delete_replacement() {
        let harness = Harness::new();
        harness.apply(&[vpc(), subnet(), instance("ami-1")]).await;
        let id = ResourceId::new("instance", "web");
        let before = harness.stored().await.get(&id).expect("instance").provider_id.clone();

        let report = harness.apply(&[vpc(), subnet(), instance("ami-2")]).await;
        assert!(report.is_success());

        let stored = harness.stored().await;
        let after = &stored.get(&id).expect("instance").provider_id;
        assert_ne!(after, &before);
        assert!(harness.provider.object(&before).is_none());
        assert_eq!(harness.provider.provider_ids_for(&id), vec![after.clone()]);
    }

    #[tokio::test]
    async fn test_subnet_change_replaces_subnet_and_instance() {
        let harness = Harness::new();
        harness.apply(&[vpc(), subnet(), instance("ami-1")]).await;

        let moved = Resource::new("subnet", "a")
            .with_reference("vpc_id", &ResourceId::new("vpc", "main"), "id")
            .with_attribute("cidr_block", "10.0.2.0/24");
        let report = harness.apply(&[vpc(), moved, instance("ami-1")]).await;
        assert!(report.is_success());
        let steps: Vec<String> = report.completed.iter().map(ToString::to_string).collect();
        assert_eq!(
            steps,
            vec![
                "delete-prior instance.web",
                "delete-prior subnet.a",
                "create-replacement subnet.a",
                "create-replacement instance.web",
            ]
        );

        let stored = harness.stored().await;
        let subnet_id = ResourceId::new("subnet", "a");
        let web = ResourceId::new("instance", "web");
        assert_eq!(
            stored.get(&web).map(|r| r.attributes["subnet_id"].clone()),
            stored.value_of(&subnet_id, "id").cloned()
        );
        assert_eq!(harness.provider.provider_ids_for(&subnet_id).len(), 1);
        assert_eq!(harness.provider.provider_ids_for(&web).len(), 1);
        assert!(stored.deposed.is_empty());
    }

    #[tokio::test]
    async fn test_failed_prior_delete_keeps_old_instance_deposed() {
        let harness = Harness::new();
        harness.apply(&[vpc(), subnet(), instance("ami-1")]).await;
        let id = ResourceId::new("instance", "web");
        let old = harness.stored().await.get(&id).expect("instance").provider_id.clone();
        harness
            .provider
            .fail_next(OperationKind::Delete, &id, ProviderError::permanent("still attached"));

        let report = harness.apply(&[vpc(), subnet(), instance("ami-2")]).await;
        assert_eq!(report.status, ExecutionStatus::Failed);
        assert_eq!(report.failed[0].step.kind, StepKind::DeletePrior);

        let stored = harness.stored().await;
        let new = stored.get(&id).expect("instance").provider_id.clone();
        assert_ne!(new, old);
        let deposed: Vec<&str> = stored.deposed.iter().map(|d| d.provider_id.as_str()).collect();
        assert_eq!(deposed, vec![old.as_str()]);
        assert!(harness.provider.object(&old).is_some());

        let (plan, _) = harness.plan(&[vpc(), subnet(), instance("ami-2")]).await;
        let steps: Vec<String> = plan.steps().map(ToString::to_string).collect();
        assert_eq!(steps, vec!["delete-deposed instance.web"]);

        let report = harness.apply(&[vpc(), subnet(), instance("ami-2")]).await;
        assert!(report.is_success());
        assert!(harness.provider.object(&old).is_none());
        assert_eq!(harness.provider.provider_ids_for(&id), vec![new.clone()]);

        let stored = harness.stored().await;
        assert!(stored.deposed.is_empty());
        assert_eq!(stored.get(&id).map(|r| r.provider_id.clone()), Some(new));

        let (plan, _) = harness.plan(&[vpc(), subnet(), instance("ami-2")]).await;
        assert!(plan.is_empty());
    }

    #[tokio::test]
    async fn test_unconfirmed_replacement_deposes_prior() {
        let mut harness = Harness::new();
        harness.apply(&[vpc()]).await;
        harness.executor = harness.executor.clone().with_poll(PollPolicy::new(
            Duration::from_millis(5),
            Duration::from_millis(5),
            Duration::from_millis(30),
        ));
        let id = ResourceId::new("vpc", "main");
        let old = harness.stored().await.get(&id).expect("vpc").provider_id.clone();
        harness.provider.pend_next(OperationKind::Create, &id, 1_000);

        let moved = Resource::new("vpc", "main").with_attribute("cidr_block", "10.9.0.0/16");
        let report = harness.apply(std::slice::from_ref(&moved)).await;
        assert_eq!(report.status, ExecutionStatus::Failed);
        assert_eq!(report.tainted, vec![id.clone()]);

        let stored = harness.stored().await;
        assert!(stored.get(&id).is_some_and(ResourceState::is_tainted));
        assert_eq!(stored.deposed.len(), 1);
        assert_eq!(stored.deposed[0].provider_id, old);
    }

    #[tokio::test]
    async fn test_stale_baseline_reports_persist_error() {
        let harness = Harness::new();
        let (plan, baseline) = harness.plan(&[vpc()]).await;

        let mut other = StateSnapshot::with_lineage(&baseline.lineage);
        other.serial = 1;
        harness.store.save(&other, 0).await.expect("concurrent write");

        let report = harness
            .executor
            .execute(&plan, baseline, &RunContext::new("run-2", CancelToken::new()))
            .await;
        assert_eq!(report.status, ExecutionStatus::Failed);
        assert!(report.persist_error.is_some());
        assert_eq!(report.persisted_serial, None);
    }
}
