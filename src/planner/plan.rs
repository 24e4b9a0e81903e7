//! Execution planning.
//!
//! Turns a change-set into batches of provider steps. A step may only run
//! once every step it is constrained after has finished, and the steps of a
//! single batch are mutually unconstrained so they can run concurrently.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use tracing::{debug, info};

use crate::error::PlanError;
use crate::graph::{ReplacementStrategy, Resource, ResourceGraph, ResourceId};
use crate::state::{ResourceState, StateSnapshot};

use super::diff::{AttributeChange, ChangeAction, ChangeSet, ChangeSummary};

/// Kind of provider step.
///
/// The declaration order is the tie-break within a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StepKind {
    /// Create a new resource.
    Create,
    /// Create the new instance of a replaced resource.
    CreateReplacement,
    /// Update a resource in place.
    Update,
    /// Delete the old instance of a replaced resource.
    DeletePrior,
    /// Delete a resource that is no longer desired.
    Delete,
    /// Delete an old instance left behind by an earlier replacement.
    DeleteDeposed,
}

/// A single provider step.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlanStep {
    /// Resource identity.
    pub id: ResourceId,
    /// What to do.
    pub kind: StepKind,
    /// Attribute changes for updates.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub changes: Vec<AttributeChange>,
    /// Desired declaration for create-like steps.
    #[serde(skip)]
    pub desired: Option<Resource>,
    /// Recorded state for updates and delete-like steps.
    #[serde(skip)]
    pub prior: Option<ResourceState>,
}

/// Steps that may run concurrently.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Batch {
    /// Position of the batch, starting at 0.
    pub index: usize,
    /// Steps ordered by identity, then kind.
    pub steps: Vec<PlanStep>,
}

/// Ordered batches for a change-set.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ExecutionPlan {
    /// Batches in execution order.
    pub batches: Vec<Batch>,
    /// Counts of the change-set this plan came from.
    pub summary: ChangeSummary,
}

/// Orders change-sets into batches.
#[derive(Debug, Clone, Copy, Default)]
pub struct Planner;

impl StepKind {
    /// Create, update or create-replacement.
    #[must_use]
    pub const fn is_create_like(self) -> bool {
        matches!(self, Self::Create | Self::CreateReplacement | Self::Update)
    }

    /// Delete or delete-prior.
    #[must_use]
    pub const fn is_delete_like(self) -> bool {
        matches!(self, Self::Delete | Self::DeletePrior | Self::DeleteDeposed)
    }
}

impl PlanStep {
    fn new(id: ResourceId, kind: StepKind, desired: Option<Resource>, prior: Option<ResourceState>) -> Self {
        Self {
            id,
            kind,
            changes: Vec::new(),
            desired,
            prior,
        }
    }
}

impl Planner {
    /// Creates a planner.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Orders the changes of `changes` into batches.
    ///
    /// Constraints:
    /// - a create-like step runs after the create-like step of each desired
    ///   dependency
    /// - a delete-like step runs after the delete-like step, or the in-place
    ///   update, of each resource that depended on it in the baseline
    /// - a replacement orders its two steps by its strategy
    ///
    /// # Errors
    ///
    /// Returns [`PlanError::PlanCycle`] if the constraints are cyclic.
    pub fn plan(
        &self,
        changes: &ChangeSet,
        desired: &ResourceGraph,
        baseline: &StateSnapshot,
    ) -> Result<ExecutionPlan, PlanError> {
        let mut steps: Vec<PlanStep> = Vec::new();
        let mut strategies: BTreeMap<ResourceId, ReplacementStrategy> = BTreeMap::new();

        for entry in changes.changes() {
            let id = entry.id.clone();
            match entry.action {
                ChangeAction::Create => {
                    steps.push(PlanStep::new(id, StepKind::Create, entry.desired.clone(), None));
                }
                ChangeAction::Update => {
                    let mut step =
                        PlanStep::new(id, StepKind::Update, entry.desired.clone(), entry.prior.clone());
                    step.changes.clone_from(&entry.changes);
                    steps.push(step);
                }
                ChangeAction::Delete => {
                    let kind = if entry.deposed {
                        StepKind::DeleteDeposed
                    } else {
                        StepKind::Delete
                    };
                    steps.push(PlanStep::new(id, kind, None, entry.prior.clone()));
                }
                ChangeAction::Replace(strategy) => {
                    strategies.insert(id.clone(), strategy);
                    steps.push(PlanStep::new(
                        id.clone(),
                        StepKind::CreateReplacement,
                        entry.desired.clone(),
                        None,
                    ));
                    steps.push(PlanStep::new(id, StepKind::DeletePrior, None, entry.prior.clone()));
                }
                ChangeAction::NoOp => {}
            }
        }

        let predecessors = constraints(&steps, &strategies, desired, &baseline.declared_graph());
        let plan = ExecutionPlan {
            batches: levels(steps, &predecessors)?,
            summary: changes.summary(),
        };

        info!(
            "Planned {} steps in {} batches",
            plan.step_count(),
            plan.batches.len()
        );
        Ok(plan)
    }
}

/// Builds, for every step, the set of steps it must run after.
fn constraints(
    steps: &[PlanStep],
    strategies: &BTreeMap<ResourceId, ReplacementStrategy>,
    desired: &ResourceGraph,
    baseline: &ResourceGraph,
) -> Vec<BTreeSet<usize>> {
    let mut create_like: BTreeMap<&ResourceId, usize> = BTreeMap::new();
    let mut delete_like: BTreeMap<&ResourceId, usize> = BTreeMap::new();
    let mut updates: BTreeMap<&ResourceId, usize> = BTreeMap::new();

    for (index, step) in steps.iter().enumerate() {
        // Nothing waits on a deposed instance.
        if step.kind.is_create_like() {
            create_like.insert(&step.id, index);
        } else if step.kind != StepKind::DeleteDeposed {
            delete_like.insert(&step.id, index);
        }
        if step.kind == StepKind::Update {
            updates.insert(&step.id, index);
        }
    }

    let mut predecessors = vec![BTreeSet::new(); steps.len()];

    for (index, step) in steps.iter().enumerate() {
        let before = &mut predecessors[index];

        if step.kind.is_create_like() {
            for dependency in desired.dependencies_of(&step.id) {
                if let Some(&other) = create_like.get(&dependency) {
                    before.insert(other);
                }
            }
        } else {
            for dependent in baseline.dependents_of(&step.id) {
                if let Some(&other) = delete_like.get(&dependent).or_else(|| updates.get(&dependent)) {
                    before.insert(other);
                }
            }
        }

        match (step.kind, strategies.get(&step.id)) {
            (StepKind::CreateReplacement, Some(ReplacementStrategy::DeleteBeforeCreate)) => {
                if let Some(&prior) = delete_like.get(&step.id) {
                    before.insert(prior);
                }
            }
            (StepKind::DeletePrior, Some(ReplacementStrategy::CreateBeforeDelete)) => {
                if let Some(&replacement) = create_like.get(&step.id) {
                    before.insert(replacement);
                }
            }
            _ => {}
        }
        before.remove(&index);
    }

    predecessors
}

/// Splits steps into Kahn levels.
fn levels(steps: Vec<PlanStep>, predecessors: &[BTreeSet<usize>]) -> Result<Vec<Batch>, PlanError> {
    let mut placed: BTreeSet<usize> = BTreeSet::new();
    let mut remaining: BTreeSet<usize> = (0..steps.len()).collect();
    let mut order: Vec<Vec<usize>> = Vec::new();

    while !remaining.is_empty() {
        let mut level: Vec<usize> = remaining
            .iter()
            .copied()
            .filter(|i| predecessors[*i].is_subset(&placed))
            .collect();

        if level.is_empty() {
            return Err(PlanError::PlanCycle {
                steps: find_cycle(&steps, predecessors, &remaining),
            });
        }

        level.sort_by(|a, b| (&steps[*a].id, steps[*a].kind).cmp(&(&steps[*b].id, steps[*b].kind)));
        for index in &level {
            remaining.remove(index);
            placed.insert(*index);
        }
        debug!("Batch {} has {} steps", order.len(), level.len());
        order.push(level);
    }

    let mut slots: Vec<Option<PlanStep>> = steps.into_iter().map(Some).collect();
    Ok(order
        .into_iter()
        .enumerate()
        .map(|(index, level)| Batch {
            index,
            steps: level.into_iter().filter_map(|i| slots[i].take()).collect(),
        })
        .collect())
}

/// Follows predecessor edges among `remaining` until a step repeats.
fn find_cycle(steps: &[PlanStep], predecessors: &[BTreeSet<usize>], remaining: &BTreeSet<usize>) -> Vec<String> {
    let Some(&start) = remaining.first() else {
        return Vec::new();
    };

    let mut path: Vec<usize> = Vec::new();
    let mut current = start;

    loop {
        if let Some(pos) = path.iter().position(|p| *p == current) {
            let mut cycle = path.split_off(pos);
            cycle.push(current);
            cycle.reverse();
            return cycle.into_iter().map(|i| steps[i].to_string()).collect();
        }
        path.push(current);

        match predecessors[current].iter().find(|p| remaining.contains(*p)) {
            Some(&next) => current = next,
            None => return path.into_iter().map(|i| steps[i].to_string()).collect(),
        }
    }
}

impl ExecutionPlan {
    /// Returns true if there is nothing to do.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.batches.iter().all(|b| b.steps.is_empty())
    }

    /// Total number of steps.
    #[must_use]
    pub fn step_count(&self) -> usize {
        self.batches.iter().map(|b| b.steps.len()).sum()
    }

    /// Every step in execution order.
    pub fn steps(&self) -> impl Iterator<Item = &PlanStep> {
        self.batches.iter().flat_map(|b| b.steps.iter())
    }
}

impl fmt::Display for StepKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Create => write!(f, "create"),
            Self::CreateReplacement => write!(f, "create-replacement"),
            Self::Update => write!(f, "update"),
            Self::DeletePrior => write!(f, "delete-prior"),
            Self::Delete => write!(f, "delete"),
            Self::DeleteDeposed => write!(f, "delete-deposed"),
        }
    }
}

impl fmt::Display for PlanStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.kind, self.id)
    }
}

impl fmt::Display for ExecutionPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return writeln!(f, "No changes required");
        }

        writeln!(
            f,
            "Execution plan: {} steps in {} batches",
            self.step_count(),
            self.batches.len()
        )?;
        for batch in &self.batches {
            writeln!(f, "  Batch {}:", batch.index + 1)?;
            for step in &batch.steps {
                writeln!(f, "    {step}")?;
            }
        }
        writeln!(f, "Summary: {}", self.summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{GraphHasher, SchemaRegistry};
    use crate::planner::DiffEngine;

    fn vpc(cidr: &str) -> Resource {
        Resource::new("vpc", "main").with_attribute("cidr_block", cidr)
    }

    fn subnet(cidr: &str) -> Resource {
        Resource::new("subnet", "a")
            .with_reference("vpc_id", &ResourceId::new("vpc", "main"), "id")
            .with_attribute("cidr_block", cidr)
    }

    fn instance(name: &str, ami: &str) -> Resource {
        Resource::new("instance", name)
            .with_attribute("ami", ami)
            .with_attribute("instance_type", "t3.small")
            .with_reference("subnet_id", &ResourceId::new("subnet", "a"), "id")
    }

    fn record(snapshot: &mut StateSnapshot, resource: Resource) {
        let attributes: std::collections::BTreeMap<String, crate::graph::AttributeValue> = resource
            .attributes
            .iter()
            .map(|(k, v)| {
                let resolved = v.resolve_with(&|r| {
                    snapshot
                        .value_of(&r.resource, &r.attribute)
                        .cloned()
                        .unwrap_or_else(crate::graph::AttributeValue::unknown)
                });
                (k.clone(), resolved)
            })
            .collect();
        let provider_id = format!("{}-1", resource.id);
        let outputs = std::collections::BTreeMap::from([(
            String::from("id"),
            crate::graph::AttributeValue::from(provider_id.clone()),
        )]);
        let hash = GraphHasher::new().hash_attributes(&attributes);
        snapshot.set_resource(ResourceState::new(resource, provider_id, attributes, outputs, hash));
    }

    fn plan_for(desired: &[Resource], baseline: &StateSnapshot, schemas: SchemaRegistry) -> Result<ExecutionPlan, PlanError> {
        let graph = ResourceGraph::from_resources(desired.to_vec()).expect("valid graph");
        let changes = DiffEngine::new(schemas).diff(&graph, baseline).expect("diff");
        Planner::new().plan(&changes, &graph, baseline)
    }

    fn rendered(plan: &ExecutionPlan) -> Vec<Vec<String>> {
        plan.batches
            .iter()
            .map(|b| b.steps.iter().map(ToString::to_string).collect())
            .collect()
    }

    #[test]
    fn test_creates_follow_dependencies() {
        let plan = plan_for(
            &[instance("web", "ami-1"), subnet("10.0.1.0/24"), vpc("10.0.0.0/16")],
            &StateSnapshot::with_lineage("lin"),
            SchemaRegistry::builtin(),
        )
        .expect("plan");

        assert_eq!(
            rendered(&plan),
            vec![
                vec![String::from("create vpc.main")],
                vec![String::from("create subnet.a")],
                vec![String::from("create instance.web")],
            ]
        );
        assert_eq!(plan.summary.create, 3);
    }

    #[test]
    fn test_independent_steps_share_a_batch() {
        let plan = plan_for(
            &[
                vpc("10.0.0.0/16"),
                subnet("10.0.1.0/24"),
                instance("b", "ami-1"),
                instance("a", "ami-1"),
            ],
            &StateSnapshot::with_lineage("lin"),
            SchemaRegistry::builtin(),
        )
        .expect("plan");

        assert_eq!(
            plan.batches[2].steps.iter().map(|s| s.id.to_string()).collect::<Vec<_>>(),
            vec![String::from("instance.a"), String::from("instance.b")]
        );
    }

    #[test]
    fn test_deletes_run_dependents_first() {
        let mut baseline = StateSnapshot::with_lineage("lin");
        record(&mut baseline, vpc("10.0.0.0/16"));
        record(&mut baseline, subnet("10.0.1.0/24"));
        record(&mut baseline, instance("web", "ami-1"));

        let plan = plan_for(&[], &baseline, SchemaRegistry::builtin()).expect("plan");
        assert_eq!(
            rendered(&plan),
            vec![
                vec![String::from("delete instance.web")],
                vec![String::from("delete subnet.a")],
                vec![String::from("delete vpc.main")],
            ]
        );
    }

    #[test]
    fn test_removing_leaf_deletes_only_leaf() {
        let mut baseline = StateSnapshot::with_lineage("lin");
        record(&mut baseline, vpc("10.0.0.0/16"));
        record(&mut baseline, subnet("10.0.1.0/24"));
        record(&mut baseline, instance("web", "ami-1"));

        let plan = plan_for(
            &[vpc("10.0.0.0/16"), subnet("10.0.1.0/24")],
            &baseline,
            SchemaRegistry::builtin(),
        )
        .expect("plan");
        assert_eq!(rendered(&plan), vec![vec![String::from("delete instance.web")]]);
    }

    #[test]
    fn test_create_before_delete_replacement() {
        let mut baseline = StateSnapshot::with_lineage("lin");
        record(&mut baseline, vpc("10.0.0.0/16"));
        record(&mut baseline, subnet("10.0.1.0/24"));
        record(&mut baseline, instance("web", "ami-1"));

        let plan = plan_for(
            &[vpc("10.0.0.0/16"), subnet("10.0.1.0/24"), instance("web", "ami-2")],
            &baseline,
            SchemaRegistry::builtin(),
        )
        .expect("plan");
        assert_eq!(
            rendered(&plan),
            vec![
                vec![String::from("create-replacement instance.web")],
                vec![String::from("delete-prior instance.web")],
            ]
        );
    }

    #[test]
    fn test_delete_before_create_replacement() {
        let mut baseline = StateSnapshot::with_lineage("lin");
        record(&mut baseline, vpc("10.0.0.0/16"));
        record(&mut baseline, subnet("10.0.1.0/24"));

        let plan = plan_for(
            &[vpc("10.0.0.0/16"), subnet("10.0.2.0/24")],
            &baseline,
            SchemaRegistry::builtin(),
        )
        .expect("plan");
        assert_eq!(
            rendered(&plan),
            vec![
                vec![String::from("delete-prior subnet.a")],
                vec![String::from("create-replacement subnet.a")],
            ]
        );
    }

    #[test]
    fn test_subnet_change_replaces_dependent_instance_first() {
        let mut baseline = StateSnapshot::with_lineage("lin");
        record(&mut baseline, vpc("10.0.0.0/16"));
        record(&mut baseline, subnet("10.0.1.0/24"));
        record(&mut baseline, instance("web", "ami-1"));

        let plan = plan_for(
            &[vpc("10.0.0.0/16"), subnet("10.0.2.0/24"), instance("web", "ami-1")],
            &baseline,
            SchemaRegistry::builtin(),
        )
        .expect("plan");
        assert_eq!(
            rendered(&plan),
            vec![
                vec![String::from("delete-prior instance.web")],
                vec![String::from("delete-prior subnet.a")],
                vec![String::from("create-replacement subnet.a")],
                vec![String::from("create-replacement instance.web")],
            ]
        );
        assert_eq!(plan.summary.replace, 2);
    }

    #[test]
    fn test_delete_before_create_with_dependent_update_is_a_cycle() {
        let mut baseline = StateSnapshot::with_lineage("lin");
        record(&mut baseline, vpc("10.0.0.0/16"));
        record(&mut baseline, subnet("10.0.1.0/24"));
        record(&mut baseline, instance("web", "ami-1"));

        let graph = ResourceGraph::from_resources(vec![
            vpc("10.0.0.0/16"),
            subnet("10.0.2.0/24"),
            instance("web", "ami-1"),
        ])
        .expect("valid graph");
        let mut changes = DiffEngine::default().diff(&graph, &baseline).expect("diff");
        // A hand-built change-set may still ask for the dependent in place.
        for entry in &mut changes.entries {
            if entry.id == ResourceId::new("instance", "web") {
                entry.action = ChangeAction::Update;
            }
        }

        let result = Planner::new().plan(&changes, &graph, &baseline);
        let Err(PlanError::PlanCycle { steps }) = result else {
            panic!("expected a plan cycle");
        };
        assert_eq!(steps.len(), 4);
        assert_eq!(steps.first(), steps.last());
        assert!(steps.contains(&String::from("update instance.web")));
        assert!(steps.contains(&String::from("delete-prior subnet.a")));
        assert!(steps.contains(&String::from("create-replacement subnet.a")));
    }

    #[test]
    fn test_deposed_instance_deleted_without_constraints() {
        let mut baseline = StateSnapshot::with_lineage("lin");
        record(&mut baseline, vpc("10.0.0.0/16"));
        record(&mut baseline, subnet("10.0.1.0/24"));
        let mut old = baseline.get(&ResourceId::new("vpc", "main")).expect("vpc").clone();
        old.provider_id = String::from("vpc-old");
        baseline.deposed.push(old);

        let plan = plan_for(
            &[vpc("10.0.0.0/16"), subnet("10.0.1.0/24")],
            &baseline,
            SchemaRegistry::builtin(),
        )
        .expect("plan");
        assert_eq!(rendered(&plan), vec![vec![String::from("delete-deposed vpc.main")]]);
        let step = plan.steps().next().expect("step");
        assert_eq!(step.prior.as_ref().map(|p| p.provider_id.as_str()), Some("vpc-old"));
    }

    #[test]
    fn test_create_before_delete_dependency_keeps_dependent_in_place() {
        let mut baseline = StateSnapshot::with_lineage("lin");
        record(&mut baseline, vpc("10.0.0.0/16"));
        record(&mut baseline, subnet("10.0.1.0/24"));
        record(&mut baseline, instance("web", "ami-1"));

        let mut schemas = SchemaRegistry::builtin();
        let subnet_schema = schemas
            .schema_for("subnet")
            .clone()
            .with_replacement(ReplacementStrategy::CreateBeforeDelete);
        schemas.register("subnet", subnet_schema);

        let plan = plan_for(
            &[vpc("10.0.0.0/16"), subnet("10.0.2.0/24"), instance("web", "ami-1")],
            &baseline,
            schemas,
        )
        .expect("plan");
        assert_eq!(
            rendered(&plan),
            vec![
                vec![String::from("create-replacement subnet.a")],
                vec![String::from("update instance.web")],
                vec![String::from("delete-prior subnet.a")],
            ]
        );
    }

    #[test]
    fn test_no_changes_yields_empty_plan() {
        let mut baseline = StateSnapshot::with_lineage("lin");
        record(&mut baseline, vpc("10.0.0.0/16"));

        let plan = plan_for(&[vpc("10.0.0.0/16")], &baseline, SchemaRegistry::builtin()).expect("plan");
        assert!(plan.is_empty());
        assert_eq!(plan.to_string(), "No changes required\n");
    }

    #[test]
    fn test_planning_is_deterministic() {
        let desired = [
            instance("b", "ami-1"),
            instance("a", "ami-1"),
            subnet("10.0.1.0/24"),
            vpc("10.0.0.0/16"),
        ];
        let baseline = StateSnapshot::with_lineage("lin");
        let first = plan_for(&desired, &baseline, SchemaRegistry::builtin()).expect("plan");
        let second = plan_for(&desired, &baseline, SchemaRegistry::builtin()).expect("plan");
        assert_eq!(first, second);
    }
}
