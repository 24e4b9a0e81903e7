//! Change-set computation.
//!
//! The diff engine compares a desired graph against a baseline snapshot
//! (the stored state, or live state for drift checks) and decides for every
//! identity whether it is created, updated, replaced, deleted or left alone.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use tracing::debug;

use crate::error::GraphError;
use crate::graph::{
    AttributeRef, AttributeValue, ReplacementStrategy, Resource, ResourceGraph, ResourceId,
    SchemaRegistry,
};
use crate::state::{ResourceState, StateSnapshot};

/// Reason recorded when a tainted resource is replaced.
pub const TAINTED_REASON: &str = "tainted";

/// Prefix of the reason recorded when a dependency is replaced delete-before-create.
pub const REPLACED_DEPENDENCY_REASON: &str = "replaced dependency";

/// Diff engine for comparing desired and recorded state.
#[derive(Debug, Clone, Default)]
pub struct DiffEngine {
    schemas: SchemaRegistry,
}

/// What happens to one resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeAction {
    /// Resource is new.
    Create,
    /// Resource changes in place.
    Update,
    /// Resource is no longer desired.
    Delete,
    /// Nothing to do.
    NoOp,
    /// Resource must be recreated.
    Replace(ReplacementStrategy),
}

/// Before/after values of one attribute.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttributeChange {
    /// Attribute name.
    pub attribute: String,
    /// Recorded value, if any.
    pub before: Option<AttributeValue>,
    /// Desired value after resolving references, if any.
    pub after: Option<AttributeValue>,
    /// Whether the change cannot be made in place.
    #[serde(default)]
    pub forces_replacement: bool,
}

/// One entry of a change-set.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChangeEntry {
    /// Resource identity.
    pub id: ResourceId,
    /// Action to take.
    pub action: ChangeAction,
    /// Attribute-level differences.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub changes: Vec<AttributeChange>,
    /// Why a replacement is needed.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub replace_reasons: Vec<String>,
    /// Longest dependency path from a root in the graph the entry belongs to.
    pub rank: usize,
    /// Desired declaration, absent for deletes.
    #[serde(skip)]
    pub desired: Option<Resource>,
    /// Recorded state, absent for creates.
    #[serde(skip)]
    pub prior: Option<ResourceState>,
    /// Whether `prior` is a superseded instance left behind by a replacement.
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub deposed: bool,
}

/// Ordered result of a diff.
///
/// Desired resources come first in topological order, then resources only
/// present in the baseline in identity order.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ChangeSet {
    /// Entries, no-ops included.
    pub entries: Vec<ChangeEntry>,
}

/// Counts of each action in a change-set.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeSummary {
    /// Resources to create.
    pub create: usize,
    /// Resources to update in place.
    pub update: usize,
    /// Resources to replace.
    pub replace: usize,
    /// Resources to delete.
    pub delete: usize,
    /// Resources left unchanged.
    pub no_op: usize,
}

impl DiffEngine {
    /// Creates a diff engine using the given schemas.
    #[must_use]
    pub const fn new(schemas: SchemaRegistry) -> Self {
        Self { schemas }
    }

    /// Gets the schema registry.
    #[must_use]
    pub const fn schemas(&self) -> &SchemaRegistry {
        &self.schemas
    }

    /// Computes the change-set from `baseline` to `desired`.
    ///
    /// # Errors
    ///
    /// Returns [`GraphError::Cycle`] if either graph is cyclic.
    pub fn diff(&self, desired: &ResourceGraph, baseline: &StateSnapshot) -> Result<ChangeSet, GraphError> {
        let order = desired.topological_order()?;
        let desired_ranks = desired.depths()?;
        let baseline_ranks = baseline.declared_graph().depths()?;

        // Identities whose outputs are not known until apply.
        let mut unsettled: BTreeSet<ResourceId> = BTreeSet::new();
        // Identities whose old instance is deleted before the new one exists.
        let mut deleted_first: BTreeSet<ResourceId> = BTreeSet::new();
        let mut entries = Vec::with_capacity(order.len() + baseline.len());

        for id in &order {
            let Some(resource) = desired.get(id) else {
                continue;
            };
            let rank = desired_ranks.get(id).copied().unwrap_or(0);

            let entry = match baseline.get(id) {
                None => ChangeEntry {
                    id: id.clone(),
                    action: ChangeAction::Create,
                    changes: Vec::new(),
                    replace_reasons: Vec::new(),
                    rank,
                    desired: Some(resource.clone()),
                    prior: None,
                    deposed: false,
                },
                Some(prior) => self.compare(resource, prior, baseline, &unsettled, &deleted_first, rank),
            };

            if matches!(entry.action, ChangeAction::Create | ChangeAction::Replace(_)) {
                unsettled.insert(id.clone());
            }
            if entry.action == ChangeAction::Replace(ReplacementStrategy::DeleteBeforeCreate) {
                deleted_first.insert(id.clone());
            }
            debug!("{} -> {}", id, entry.action);
            entries.push(entry);
        }

        for (id, prior) in &baseline.resources {
            if desired.contains(id) {
                continue;
            }
            entries.push(ChangeEntry {
                id: id.clone(),
                action: ChangeAction::Delete,
                changes: Vec::new(),
                replace_reasons: Vec::new(),
                rank: baseline_ranks.get(id).copied().unwrap_or(0),
                desired: None,
                prior: Some(prior.clone()),
                deposed: false,
            });
        }

        for prior in &baseline.deposed {
            debug!("{} has a deposed instance {}", prior.id(), prior.provider_id);
            entries.push(ChangeEntry {
                id: prior.id().clone(),
                action: ChangeAction::Delete,
                changes: Vec::new(),
                replace_reasons: Vec::new(),
                rank: baseline_ranks.get(prior.id()).copied().unwrap_or(0),
                desired: None,
                prior: Some(prior.clone()),
                deposed: true,
            });
        }

        Ok(ChangeSet { entries })
    }

    /// Compares one desired resource with its recorded state.
    fn compare(
        &self,
        resource: &Resource,
        prior: &ResourceState,
        baseline: &StateSnapshot,
        unsettled: &BTreeSet<ResourceId>,
        deleted_first: &BTreeSet<ResourceId>,
        rank: usize,
    ) -> ChangeEntry {
        let schema = self.schemas.schema_for(&resource.id.resource_type);
        let computed = self.schemas.computed_attributes(resource);
        let resolved = resolve_planned(resource, baseline, unsettled);

        let keys: BTreeSet<&String> = resolved
            .keys()
            .chain(prior.attributes.keys())
            .filter(|key| !computed.contains(*key))
            .collect();

        let changes: Vec<AttributeChange> = keys
            .into_iter()
            .filter_map(|key| {
                let before = prior.attributes.get(key);
                let after = resolved.get(key);
                if values_match(before, after) {
                    return None;
                }
                Some(
                    AttributeChange::new(key.clone(), before.cloned(), after.cloned())
                        .with_forces_replacement(schema.is_immutable(key)),
                )
            })
            .collect();

        let mut replace_reasons: Vec<String> = changes
            .iter()
            .filter(|c| c.forces_replacement)
            .map(|c| c.attribute.clone())
            .collect();
        if prior.is_tainted() {
            replace_reasons.push(String::from(TAINTED_REASON));
        }

        // A dependency deleted before it is recreated cannot go while this
        // resource still points at it, so this resource goes first as well.
        let wanted = resource.dependencies();
        let blocking: Vec<String> = prior
            .resource
            .dependencies()
            .into_iter()
            .filter(|dep| wanted.contains(dep) && deleted_first.contains(dep))
            .map(|dep| format!("{REPLACED_DEPENDENCY_REASON} {dep}"))
            .collect();
        let forced = !blocking.is_empty();
        replace_reasons.extend(blocking);

        let action = if forced {
            debug!("{} replaced delete-before-create with its dependencies", resource.id);
            ChangeAction::Replace(ReplacementStrategy::DeleteBeforeCreate)
        } else if !replace_reasons.is_empty() {
            ChangeAction::Replace(schema.replacement_strategy())
        } else if !changes.is_empty() {
            ChangeAction::Update
        } else {
            ChangeAction::NoOp
        };

        ChangeEntry {
            id: resource.id.clone(),
            action,
            changes,
            replace_reasons,
            rank,
            desired: Some(resource.clone()),
            prior: Some(prior.clone()),
            deposed: false,
        }
    }
}

/// Resolves references as they will look once the plan runs.
///
/// A reference to an unsettled resource (being created or replaced) is
/// unknown; otherwise it takes the recorded output or attribute, or unknown
/// if the baseline has no such value.
fn resolve_planned(
    resource: &Resource,
    baseline: &StateSnapshot,
    unsettled: &BTreeSet<ResourceId>,
) -> BTreeMap<String, AttributeValue> {
    let resolve = |reference: &AttributeRef| {
        if unsettled.contains(&reference.resource) {
            return AttributeValue::unknown();
        }
        baseline
            .value_of(&reference.resource, &reference.attribute)
            .cloned()
            .unwrap_or_else(AttributeValue::unknown)
    };

    resource
        .attributes
        .iter()
        .map(|(name, value)| (name.clone(), value.resolve_with(&resolve)))
        .collect()
}

/// Unknown values never match anything, not even another unknown.
fn values_match(before: Option<&AttributeValue>, after: Option<&AttributeValue>) -> bool {
    match (before, after) {
        (None, None) => true,
        (Some(b), Some(a)) => !a.contains_unknown() && !b.contains_unknown() && a == b,
        _ => false,
    }
}

impl AttributeChange {
    /// Creates an in-place attribute change.
    #[must_use]
    pub fn new(
        attribute: impl Into<String>,
        before: Option<AttributeValue>,
        after: Option<AttributeValue>,
    ) -> Self {
        Self {
            attribute: attribute.into(),
            before,
            after,
            forces_replacement: false,
        }
    }

    /// Sets whether the change forces replacement.
    #[must_use]
    pub const fn with_forces_replacement(mut self, forces_replacement: bool) -> Self {
        self.forces_replacement = forces_replacement;
        self
    }
}

impl ChangeAction {
    /// Returns true unless this is a no-op.
    #[must_use]
    pub const fn is_change(&self) -> bool {
        !matches!(self, Self::NoOp)
    }

    /// Plan symbol for the action.
    #[must_use]
    pub const fn symbol(&self) -> &'static str {
        match self {
            Self::Create => "+",
            Self::Update => "~",
            Self::Delete => "-",
            Self::NoOp => " ",
            Self::Replace(ReplacementStrategy::CreateBeforeDelete) => "+/-",
            Self::Replace(ReplacementStrategy::DeleteBeforeCreate) => "-/+",
        }
    }
}

impl ChangeEntry {
    /// Returns true if something happens to this resource.
    #[must_use]
    pub const fn has_changes(&self) -> bool {
        self.action.is_change()
    }
}

impl ChangeSet {
    /// Gets the entry for a resource.
    #[must_use]
    pub fn get(&self, id: &ResourceId) -> Option<&ChangeEntry> {
        self.entries.iter().find(|e| &e.id == id)
    }

    /// Entries that change something.
    pub fn changes(&self) -> impl Iterator<Item = &ChangeEntry> {
        self.entries.iter().filter(|e| e.has_changes())
    }

    /// Checks if there are any changes.
    #[must_use]
    pub fn has_changes(&self) -> bool {
        self.entries.iter().any(ChangeEntry::has_changes)
    }

    /// Identities of changed resources, in change-set order.
    #[must_use]
    pub fn changed_ids(&self) -> Vec<ResourceId> {
        self.changes().map(|e| e.id.clone()).collect()
    }

    /// Counts entries per action.
    #[must_use]
    pub fn summary(&self) -> ChangeSummary {
        let mut summary = ChangeSummary::default();
        for entry in &self.entries {
            match entry.action {
                ChangeAction::Create => summary.create += 1,
                ChangeAction::Update => summary.update += 1,
                ChangeAction::Delete => summary.delete += 1,
                ChangeAction::NoOp => summary.no_op += 1,
                ChangeAction::Replace(_) => summary.replace += 1,
            }
        }
        summary
    }
}

impl ChangeSummary {
    /// Total number of changed resources.
    #[must_use]
    pub const fn total_changes(&self) -> usize {
        self.create + self.update + self.replace + self.delete
    }

    /// Returns true if nothing changes.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.total_changes() == 0
    }
}

impl fmt::Display for ChangeAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Create => write!(f, "create"),
            Self::Update => write!(f, "update"),
            Self::Delete => write!(f, "delete"),
            Self::NoOp => write!(f, "no-op"),
            Self::Replace(ReplacementStrategy::CreateBeforeDelete) => {
                write!(f, "replace (create before delete)")
            }
            Self::Replace(ReplacementStrategy::DeleteBeforeCreate) => {
                write!(f, "replace (delete before create)")
            }
        }
    }
}

impl fmt::Display for AttributeChange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let render = |value: &Option<AttributeValue>| {
            value
                .as_ref()
                .map_or_else(|| String::from("(none)"), ToString::to_string)
        };
        write!(
            f,
            "{}: {} => {}",
            self.attribute,
            render(&self.before),
            render(&self.after)
        )?;
        if self.forces_replacement {
            write!(f, " (forces replacement)")?;
        }
        Ok(())
    }
}

impl fmt::Display for ChangeEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.action.symbol(), self.id)?;
        if self.deposed {
            write!(f, " (deposed {})", self.prior.as_ref().map_or("?", |p| p.provider_id.as_str()))?;
        }
        if self.replace_reasons.iter().any(|r| r == TAINTED_REASON) {
            write!(f, " (tainted)")?;
        }
        Ok(())
    }
}

impl fmt::Display for ChangeSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} to create, {} to update, {} to replace, {} to delete",
            self.create, self.update, self.replace, self.delete
        )
    }
}

impl fmt::Display for ChangeSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.has_changes() {
            return writeln!(f, "No changes. Recorded state matches the desired graph.");
        }

        for entry in self.changes() {
            writeln!(f, "{entry}")?;
            for change in &entry.changes {
                writeln!(f, "    {change}")?;
            }
        }
        writeln!(f)?;
        writeln!(f, "Summary: {}", self.summary())
    }
}
