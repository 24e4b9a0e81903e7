//! Persisted state snapshot types.
//!
//! A snapshot is the record of what the engine last applied. It is the
//! baseline for planning and the only thing the executor writes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::error::StateError;
use crate::graph::{AttributeValue, Resource, ResourceGraph, ResourceId};

use super::lock::LockInfo;

/// Current version of the snapshot format.
pub const STATE_VERSION: u32 = 1;

/// Number of history entries retained in a snapshot.
pub const MAX_HISTORY: usize = 100;

/// The complete persisted state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateSnapshot {
    /// Snapshot format version.
    pub version: u32,
    /// Identity of the store this snapshot belongs to.
    pub lineage: String,
    /// Monotonic write counter.
    pub serial: u64,
    /// Applied resources, serialized as a list ordered by identity.
    #[serde(with = "resource_list")]
    pub resources: BTreeMap<ResourceId, ResourceState>,
    /// Old instances of replaced resources whose delete is not yet confirmed.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub deposed: Vec<ResourceState>,
    /// Lock held by the writer when the snapshot was written.
    #[serde(default)]
    pub lock: Option<LockInfo>,
    /// Revision of the desired graph that produced this snapshot.
    #[serde(default)]
    pub desired_revision: Option<String>,
    /// When the snapshot was last updated.
    pub last_updated: DateTime<Utc>,
    /// Recent runs that wrote this snapshot.
    #[serde(default)]
    pub history: Vec<HistoryEntry>,
}

/// Applied state of a single resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceState {
    /// The declaration as it was applied, references unresolved.
    pub resource: Resource,
    /// Provider-side identifier.
    pub provider_id: String,
    /// Attributes as sent to the provider, references resolved.
    #[serde(default)]
    pub attributes: BTreeMap<String, AttributeValue>,
    /// Computed attributes returned by the provider.
    #[serde(default)]
    pub outputs: BTreeMap<String, AttributeValue>,
    /// Whether the resource reached a confirmed state.
    pub status: ResourceStatus,
    /// Hash of the applied attributes.
    pub config_hash: String,
    /// When the resource was created.
    pub created_at: DateTime<Utc>,
    /// When the resource was last changed.
    pub updated_at: DateTime<Utc>,
}

/// Confirmation status of an applied resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceStatus {
    /// The provider confirmed the last operation.
    Ready,
    /// The resource exists but its last operation never confirmed.
    Tainted,
}

/// A single entry in the snapshot history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    /// When the run wrote the snapshot.
    pub timestamp: DateTime<Utc>,
    /// Pipeline run or CLI invocation identifier.
    pub run_id: String,
    /// Desired revision applied.
    #[serde(default)]
    pub revision: Option<String>,
    /// Kind of operation.
    pub operation: HistoryOperation,
    /// Resources changed by the run.
    pub changed: Vec<String>,
    /// Whether the run completed every step.
    pub success: bool,
    /// Optional error message.
    #[serde(default)]
    pub error: Option<String>,
}

/// Operations recorded in history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HistoryOperation {
    /// Convergence of a desired revision.
    Apply,
    /// Convergence after refreshing from live state.
    Remediate,
}

impl StateSnapshot {
    /// Creates an empty snapshot for a new lineage.
    #[must_use]
    pub fn new() -> Self {
        Self::with_lineage(Uuid::new_v4().to_string())
    }

    /// Creates an empty snapshot with an explicit lineage.
    #[must_use]
    pub fn with_lineage(lineage: impl Into<String>) -> Self {
        Self {
            version: STATE_VERSION,
            lineage: lineage.into(),
            serial: 0,
            resources: BTreeMap::new(),
            deposed: Vec::new(),
            lock: None,
            desired_revision: None,
            last_updated: Utc::now(),
            history: Vec::new(),
        }
    }

    /// Rejects snapshots written by an unsupported format version.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::VersionMismatch`] for any other version.
    pub fn check_version(&self) -> Result<(), StateError> {
        if self.version == STATE_VERSION {
            Ok(())
        } else {
            Err(StateError::VersionMismatch {
                expected: STATE_VERSION,
                found: self.version,
            })
        }
    }

    /// Gets a resource by identity.
    #[must_use]
    pub fn get(&self, id: &ResourceId) -> Option<&ResourceState> {
        self.resources.get(id)
    }

    /// Returns true if the identity is recorded.
    #[must_use]
    pub fn contains(&self, id: &ResourceId) -> bool {
        self.resources.contains_key(id)
    }

    /// Adds or replaces a resource.
    pub fn set_resource(&mut self, state: ResourceState) {
        self.resources.insert(state.resource.id.clone(), state);
        self.last_updated = Utc::now();
    }

    /// Removes a resource.
    pub fn remove_resource(&mut self, id: &ResourceId) -> Option<ResourceState> {
        let result = self.resources.remove(id);
        if result.is_some() {
            self.last_updated = Utc::now();
        }
        result
    }

    /// Moves the recorded instance of `id` to the deposed list.
    ///
    /// The instance stays tracked until [`Self::remove_deposed`] confirms it
    /// is gone.
    pub fn depose(&mut self, id: &ResourceId) -> Option<&ResourceState> {
        let state = self.resources.remove(id)?;
        self.last_updated = Utc::now();
        self.deposed.push(state);
        self.deposed.last()
    }

    /// Forgets a deposed instance once its delete is confirmed.
    pub fn remove_deposed(&mut self, id: &ResourceId, provider_id: &str) -> bool {
        let before = self.deposed.len();
        self.deposed
            .retain(|d| !(d.id() == id && d.provider_id == provider_id));
        let removed = self.deposed.len() != before;
        if removed {
            self.last_updated = Utc::now();
        }
        removed
    }

    /// Looks up an output, then an applied attribute, of a resource.
    #[must_use]
    pub fn value_of(&self, id: &ResourceId, attribute: &str) -> Option<&AttributeValue> {
        self.resources.get(id).and_then(|r| r.value(attribute))
    }

    /// The recorded declarations as a graph.
    #[must_use]
    pub fn declared_graph(&self) -> ResourceGraph {
        ResourceGraph::from_unchecked(self.resources.values().map(|r| r.resource.clone()))
    }

    /// Resources whose last operation never confirmed.
    #[must_use]
    pub fn tainted(&self) -> Vec<&ResourceId> {
        self.resources
            .values()
            .filter(|r| r.is_tainted())
            .map(|r| &r.resource.id)
            .collect()
    }

    /// Number of recorded resources.
    #[must_use]
    pub fn len(&self) -> usize {
        self.resources.len()
    }

    /// Returns true if no resources are recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }

    /// Appends a history entry, dropping the oldest beyond the cap.
    pub fn add_history(&mut self, entry: HistoryEntry) {
        if self.history.len() >= MAX_HISTORY {
            let excess = self.history.len() + 1 - MAX_HISTORY;
            self.history.drain(..excess);
        }
        self.history.push(entry);
    }
}

impl Default for StateSnapshot {
    fn default() -> Self {
        Self::new()
    }
}

impl ResourceState {
    /// Creates a ready resource state.
    #[must_use]
    pub fn new(
        resource: Resource,
        provider_id: impl Into<String>,
        attributes: BTreeMap<String, AttributeValue>,
        outputs: BTreeMap<String, AttributeValue>,
        config_hash: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            resource,
            provider_id: provider_id.into(),
            attributes,
            outputs,
            status: ResourceStatus::Ready,
            config_hash: config_hash.into(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Identity of the resource.
    #[must_use]
    pub const fn id(&self) -> &ResourceId {
        &self.resource.id
    }

    /// Looks up an output, then an applied attribute.
    #[must_use]
    pub fn value(&self, attribute: &str) -> Option<&AttributeValue> {
        self.outputs
            .get(attribute)
            .or_else(|| self.attributes.get(attribute))
    }

    /// Returns true if the last operation never confirmed.
    #[must_use]
    pub const fn is_tainted(&self) -> bool {
        matches!(self.status, ResourceStatus::Tainted)
    }

    /// Updates the status.
    pub fn set_status(&mut self, status: ResourceStatus) {
        self.status = status;
        self.updated_at = Utc::now();
    }
}

impl HistoryEntry {
    /// Creates a successful history entry.
    #[must_use]
    pub fn new(
        run_id: impl Into<String>,
        operation: HistoryOperation,
        revision: Option<String>,
        changed: Vec<String>,
    ) -> Self {
        Self {
            timestamp: Utc::now(),
            run_id: run_id.into(),
            revision,
            operation,
            changed,
            success: true,
            error: None,
        }
    }

    /// Marks the entry as failed.
    #[must_use]
    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.success = false;
        self.error = Some(error.into());
        self
    }
}

impl std::fmt::Display for ResourceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let status = match self {
            Self::Ready => "ready",
            Self::Tainted => "tainted",
        };
        write!(f, "{status}")
    }
}

impl std::fmt::Display for HistoryOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let op = match self {
            Self::Apply => "apply",
            Self::Remediate => "remediate",
        };
        write!(f, "{op}")
    }
}

mod resource_list {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::collections::BTreeMap;

    use super::ResourceState;
    use crate::graph::ResourceId;

    pub fn serialize<S>(
        resources: &BTreeMap<ResourceId, ResourceState>,
        serializer: S,
    ) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let list: Vec<&ResourceState> = resources.values().collect();
        list.serialize(serializer)
    }

    pub fn deserialize<'de, D>(
        deserializer: D,
    ) -> Result<BTreeMap<ResourceId, ResourceState>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let list = Vec::<ResourceState>::deserialize(deserializer)?;
        let mut resources = BTreeMap::new();
        for state in list {
            let id = state.resource.id.clone();
            if resources.insert(id.clone(), state).is_some() {
                return Err(serde::de::Error::custom(format!(
                    "duplicate resource {id} in state"
                )));
            }
        }
        Ok(resources)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vpc_state() -> ResourceState {
        ResourceState::new(
            Resource::new("vpc", "main").with_attribute("cidr_block", "10.0.0.0/16"),
            "vpc-123",
            BTreeMap::from([(String::from("cidr_block"), AttributeValue::from("10.0.0.0/16"))]),
            BTreeMap::from([(String::from("id"), AttributeValue::from("vpc-123"))]),
            "hash",
        )
    }

    #[test]
    fn test_new_snapshot_is_empty() {
        let snapshot = StateSnapshot::new();
        assert_eq!(snapshot.serial, 0);
        assert_eq!(snapshot.version, STATE_VERSION);
        assert!(snapshot.is_empty());
        assert!(!snapshot.lineage.is_empty());
    }

    #[test]
    fn test_value_prefers_outputs() {
        let mut snapshot = StateSnapshot::new();
        snapshot.set_resource(vpc_state());

        let id = ResourceId::new("vpc", "main");
        assert_eq!(
            snapshot.value_of(&id, "id"),
            Some(&AttributeValue::from("vpc-123"))
        );
        assert_eq!(
            snapshot.value_of(&id, "cidr_block"),
            Some(&AttributeValue::from("10.0.0.0/16"))
        );
        assert_eq!(snapshot.value_of(&id, "missing"), None);
    }

    #[test]
    fn test_resources_serialize_as_list() {
        let mut snapshot = StateSnapshot::with_lineage("lin-1");
        snapshot.set_resource(vpc_state());

        let json = serde_json::to_value(&snapshot).expect("serialize");
        assert!(json["resources"].is_array());
        assert_eq!(json["resources"][0]["resource"]["id"], "vpc.main");

        let parsed: StateSnapshot = serde_json::from_value(json).expect("deserialize");
        assert_eq!(parsed, snapshot);
    }

    #[test]
    fn test_duplicate_resources_rejected() {
        let mut snapshot = StateSnapshot::with_lineage("lin-1");
        snapshot.set_resource(vpc_state());
        let mut json = serde_json::to_value(&snapshot).expect("serialize");
        let entry = json["resources"][0].clone();
        json["resources"]
            .as_array_mut()
            .expect("array")
            .push(entry);

        assert!(serde_json::from_value::<StateSnapshot>(json).is_err());
    }

    #[test]
    fn test_deposed_instances_tracked_until_removed() {
        let mut snapshot = StateSnapshot::with_lineage("lin-1");
        snapshot.set_resource(vpc_state());
        let id = ResourceId::new("vpc", "main");

        let json = serde_json::to_value(&snapshot).expect("serialize");
        assert!(json.get("deposed").is_none());

        assert_eq!(snapshot.depose(&id).map(|d| d.provider_id.as_str()), Some("vpc-123"));
        assert!(!snapshot.contains(&id));
        assert!(snapshot.depose(&id).is_none());

        let json = serde_json::to_value(&snapshot).expect("serialize");
        let parsed: StateSnapshot = serde_json::from_value(json).expect("deserialize");
        assert_eq!(parsed.deposed.len(), 1);

        assert!(!snapshot.remove_deposed(&id, "vpc-999"));
        assert!(snapshot.remove_deposed(&id, "vpc-123"));
        assert!(snapshot.deposed.is_empty());
    }

    #[test]
    fn test_history_is_bounded() {
        let mut snapshot = StateSnapshot::new();
        for i in 0..(MAX_HISTORY + 5) {
            snapshot.add_history(HistoryEntry::new(
                format!("run-{i}"),
                HistoryOperation::Apply,
                None,
                Vec::new(),
            ));
        }
        assert_eq!(snapshot.history.len(), MAX_HISTORY);
        assert_eq!(snapshot.history[0].run_id, "run-5");
    }

    #[test]
    fn test_tainted_listing_and_version_check() {
        let mut snapshot = StateSnapshot::new();
        let mut state = vpc_state();
        state.set_status(ResourceStatus::Tainted);
        snapshot.set_resource(state);
        assert_eq!(snapshot.tainted(), vec![&ResourceId::new("vpc", "main")]);

        assert!(snapshot.check_version().is_ok());
        snapshot.version = 9;
        assert!(snapshot.check_version().is_err());
    }
}
