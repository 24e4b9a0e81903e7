//! The resource graph: resources keyed by identity plus dependency edges.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

use crate::error::GraphError;

use super::resource::{Resource, ResourceId};

/// A validated set of resources and their dependency edges.
///
/// An edge `A -> B` means A depends on B (B must exist first).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "GraphDocument", into = "GraphDocument")]
pub struct ResourceGraph {
    resources: BTreeMap<ResourceId, Resource>,
}

/// On-disk shape of a graph.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GraphDocument {
    /// Resources in any order.
    #[serde(default)]
    pub resources: Vec<Resource>,
}

impl ResourceGraph {
    /// Creates an empty graph.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            resources: BTreeMap::new(),
        }
    }

    /// Builds and validates a graph.
    ///
    /// # Errors
    ///
    /// Fails on duplicate identities, dangling references or cycles.
    pub fn from_resources(resources: impl IntoIterator<Item = Resource>) -> Result<Self, GraphError> {
        let mut graph = Self::new();
        for resource in resources {
            graph.insert(resource)?;
        }
        graph.validate()?;
        Ok(graph)
    }

    /// Builds a graph without checking edges.
    ///
    /// A later resource with an identity already seen replaces the earlier
    /// one. Used for recorded state, whose references may point at
    /// resources that no longer exist.
    #[must_use]
    pub fn from_unchecked(resources: impl IntoIterator<Item = Resource>) -> Self {
        Self {
            resources: resources.into_iter().map(|r| (r.id.clone(), r)).collect(),
        }
    }

    /// Inserts a resource without checking edges.
    ///
    /// # Errors
    ///
    /// Fails if a resource with the same identity already exists.
    pub fn insert(&mut self, resource: Resource) -> Result<(), GraphError> {
        if self.resources.contains_key(&resource.id) {
            return Err(GraphError::DuplicateIdentity { id: resource.id });
        }
        self.resources.insert(resource.id.clone(), resource);
        Ok(())
    }

    /// Removes a resource.
    pub fn remove(&mut self, id: &ResourceId) -> Option<Resource> {
        self.resources.remove(id)
    }

    /// Gets a resource by identity.
    #[must_use]
    pub fn get(&self, id: &ResourceId) -> Option<&Resource> {
        self.resources.get(id)
    }

    /// Returns true if the identity is present.
    #[must_use]
    pub fn contains(&self, id: &ResourceId) -> bool {
        self.resources.contains_key(id)
    }

    /// Number of resources.
    #[must_use]
    pub fn len(&self) -> usize {
        self.resources.len()
    }

    /// Returns true if the graph has no resources.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }

    /// Iterates resources in identity order.
    pub fn resources(&self) -> impl Iterator<Item = &Resource> {
        self.resources.values()
    }

    /// Iterates identities in order.
    pub fn ids(&self) -> impl Iterator<Item = &ResourceId> {
        self.resources.keys()
    }

    /// Checks identities, references and acyclicity.
    ///
    /// # Errors
    ///
    /// Returns the first problem found, checking references before cycles.
    pub fn validate(&self) -> Result<(), GraphError> {
        for resource in self.resources.values() {
            for dep in resource.dependencies() {
                if dep == resource.id {
                    return Err(GraphError::Cycle {
                        path: vec![dep.clone(), dep],
                    });
                }
                if !self.resources.contains_key(&dep) {
                    return Err(GraphError::DanglingReference {
                        from: resource.id.clone(),
                        to: dep,
                    });
                }
            }
        }

        self.topological_order().map(|order| {
            debug!("Graph of {} resources validated", order.len());
        })
    }

    /// Returns identities so that every resource comes after its dependencies.
    ///
    /// Ties are broken by identity order, so the result is deterministic.
    /// Edges to identities outside the graph are ignored.
    ///
    /// # Errors
    ///
    /// Returns [`GraphError::Cycle`] if no order exists.
    pub fn topological_order(&self) -> Result<Vec<ResourceId>, GraphError> {
        let mut pending: BTreeMap<&ResourceId, usize> = BTreeMap::new();
        let mut dependents: BTreeMap<&ResourceId, Vec<&ResourceId>> = BTreeMap::new();

        for (id, resource) in &self.resources {
            let deps: Vec<ResourceId> = resource
                .dependencies()
                .into_iter()
                .filter(|d| self.resources.contains_key(d))
                .collect();
            pending.insert(id, deps.len());
            for dep in deps {
                if let Some((key, _)) = self.resources.get_key_value(&dep) {
                    dependents.entry(key).or_default().push(id);
                }
            }
        }

        let mut ready: BTreeSet<&ResourceId> = pending
            .iter()
            .filter(|(_, count)| **count == 0)
            .map(|(id, _)| *id)
            .collect();
        let mut order = Vec::with_capacity(self.resources.len());

        while let Some(id) = ready.pop_first() {
            order.push(id.clone());
            for dependent in dependents.get(id).into_iter().flatten() {
                if let Some(count) = pending.get_mut(dependent) {
                    *count -= 1;
                    if *count == 0 {
                        ready.insert(*dependent);
                    }
                }
            }
        }

        if order.len() == self.resources.len() {
            return Ok(order);
        }

        let placed: BTreeSet<&ResourceId> = order.iter().collect();
        let remaining: BTreeSet<&ResourceId> = self
            .resources
            .keys()
            .filter(|id| !placed.contains(id))
            .collect();
        Err(GraphError::Cycle {
            path: self.find_cycle(&remaining),
        })
    }

    /// Walks dependency edges among `remaining` until a node repeats.
    fn find_cycle(&self, remaining: &BTreeSet<&ResourceId>) -> Vec<ResourceId> {
        let Some(start) = remaining.first() else {
            return Vec::new();
        };

        let mut path: Vec<ResourceId> = Vec::new();
        let mut current: ResourceId = (*start).clone();

        loop {
            if let Some(pos) = path.iter().position(|p| *p == current) {
                let mut cycle = path.split_off(pos);
                cycle.push(current);
                return cycle;
            }
            path.push(current.clone());

            let next = self
                .resources
                .get(&current)
                .and_then(|r| r.dependencies().into_iter().find(|d| remaining.contains(d)));
            match next {
                Some(dep) => current = dep,
                None => return path,
            }
        }
    }

    /// Returns the dependencies of a resource that exist in this graph.
    #[must_use]
    pub fn dependencies_of(&self, id: &ResourceId) -> BTreeSet<ResourceId> {
        self.resources
            .get(id)
            .map(|r| {
                r.dependencies()
                    .into_iter()
                    .filter(|d| self.resources.contains_key(d))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Returns the resources that depend on `id`.
    #[must_use]
    pub fn dependents_of(&self, id: &ResourceId) -> BTreeSet<ResourceId> {
        self.resources
            .values()
            .filter(|r| r.dependencies().contains(id))
            .map(|r| r.id.clone())
            .collect()
    }

    /// Longest dependency path from a root to each resource (roots are 0).
    ///
    /// # Errors
    ///
    /// Returns [`GraphError::Cycle`] if the graph is cyclic.
    pub fn depths(&self) -> Result<BTreeMap<ResourceId, usize>, GraphError> {
        let mut depths = BTreeMap::new();
        for id in self.topological_order()? {
            let depth = self
                .dependencies_of(&id)
                .iter()
                .filter_map(|d| depths.get(d))
                .map(|d| d + 1)
                .max()
                .unwrap_or(0);
            depths.insert(id, depth);
        }
        Ok(depths)
    }

    /// Longest dependency path from a root to `id`, if `id` is in the graph.
    ///
    /// # Errors
    ///
    /// Returns [`GraphError::Cycle`] if the graph is cyclic.
    pub fn depth(&self, id: &ResourceId) -> Result<Option<usize>, GraphError> {
        Ok(self.depths()?.get(id).copied())
    }
}

impl TryFrom<GraphDocument> for ResourceGraph {
    type Error = GraphError;

    fn try_from(doc: GraphDocument) -> Result<Self, Self::Error> {
        Self::from_resources(doc.resources)
    }
}

impl From<ResourceGraph> for GraphDocument {
    fn from(graph: ResourceGraph) -> Self {
        Self {
            resources: graph.resources.into_values().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn network() -> Vec<Resource> {
        let vpc = Resource::new("vpc", "main").with_attribute("cidr_block", "10.0.0.0/16");
        let subnet = Resource::new("subnet", "a")
            .with_attribute("cidr_block", "10.0.1.0/24")
            .with_reference("vpc_id", &vpc.id, "id");
        let instance = Resource::new("instance", "web")
            .with_attribute("ami", "ami-123")
            .with_reference("subnet_id", &subnet.id, "id");
        vec![instance, subnet, vpc]
    }

    #[test]
    fn test_topological_order_respects_dependencies() {
        let graph = ResourceGraph::from_resources(network()).expect("valid graph");
        let order: Vec<String> = graph
            .topological_order()
            .expect("acyclic")
            .iter()
            .map(ToString::to_string)
            .collect();
        assert_eq!(order, vec!["vpc.main", "subnet.a", "instance.web"]);
    }

    #[test]
    fn test_topological_order_breaks_ties_lexicographically() {
        let graph = ResourceGraph::from_resources(vec![
            Resource::new("vpc", "b"),
            Resource::new("iam_role", "z"),
            Resource::new("vpc", "a"),
        ])
        .expect("valid graph");

        let order: Vec<String> = graph
            .topological_order()
            .expect("acyclic")
            .iter()
            .map(ToString::to_string)
            .collect();
        assert_eq!(order, vec!["iam_role.z", "vpc.a", "vpc.b"]);
    }

    #[test]
    fn test_duplicate_identity_rejected() {
        let result = ResourceGraph::from_resources(vec![
            Resource::new("vpc", "main"),
            Resource::new("vpc", "main"),
        ]);
        assert_eq!(
            result,
            Err(GraphError::DuplicateIdentity {
                id: ResourceId::new("vpc", "main")
            })
        );
    }

    #[test]
    fn test_dangling_reference_rejected() {
        let missing = ResourceId::new("vpc", "ghost");
        let result = ResourceGraph::from_resources(vec![
            Resource::new("subnet", "a").with_reference("vpc_id", &missing, "id"),
        ]);
        assert!(matches!(result, Err(GraphError::DanglingReference { to, .. }) if to == missing));
    }

    #[test]
    fn test_cycle_rejected_with_path() {
        let a = ResourceId::new("security_group", "a");
        let b = ResourceId::new("security_group", "b");
        let c = ResourceId::new("security_group", "c");
        let result = ResourceGraph::from_resources(vec![
            Resource::new("security_group", "a").with_reference("peer", &b, "id"),
            Resource::new("security_group", "b").with_reference("peer", &c, "id"),
            Resource::new("security_group", "c").with_dependency(&a),
        ]);

        let Err(GraphError::Cycle { path }) = result else {
            panic!("expected a cycle error");
        };
        assert_eq!(path.first(), path.last());
        assert_eq!(path.len(), 4);
    }

    #[test]
    fn test_self_reference_is_a_cycle() {
        let id = ResourceId::new("instance", "loop");
        let result =
            ResourceGraph::from_resources(vec![Resource::new("instance", "loop").with_dependency(&id)]);
        assert!(matches!(result, Err(GraphError::Cycle { .. })));
    }

    #[test]
    fn test_depths_and_dependents() {
        let graph = ResourceGraph::from_resources(network()).expect("valid graph");
        let depths = graph.depths().expect("acyclic");
        assert_eq!(depths[&ResourceId::new("vpc", "main")], 0);
        assert_eq!(depths[&ResourceId::new("subnet", "a")], 1);
        assert_eq!(depths[&ResourceId::new("instance", "web")], 2);
        assert_eq!(graph.depth(&ResourceId::new("subnet", "a")), Ok(Some(1)));
        assert_eq!(graph.depth(&ResourceId::new("queue", "missing")), Ok(None));

        let dependents = graph.dependents_of(&ResourceId::new("vpc", "main"));
        assert!(dependents.contains(&ResourceId::new("subnet", "a")));
        assert_eq!(dependents.len(), 1);
    }

    #[test]
    fn test_document_deserialization_validates() {
        let yaml = r#"
resources:
  - id: subnet.a
    attributes:
      vpc_id: { $ref: vpc.missing, attribute: id }
"#;
        let parsed: Result<ResourceGraph, _> = serde_yaml::from_str(yaml);
        assert!(parsed.is_err());
    }
}
