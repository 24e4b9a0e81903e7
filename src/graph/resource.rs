//! Resource identities and resource declarations.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use crate::error::GraphError;

use super::value::{AttributeRef, AttributeValue};

/// Identity of a resource: its type plus a logical name unique within the graph.
///
/// Ordering is lexicographic on type, then name. Rendered as `type.name`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ResourceId {
    /// Resource type (e.g. `vpc`, `instance`).
    pub resource_type: String,
    /// Logical name.
    pub name: String,
}

/// A declared resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resource {
    /// Identity.
    pub id: ResourceId,
    /// Declared attributes, possibly containing references.
    #[serde(default)]
    pub attributes: BTreeMap<String, AttributeValue>,
    /// Explicit dependencies in addition to those implied by references.
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub depends_on: BTreeSet<ResourceId>,
    /// Attributes whose values are only known after apply.
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub computed: BTreeSet<String>,
}

impl ResourceId {
    /// Creates a new identity.
    #[must_use]
    pub fn new(resource_type: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            resource_type: resource_type.into(),
            name: name.into(),
        }
    }

    /// Parses `type.name`. The name may itself contain dots.
    ///
    /// # Errors
    ///
    /// Returns an error if either part is missing or empty.
    pub fn parse(raw: &str) -> Result<Self, GraphError> {
        match raw.split_once('.') {
            Some((ty, name)) if !ty.is_empty() && !name.is_empty() => Ok(Self::new(ty, name)),
            _ => Err(GraphError::MalformedIdentity {
                raw: raw.to_string(),
            }),
        }
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.resource_type, self.name)
    }
}

impl FromStr for ResourceId {
    type Err = GraphError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for ResourceId {
    type Error = GraphError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::parse(&s)
    }
}

impl From<ResourceId> for String {
    fn from(id: ResourceId) -> Self {
        id.to_string()
    }
}

impl Resource {
    /// Creates a resource with no attributes.
    #[must_use]
    pub fn new(resource_type: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: ResourceId::new(resource_type, name),
            attributes: BTreeMap::new(),
            depends_on: BTreeSet::new(),
            computed: BTreeSet::new(),
        }
    }

    /// Sets an attribute.
    #[must_use]
    pub fn with_attribute(mut self, name: impl Into<String>, value: impl Into<AttributeValue>) -> Self {
        self.attributes.insert(name.into(), value.into());
        self
    }

    /// Sets an attribute to a reference to `target.attribute`.
    #[must_use]
    pub fn with_reference(
        mut self,
        name: impl Into<String>,
        target: &ResourceId,
        attribute: impl Into<String>,
    ) -> Self {
        self.attributes.insert(
            name.into(),
            AttributeValue::reference(target.clone(), attribute),
        );
        self
    }

    /// Adds an explicit dependency.
    #[must_use]
    pub fn with_dependency(mut self, target: &ResourceId) -> Self {
        self.depends_on.insert(target.clone());
        self
    }

    /// Marks an attribute as computed.
    #[must_use]
    pub fn with_computed(mut self, attribute: impl Into<String>) -> Self {
        self.computed.insert(attribute.into());
        self
    }

    /// Returns every reference held in this resource's attributes.
    #[must_use]
    pub fn references(&self) -> Vec<&AttributeRef> {
        let mut refs = Vec::new();
        for value in self.attributes.values() {
            value.collect_references(&mut refs);
        }
        refs
    }

    /// Returns all dependency edges: explicit ones plus referenced resources.
    #[must_use]
    pub fn dependencies(&self) -> BTreeSet<ResourceId> {
        let mut deps = self.depends_on.clone();
        deps.extend(self.references().into_iter().map(|r| r.resource.clone()));
        deps
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_parse_and_display() {
        let id = ResourceId::parse("subnet.private.a").expect("should parse");
        assert_eq!(id.resource_type, "subnet");
        assert_eq!(id.name, "private.a");
        assert_eq!(id.to_string(), "subnet.private.a");
    }

    #[test]
    fn test_identity_parse_rejects_malformed() {
        assert!(ResourceId::parse("vpc").is_err());
        assert!(ResourceId::parse(".main").is_err());
        assert!(ResourceId::parse("vpc.").is_err());
    }

    #[test]
    fn test_identity_ordering_is_type_then_name() {
        let mut ids = vec![
            ResourceId::new("vpc", "a"),
            ResourceId::new("subnet", "z"),
            ResourceId::new("subnet", "b"),
        ];
        ids.sort();
        let rendered: Vec<String> = ids.iter().map(ToString::to_string).collect();
        assert_eq!(rendered, vec!["subnet.b", "subnet.z", "vpc.a"]);
    }

    #[test]
    fn test_dependencies_union_explicit_and_references() {
        let vpc = ResourceId::new("vpc", "main");
        let role = ResourceId::new("iam_role", "app");
        let subnet = Resource::new("subnet", "a")
            .with_reference("vpc_id", &vpc, "id")
            .with_dependency(&role);

        let deps: Vec<ResourceId> = subnet.dependencies().into_iter().collect();
        assert_eq!(deps, vec![role, vpc]);
    }

    #[test]
    fn test_resource_yaml_shape() {
        let yaml = r#"
id: subnet.a
attributes:
  cidr_block: "10.0.1.0/24"
  vpc_id: { $ref: vpc.main, attribute: id }
depends_on: [iam_role.app]
"#;
        let resource: Resource = serde_yaml::from_str(yaml).expect("should parse");
        assert_eq!(resource.id, ResourceId::new("subnet", "a"));
        assert_eq!(resource.references().len(), 1);
        assert!(resource.depends_on.contains(&ResourceId::new("iam_role", "app")));
    }
}
