//! Per-type resource schemas and replacement policy.
//!
//! The schema registry answers three questions for the differ and the
//! validator: which attributes a type requires, which attributes cannot be
//! changed in place, and how a replacement is sequenced.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use crate::error::GraphError;

use super::model::ResourceGraph;
use super::resource::Resource;

/// How a replacement is sequenced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplacementStrategy {
    /// Create the new instance, then delete the old one.
    CreateBeforeDelete,
    /// Delete the old instance, then create the new one.
    DeleteBeforeCreate,
}

/// Schema for one resource type.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceTypeSchema {
    /// Attributes that must be declared.
    #[serde(default)]
    pub required: BTreeSet<String>,
    /// Attributes whose change forces replacement.
    #[serde(default)]
    pub immutable: BTreeSet<String>,
    /// Attributes set by the provider, never declared.
    #[serde(default)]
    pub computed: BTreeSet<String>,
    /// Whether two instances with the same declaration may coexist.
    #[serde(default)]
    pub parallel_identities: bool,
    /// Explicit replacement strategy, overriding the default.
    #[serde(default)]
    pub replacement: Option<ReplacementStrategy>,
}

/// Registry of resource type schemas.
#[derive(Debug, Clone)]
pub struct SchemaRegistry {
    schemas: BTreeMap<String, ResourceTypeSchema>,
    fallback: ResourceTypeSchema,
    strict: bool,
}

impl ResourceTypeSchema {
    /// Creates a schema with no constraints.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds required attributes.
    #[must_use]
    pub fn required(mut self, attrs: &[&str]) -> Self {
        self.required.extend(attrs.iter().map(|a| (*a).to_string()));
        self
    }

    /// Adds immutable attributes.
    #[must_use]
    pub fn immutable(mut self, attrs: &[&str]) -> Self {
        self.immutable.extend(attrs.iter().map(|a| (*a).to_string()));
        self
    }

    /// Adds computed attributes.
    #[must_use]
    pub fn computed(mut self, attrs: &[&str]) -> Self {
        self.computed.extend(attrs.iter().map(|a| (*a).to_string()));
        self
    }

    /// Sets whether parallel identities are supported.
    #[must_use]
    pub const fn parallel(mut self, parallel_identities: bool) -> Self {
        self.parallel_identities = parallel_identities;
        self
    }

    /// Sets an explicit replacement strategy.
    #[must_use]
    pub const fn with_replacement(mut self, strategy: ReplacementStrategy) -> Self {
        self.replacement = Some(strategy);
        self
    }

    /// The strategy used when an instance must be replaced.
    #[must_use]
    pub fn replacement_strategy(&self) -> ReplacementStrategy {
        self.replacement.unwrap_or(if self.parallel_identities {
            ReplacementStrategy::CreateBeforeDelete
        } else {
            ReplacementStrategy::DeleteBeforeCreate
        })
    }

    /// Returns true if changing `attribute` requires replacement.
    #[must_use]
    pub fn is_immutable(&self, attribute: &str) -> bool {
        self.immutable.contains(attribute)
    }
}

impl Default for SchemaRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

impl SchemaRegistry {
    /// Creates an empty, permissive registry.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            schemas: BTreeMap::new(),
            fallback: ResourceTypeSchema::new().computed(&["id"]),
            strict: false,
        }
    }

    /// Creates a registry with the built-in cloud resource types.
    #[must_use]
    pub fn builtin() -> Self {
        let mut registry = Self::empty();
        registry.register(
            "vpc",
            ResourceTypeSchema::new()
                .required(&["cidr_block"])
                .immutable(&["cidr_block"])
                .computed(&["id", "arn"])
                .parallel(true),
        );
        registry.register(
            "subnet",
            ResourceTypeSchema::new()
                .required(&["vpc_id", "cidr_block"])
                .immutable(&["vpc_id", "cidr_block", "availability_zone"])
                .computed(&["id", "arn"]),
        );
        registry.register(
            "security_group",
            ResourceTypeSchema::new()
                .required(&["vpc_id"])
                .immutable(&["vpc_id", "name"])
                .computed(&["id", "arn"]),
        );
        registry.register(
            "load_balancer",
            ResourceTypeSchema::new()
                .required(&["subnets"])
                .immutable(&["name", "scheme", "type"])
                .computed(&["id", "arn", "dns_name"]),
        );
        registry.register(
            "target_group",
            ResourceTypeSchema::new()
                .required(&["port", "protocol", "vpc_id"])
                .immutable(&["name", "port", "protocol", "vpc_id"])
                .computed(&["id", "arn"]),
        );
        registry.register(
            "instance",
            ResourceTypeSchema::new()
                .required(&["ami", "instance_type"])
                .immutable(&["ami", "availability_zone", "user_data"])
                .computed(&["id", "private_ip", "public_ip"])
                .parallel(true),
        );
        registry.register(
            "iam_role",
            ResourceTypeSchema::new()
                .required(&["assume_role_policy"])
                .immutable(&["name", "path"])
                .computed(&["id", "arn"]),
        );
        registry.register(
            "iam_policy",
            ResourceTypeSchema::new()
                .required(&["policy"])
                .immutable(&["name"])
                .computed(&["id", "arn"]),
        );
        registry.register(
            "pipeline",
            ResourceTypeSchema::new()
                .required(&["source", "stages"])
                .immutable(&["name"])
                .computed(&["id", "arn"]),
        );
        registry
    }

    /// Rejects resources of unregistered types when enabled.
    #[must_use]
    pub const fn with_strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    /// Registers or replaces the schema of a type.
    pub fn register(&mut self, resource_type: impl Into<String>, schema: ResourceTypeSchema) {
        self.schemas.insert(resource_type.into(), schema);
    }

    /// Gets the registered schema of a type.
    #[must_use]
    pub fn get(&self, resource_type: &str) -> Option<&ResourceTypeSchema> {
        self.schemas.get(resource_type)
    }

    /// Gets the schema of a type, falling back to the permissive default.
    #[must_use]
    pub fn schema_for(&self, resource_type: &str) -> &ResourceTypeSchema {
        self.schemas.get(resource_type).unwrap_or(&self.fallback)
    }

    /// Attributes excluded from comparison for a resource.
    #[must_use]
    pub fn computed_attributes(&self, resource: &Resource) -> BTreeSet<String> {
        let mut computed = self.schema_for(&resource.id.resource_type).computed.clone();
        computed.extend(resource.computed.iter().cloned());
        computed
    }

    /// Checks a single resource against its type schema.
    ///
    /// # Errors
    ///
    /// Returns [`GraphError::SchemaViolation`] describing the first problem.
    pub fn validate_resource(&self, resource: &Resource) -> Result<(), GraphError> {
        let resource_type = &resource.id.resource_type;
        let schema = match self.schemas.get(resource_type) {
            Some(schema) => schema,
            None if self.strict => {
                return Err(GraphError::SchemaViolation {
                    id: resource.id.clone(),
                    message: format!("unknown resource type '{resource_type}'"),
                });
            }
            None => &self.fallback,
        };

        if let Some(missing) = schema
            .required
            .iter()
            .find(|attr| !resource.attributes.contains_key(*attr))
        {
            return Err(GraphError::SchemaViolation {
                id: resource.id.clone(),
                message: format!("missing required attribute '{missing}'"),
            });
        }

        if let Some(computed) = schema
            .computed
            .iter()
            .chain(resource.computed.iter())
            .find(|attr| resource.attributes.contains_key(*attr))
        {
            return Err(GraphError::SchemaViolation {
                id: resource.id.clone(),
                message: format!("computed attribute '{computed}' cannot be declared"),
            });
        }

        Ok(())
    }

    /// Validates the graph structure and every resource's schema.
    ///
    /// # Errors
    ///
    /// Returns the first structural or schema problem found.
    pub fn validate_graph(&self, graph: &ResourceGraph) -> Result<(), GraphError> {
        graph.validate()?;
        graph.resources().try_for_each(|r| self.validate_resource(r))
    }
}
