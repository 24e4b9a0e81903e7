//! Resource graph model.
//!
//! This module defines the in-memory representation of infrastructure:
//! - Typed attribute values, including references and unknowns
//! - Resources and their identities
//! - The validated dependency graph and its deterministic ordering
//! - Per-type schemas and replacement policy
//! - Content hashing for change detection

mod hash;
mod model;
mod resource;
mod schema;
mod value;

pub use hash::GraphHasher;
pub use model::{GraphDocument, ResourceGraph};
pub use resource::{Resource, ResourceId};
pub use schema::{ReplacementStrategy, ResourceTypeSchema, SchemaRegistry};
pub use value::{AttributeRef, AttributeValue, UnknownValue};
