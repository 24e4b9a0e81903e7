//! Content hashing for change detection.
//!
//! Hashes are deterministic over resource content so that identical
//! declarations always hash identically, independent of document order.

use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

use super::model::ResourceGraph;
use super::resource::Resource;
use super::value::AttributeValue;

/// Hasher for resources, attribute sets and whole graphs.
#[derive(Debug, Default, Clone, Copy)]
pub struct GraphHasher;

impl GraphHasher {
    /// Creates a new hasher.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Hashes an entire graph; used as the revision fingerprint.
    #[must_use]
    pub fn hash_graph(&self, graph: &ResourceGraph) -> String {
        let mut hasher = Sha256::new();
        for resource in graph.resources() {
            hasher.update(self.hash_resource(resource).as_bytes());
        }
        hex::encode(hasher.finalize())
    }

    /// Hashes a single resource declaration.
    #[must_use]
    pub fn hash_resource(&self, resource: &Resource) -> String {
        let mut hasher = Sha256::new();

        hasher.update(resource.id.resource_type.as_bytes());
        hasher.update([0u8]);
        hasher.update(resource.id.name.as_bytes());
        hasher.update([0u8]);

        feed_map(&mut hasher, &resource.attributes);

        for dep in &resource.depends_on {
            hasher.update(b"dep:");
            hasher.update(dep.to_string().as_bytes());
        }
        for computed in &resource.computed {
            hasher.update(b"computed:");
            hasher.update(computed.as_bytes());
        }

        hex::encode(hasher.finalize())
    }

    /// Hashes a resolved attribute set.
    #[must_use]
    pub fn hash_attributes(&self, attributes: &BTreeMap<String, AttributeValue>) -> String {
        let mut hasher = Sha256::new();
        feed_map(&mut hasher, attributes);
        hex::encode(hasher.finalize())
    }

    /// Computes a short hash (first 8 characters) for display purposes.
    #[must_use]
    pub fn short_hash(&self, hash: &str) -> String {
        hash.chars().take(8).collect()
    }

    /// Compares two hashes in constant time.
    #[must_use]
    pub fn hashes_match(hash1: &str, hash2: &str) -> bool {
        if hash1.len() != hash2.len() {
            return false;
        }

        hash1
            .bytes()
            .zip(hash2.bytes())
            .fold(0u8, |acc, (a, b)| acc | (a ^ b))
            == 0
    }
}

fn feed_map(hasher: &mut Sha256, map: &BTreeMap<String, AttributeValue>) {
    hasher.update(b"{");
    for (key, value) in map {
        hasher.update(key.as_bytes());
        hasher.update(b"=");
        feed_value(hasher, value);
        hasher.update(b";");
    }
    hasher.update(b"}");
}

fn feed_value(hasher: &mut Sha256, value: &AttributeValue) {
    match value {
        AttributeValue::Null => hasher.update(b"n"),
        AttributeValue::Bool(b) => hasher.update(if *b { b"t" } else { b"f" }),
        AttributeValue::Int(i) => {
            hasher.update(b"i");
            hasher.update(i.to_be_bytes());
        }
        AttributeValue::Float(x) => {
            hasher.update(b"d");
            hasher.update(x.to_bits().to_be_bytes());
        }
        AttributeValue::String(s) => {
            hasher.update(b"s");
            hasher.update((s.len() as u64).to_be_bytes());
            hasher.update(s.as_bytes());
        }
        AttributeValue::List(items) => {
            hasher.update(b"[");
            for item in items {
                feed_value(hasher, item);
                hasher.update(b",");
            }
            hasher.update(b"]");
        }
        AttributeValue::Reference(r) => {
            hasher.update(b"r");
            hasher.update(r.to_string().as_bytes());
        }
        AttributeValue::Unknown(_) => hasher.update(b"?"),
        AttributeValue::Map(entries) => feed_map(hasher, entries),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vpc(cidr: &str) -> Resource {
        Resource::new("vpc", "main").with_attribute("cidr_block", cidr)
    }

    #[test]
    fn test_resource_hash_deterministic() {
        let hasher = GraphHasher::new();
        assert_eq!(
            hasher.hash_resource(&vpc("10.0.0.0/16")),
            hasher.hash_resource(&vpc("10.0.0.0/16"))
        );
    }

    #[test]
    fn test_attribute_change_changes_hash() {
        let hasher = GraphHasher::new();
        assert_ne!(
            hasher.hash_resource(&vpc("10.0.0.0/16")),
            hasher.hash_resource(&vpc("10.1.0.0/16"))
        );
    }

    #[test]
    fn test_graph_hash_ignores_document_order() {
        let hasher = GraphHasher::new();
        let a = ResourceGraph::from_resources(vec![vpc("10.0.0.0/16"), Resource::new("iam_role", "r")])
            .expect("valid");
        let b = ResourceGraph::from_resources(vec![Resource::new("iam_role", "r"), vpc("10.0.0.0/16")])
            .expect("valid");
        assert_eq!(hasher.hash_graph(&a), hasher.hash_graph(&b));
    }

    #[test]
    fn test_short_hash_and_match() {
        let hasher = GraphHasher::new();
        assert_eq!(hasher.short_hash("abcdef1234567890"), "abcdef12");
        assert!(GraphHasher::hashes_match("abc123", "abc123"));
        assert!(!GraphHasher::hashes_match("abc123", "abc124"));
        assert!(!GraphHasher::hashes_match("abc123", "abc12"));
    }
}
