//! Attribute values.
//!
//! Attributes are a closed tagged union rather than free-form JSON so that
//! references and not-yet-known values are explicit in the type.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use super::resource::ResourceId;

/// A single attribute value.
///
/// Serialized untagged: scalars, lists and maps look like plain YAML/JSON,
/// references are `{"$ref": "type.name", "attribute": "id"}` and unknown
/// values are `{"$unknown": true}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttributeValue {
    /// Explicit null.
    Null,
    /// Boolean.
    Bool(bool),
    /// Signed integer.
    Int(i64),
    /// Floating point number.
    Float(f64),
    /// String.
    String(String),
    /// Ordered list.
    List(Vec<AttributeValue>),
    /// Reference to an attribute of another resource.
    Reference(AttributeRef),
    /// Value only known after apply.
    Unknown(UnknownValue),
    /// Nested mapping.
    Map(BTreeMap<String, AttributeValue>),
}

/// Reference to an attribute (usually an output) of another resource.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AttributeRef {
    /// The referenced resource.
    #[serde(rename = "$ref")]
    pub resource: ResourceId,
    /// The referenced attribute name.
    pub attribute: String,
}

/// Marker for a value that is computed by the provider during apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UnknownValue {
    #[serde(rename = "$unknown")]
    marker: bool,
}

impl AttributeValue {
    /// Returns the unknown placeholder.
    #[must_use]
    pub const fn unknown() -> Self {
        Self::Unknown(UnknownValue { marker: true })
    }

    /// Creates a reference value.
    #[must_use]
    pub fn reference(resource: ResourceId, attribute: impl Into<String>) -> Self {
        Self::Reference(AttributeRef {
            resource,
            attribute: attribute.into(),
        })
    }

    /// Returns true if this value, or anything nested in it, is unknown.
    #[must_use]
    pub fn contains_unknown(&self) -> bool {
        match self {
            Self::Unknown(_) => true,
            Self::List(items) => items.iter().any(Self::contains_unknown),
            Self::Map(entries) => entries.values().any(Self::contains_unknown),
            _ => false,
        }
    }

    /// Collects every reference in this value, depth first.
    pub fn collect_references<'a>(&'a self, out: &mut Vec<&'a AttributeRef>) {
        match self {
            Self::Reference(r) => out.push(r),
            Self::List(items) => {
                for item in items {
                    item.collect_references(out);
                }
            }
            Self::Map(entries) => {
                for value in entries.values() {
                    value.collect_references(out);
                }
            }
            _ => {}
        }
    }

    /// Returns a copy with every reference replaced by `resolve(reference)`.
    #[must_use]
    pub fn resolve_with<F>(&self, resolve: &F) -> Self
    where
        F: Fn(&AttributeRef) -> Self,
    {
        match self {
            Self::Reference(r) => resolve(r),
            Self::List(items) => Self::List(items.iter().map(|v| v.resolve_with(resolve)).collect()),
            Self::Map(entries) => Self::Map(
                entries
                    .iter()
                    .map(|(k, v)| (k.clone(), v.resolve_with(resolve)))
                    .collect(),
            ),
            other => other.clone(),
        }
    }

    /// Returns the string content, if this is a string.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }
}

impl AttributeRef {
    /// Creates a reference.
    #[must_use]
    pub fn new(resource: ResourceId, attribute: impl Into<String>) -> Self {
        Self {
            resource,
            attribute: attribute.into(),
        }
    }
}

impl From<&str> for AttributeValue {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

impl From<String> for AttributeValue {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

impl From<i64> for AttributeValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<bool> for AttributeValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<AttributeRef> for AttributeValue {
    fn from(value: AttributeRef) -> Self {
        Self::Reference(value)
    }
}

impl fmt::Display for AttributeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.resource, self.attribute)
    }
}

impl fmt::Display for AttributeValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => write!(f, "null"),
            Self::Bool(b) => write!(f, "{b}"),
            Self::Int(i) => write!(f, "{i}"),
            Self::Float(x) => write!(f, "{x}"),
            Self::String(s) => write!(f, "{s:?}"),
            Self::Reference(r) => write!(f, "${{{r}}}"),
            Self::Unknown(_) => write!(f, "(known after apply)"),
            Self::List(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{item}")?;
                }
                write!(f, "]")
            }
            Self::Map(entries) => {
                write!(f, "{{")?;
                for (i, (k, v)) in entries.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{k}: {v}")?;
                }
                write!(f, "}}")
            }
        }
    }
}
