//! Provider interface types.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::error::ProviderError;
use crate::graph::{AttributeValue, ResourceId};
use crate::planner::AttributeChange;

/// Result type for provider calls.
pub type ProviderResult<T> = std::result::Result<T, ProviderError>;

/// A resource with every reference resolved to a concrete value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedResource {
    /// Identity.
    pub id: ResourceId,
    /// Concrete attributes.
    pub attributes: BTreeMap<String, AttributeValue>,
}

/// A resource as the provider reports it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProvisionedResource {
    /// Provider-side identifier.
    pub provider_id: String,
    /// Every attribute the provider reports, computed ones included.
    #[serde(default)]
    pub attributes: BTreeMap<String, AttributeValue>,
}

/// Handle to an operation the provider has accepted but not finished.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingOperation {
    /// Operation token used for polling.
    pub token: String,
    /// Provider id, when the provider has already assigned one.
    #[serde(default)]
    pub provider_id: Option<String>,
}

/// Outcome of a provider call.
#[derive(Debug, Clone, PartialEq)]
pub enum Completion<T> {
    /// The operation finished.
    Done(T),
    /// The operation continues; poll it.
    Pending(PendingOperation),
}

/// Kinds of provider operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    /// Create call.
    Create,
    /// Read call.
    Read,
    /// Update call.
    Update,
    /// Delete call.
    Delete,
}

/// Abstract cloud provider.
///
/// Calls either finish (`Done`) or hand back a [`PendingOperation`] that is
/// resolved through [`Provider::poll`]. A finished poll yields the resource
/// for create and update operations and `None` for deletes.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Provider: Send + Sync {
    /// Creates a resource.
    async fn create(&self, resource: &ResolvedResource) -> ProviderResult<Completion<ProvisionedResource>>;

    /// Reads the live state of a resource.
    ///
    /// Returns [`ProviderError::NotFound`] if it no longer exists.
    async fn read(&self, id: &ResourceId, provider_id: &str) -> ProviderResult<ProvisionedResource>;

    /// Updates a resource in place.
    async fn update(
        &self,
        id: &ResourceId,
        provider_id: &str,
        resource: &ResolvedResource,
        changes: &[AttributeChange],
    ) -> ProviderResult<Completion<ProvisionedResource>>;

    /// Deletes a resource.
    async fn delete(&self, id: &ResourceId, provider_id: &str) -> ProviderResult<Completion<()>>;

    /// Checks on a pending operation.
    async fn poll(
        &self,
        operation: &PendingOperation,
    ) -> ProviderResult<Completion<Option<ProvisionedResource>>>;
}

impl<T> Completion<T> {
    /// Returns true if the operation finished.
    #[must_use]
    pub const fn is_done(&self) -> bool {
        matches!(self, Self::Done(_))
    }

    /// Maps a finished value.
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Completion<U> {
        match self {
            Self::Done(value) => Completion::Done(f(value)),
            Self::Pending(op) => Completion::Pending(op),
        }
    }
}

impl ProvisionedResource {
    /// Creates a provisioned resource.
    #[must_use]
    pub fn new(provider_id: impl Into<String>, attributes: BTreeMap<String, AttributeValue>) -> Self {
        Self {
            provider_id: provider_id.into(),
            attributes,
        }
    }
}

impl PendingOperation {
    /// Creates a pending operation handle.
    #[must_use]
    pub fn new(token: impl Into<String>, provider_id: Option<String>) -> Self {
        Self {
            token: token.into(),
            provider_id,
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self {
            Self::Create => "create",
            Self::Read => "read",
            Self::Update => "update",
            Self::Delete => "delete",
        };
        write!(f, "{kind}")
    }
}
