//! Live state observation.
//!
//! Reads every resource recorded in a snapshot from the provider. The result
//! is the baseline for drift detection and for refreshing state before an
//! apply.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, info};

use crate::cancel::CancelToken;
use crate::error::{ProviderError, Result};
use crate::graph::{AttributeValue, GraphHasher, ResourceId};
use crate::state::{ResourceState, StateSnapshot};

use super::retry::RetryPolicy;
use super::types::Provider;

/// Reads live state for recorded resources.
#[derive(Clone)]
pub struct StateObserver {
    provider: Arc<dyn Provider>,
    retry: RetryPolicy,
}

/// Live view of the resources in a snapshot.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ObservedState {
    /// Resources that still exist, keyed by identity.
    pub resources: BTreeMap<ResourceId, ObservedResource>,
    /// Recorded resources the provider no longer knows.
    pub missing: BTreeSet<ResourceId>,
}

/// Live attributes of one resource.
#[derive(Debug, Clone, PartialEq)]
pub struct ObservedResource {
    /// Provider-side identifier.
    pub provider_id: String,
    /// Live values of the recorded attributes.
    pub attributes: BTreeMap<String, AttributeValue>,
    /// Live values of the recorded outputs.
    pub outputs: BTreeMap<String, AttributeValue>,
}

impl std::fmt::Debug for StateObserver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateObserver")
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

impl StateObserver {
    /// Creates a new observer.
    #[must_use]
    pub fn new(provider: Arc<dyn Provider>, retry: RetryPolicy) -> Self {
        Self { provider, retry }
    }

    /// Reads every resource in `snapshot` from the provider.
    ///
    /// Only attributes the snapshot recorded are compared, so provider-side
    /// extras never show up as drift. A live value absent from the provider
    /// becomes [`AttributeValue::Null`].
    ///
    /// # Errors
    ///
    /// Returns the first provider error other than not-found.
    pub async fn observe(&self, snapshot: &StateSnapshot, cancel: &CancelToken) -> Result<ObservedState> {
        info!("Observing {} recorded resources", snapshot.len());
        let mut observed = ObservedState::default();

        for state in snapshot.resources.values() {
            let id = state.id();
            let what = format!("read {id}");
            let result = self
                .retry
                .run(&what, cancel, || self.provider.read(id, &state.provider_id))
                .await;

            match result {
                Ok(live) => {
                    let project = |recorded: &BTreeMap<String, AttributeValue>| {
                        recorded
                            .keys()
                            .map(|key| {
                                let value = live.attributes.get(key).cloned().unwrap_or(AttributeValue::Null);
                                (key.clone(), value)
                            })
                            .collect::<BTreeMap<_, _>>()
                    };
                    observed.resources.insert(
                        id.clone(),
                        ObservedResource {
                            provider_id: live.provider_id.clone(),
                            attributes: project(&state.attributes),
                            outputs: project(&state.outputs),
                        },
                    );
                }
                Err(ProviderError::NotFound { .. }) => {
                    debug!("{id} no longer exists at the provider");
                    observed.missing.insert(id.clone());
                }
                Err(e) => return Err(e.into()),
            }
        }

        Ok(observed)
    }
}

impl ObservedState {
    /// Builds the snapshot the stored one would be if it matched live state.
    ///
    /// Missing resources are dropped; the rest take their live values.
    /// Serial, lineage and history are kept.
    #[must_use]
    pub fn refresh(&self, snapshot: &StateSnapshot) -> StateSnapshot {
        let hasher = GraphHasher::new();
        let mut refreshed = snapshot.clone();

        for id in &self.missing {
            refreshed.remove_resource(id);
        }
        for (id, live) in &self.resources {
            if let Some(recorded) = snapshot.get(id) {
                let mut state: ResourceState = recorded.clone();
                state.provider_id.clone_from(&live.provider_id);
                state.attributes.clone_from(&live.attributes);
                state.outputs.clone_from(&live.outputs);
                state.config_hash = hasher.hash_attributes(&state.attributes);
                refreshed.set_resource(state);
            }
        }

        refreshed
    }

    /// Returns true if live state differs from `snapshot`.
    #[must_use]
    pub fn differs_from(&self, snapshot: &StateSnapshot) -> bool {
        if !self.missing.is_empty() {
            return true;
        }
        self.resources.iter().any(|(id, live)| {
            snapshot
                .get(id)
                .is_some_and(|r| r.attributes != live.attributes || r.outputs != live.outputs)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::Resource;
    use crate::provider::{Completion, InMemoryProvider, MockProvider, ResolvedResource};

    async fn recorded(provider: &InMemoryProvider) -> StateSnapshot {
        let resource = Resource::new("vpc", "main").with_attribute("cidr_block", "10.0.0.0/16");
        let resolved = ResolvedResource {
            id: resource.id.clone(),
            attributes: resource.attributes.clone(),
        };
        let Completion::Done(created) = provider.create(&resolved).await.expect("create") else {
            panic!("expected done");
        };
        let outputs = BTreeMap::from([(
            String::from("id"),
            created.attributes["id"].clone(),
        )]);

        let mut snapshot = StateSnapshot::with_lineage("lin");
        snapshot.set_resource(ResourceState::new(
            resource,
            created.provider_id,
            resolved.attributes,
            outputs,
            "h",
        ));
        snapshot
    }

    #[tokio::test]
    async fn test_unchanged_state_has_no_difference() {
        let provider = InMemoryProvider::new();
        let snapshot = recorded(&provider).await;
        let observer = StateObserver::new(Arc::new(provider), RetryPolicy::none());

        let observed = observer.observe(&snapshot, &CancelToken::new()).await.expect("observe");
        assert!(observed.missing.is_empty());
        assert!(!observed.differs_from(&snapshot));

        let id = ResourceId::new("vpc", "main");
        let refreshed = observed.refresh(&snapshot);
        assert_eq!(
            refreshed.get(&id).map(|r| &r.attributes),
            snapshot.get(&id).map(|r| &r.attributes)
        );
        assert_eq!(
            refreshed.get(&id).map(|r| &r.outputs),
            snapshot.get(&id).map(|r| &r.outputs)
        );
    }

    #[tokio::test]
    async fn test_out_of_band_changes_observed() {
        let provider = InMemoryProvider::new();
        let snapshot = recorded(&provider).await;
        let id = ResourceId::new("vpc", "main");
        let provider_id = snapshot.get(&id).expect("recorded").provider_id.clone();
        provider.set_out_of_band(&provider_id, "cidr_block", "10.7.0.0/16");
        provider.set_out_of_band(&provider_id, "extra", "ignored");

        let observer = StateObserver::new(Arc::new(provider), RetryPolicy::none());
        let observed = observer.observe(&snapshot, &CancelToken::new()).await.expect("observe");

        let live = &observed.resources[&id];
        assert_eq!(live.attributes["cidr_block"], AttributeValue::from("10.7.0.0/16"));
        assert!(!live.attributes.contains_key("extra"));
        assert!(observed.differs_from(&snapshot));

        let refreshed = observed.refresh(&snapshot);
        assert_eq!(
            refreshed.value_of(&id, "cidr_block"),
            Some(&AttributeValue::from("10.7.0.0/16"))
        );
        assert_eq!(refreshed.serial, snapshot.serial);
    }

    #[tokio::test]
    async fn test_missing_resources_dropped_on_refresh() {
        let provider = InMemoryProvider::new();
        let snapshot = recorded(&provider).await;
        let id = ResourceId::new("vpc", "main");
        provider.remove_out_of_band(&snapshot.get(&id).expect("recorded").provider_id);

        let observer = StateObserver::new(Arc::new(provider), RetryPolicy::none());
        let observed = observer.observe(&snapshot, &CancelToken::new()).await.expect("observe");

        assert!(observed.missing.contains(&id));
        assert!(observed.refresh(&snapshot).is_empty());
    }

    #[tokio::test]
    async fn test_provider_failure_propagates() {
        let mut provider = MockProvider::new();
        provider
            .expect_read()
            .returning(|_, _| Err(ProviderError::permanent("forbidden")));

        let mut snapshot = StateSnapshot::with_lineage("lin");
        snapshot.set_resource(ResourceState::new(
            Resource::new("vpc", "main"),
            "vpc-1",
            BTreeMap::new(),
            BTreeMap::new(),
            "h",
        ));

        let observer = StateObserver::new(Arc::new(provider), RetryPolicy::none());
        assert!(observer.observe(&snapshot, &CancelToken::new()).await.is_err());
    }
}
