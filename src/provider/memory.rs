//! In-memory provider.
//!
//! A simulated cloud account used for dry runs and tests. Besides serving the
//! [`Provider`] calls it can inject failures and pending operations, and can
//! mutate or delete objects out of band to simulate drift.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::debug;

use crate::error::ProviderError;
use crate::graph::{AttributeValue, ResourceId};
use crate::planner::AttributeChange;

use super::types::{
    Completion, OperationKind, PendingOperation, Provider, ProviderResult, ProvisionedResource,
    ResolvedResource,
};

/// A call received by the in-memory provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderCall {
    /// Operation kind.
    pub kind: OperationKind,
    /// Resource the call was about.
    pub id: ResourceId,
}

/// Simulated cloud account.
#[derive(Debug, Default, Clone)]
pub struct InMemoryProvider {
    inner: Arc<Mutex<Account>>,
    latency: Duration,
    in_flight: Arc<AtomicUsize>,
    max_in_flight: Arc<AtomicUsize>,
}

#[derive(Debug, Default)]
struct Account {
    objects: BTreeMap<String, StoredObject>,
    next_serial: u64,
    failures: HashMap<(OperationKind, ResourceId), VecDeque<ProviderError>>,
    delays: HashMap<(OperationKind, ResourceId), u32>,
    operations: HashMap<String, Operation>,
    calls: Vec<ProviderCall>,
}

#[derive(Debug, Clone)]
struct StoredObject {
    id: ResourceId,
    attributes: BTreeMap<String, AttributeValue>,
}

#[derive(Debug)]
struct Operation {
    remaining_polls: u32,
    outcome: Option<ProvisionedResource>,
}

/// Decrements the in-flight counter on drop.
struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl InMemoryProvider {
    /// Creates an empty account.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Delays every mutating call, so concurrent calls overlap.
    #[must_use]
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    fn account(&self) -> MutexGuard<'_, Account> {
        // The account holds plain data; a panic mid-update cannot break it.
        self.inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Makes the next `kind` call for `id` fail with `error`.
    ///
    /// Queued errors are returned in order, one per call.
    pub fn fail_next(&self, kind: OperationKind, id: &ResourceId, error: ProviderError) {
        self.account()
            .failures
            .entry((kind, id.clone()))
            .or_default()
            .push_back(error);
    }

    /// Makes the next `kind` call for `id` return pending for `polls` polls.
    pub fn pend_next(&self, kind: OperationKind, id: &ResourceId, polls: u32) {
        self.account().delays.insert((kind, id.clone()), polls);
    }

    /// Deletes an object behind the engine's back.
    pub fn remove_out_of_band(&self, provider_id: &str) -> bool {
        self.account().objects.remove(provider_id).is_some()
    }

    /// Changes an attribute behind the engine's back.
    pub fn set_out_of_band(
        &self,
        provider_id: &str,
        attribute: &str,
        value: impl Into<AttributeValue>,
    ) -> bool {
        self.account()
            .objects
            .get_mut(provider_id)
            .map(|object| object.attributes.insert(attribute.to_string(), value.into()))
            .is_some()
    }

    /// Live attributes of an object.
    #[must_use]
    pub fn object(&self, provider_id: &str) -> Option<BTreeMap<String, AttributeValue>> {
        self.account()
            .objects
            .get(provider_id)
            .map(|object| object.attributes.clone())
    }

    /// Provider ids of every object created for `id`.
    #[must_use]
    pub fn provider_ids_for(&self, id: &ResourceId) -> Vec<String> {
        self.account()
            .objects
            .iter()
            .filter(|(_, object)| object.id == *id)
            .map(|(provider_id, _)| provider_id.clone())
            .collect()
    }

    /// Number of live objects.
    #[must_use]
    pub fn object_count(&self) -> usize {
        self.account().objects.len()
    }

    /// Every call received, in order.
    #[must_use]
    pub fn calls(&self) -> Vec<ProviderCall> {
        self.account().calls.clone()
    }

    /// Calls of one kind, in order.
    #[must_use]
    pub fn calls_of(&self, kind: OperationKind) -> Vec<ResourceId> {
        self.account()
            .calls
            .iter()
            .filter(|c| c.kind == kind)
            .map(|c| c.id.clone())
            .collect()
    }

    /// Highest number of mutating calls observed in flight at once.
    #[must_use]
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    /// Records the call and pops any injected failure or delay.
    async fn begin(&self, kind: OperationKind, id: &ResourceId) -> ProviderResult<(InFlight<'_>, Option<u32>)> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        let guard = InFlight(&self.in_flight);

        if !self.latency.is_zero() && kind != OperationKind::Read {
            tokio::time::sleep(self.latency).await;
        }

        let mut account = self.account();
        account.calls.push(ProviderCall {
            kind,
            id: id.clone(),
        });

        let key = (kind, id.clone());
        if let Some(error) = account.failures.get_mut(&key).and_then(VecDeque::pop_front) {
            debug!("Injected {kind} failure for {id}: {error}");
            return Err(error);
        }

        Ok((guard, account.delays.remove(&key)))
    }

    fn pending(account: &mut Account, polls: u32, provider_id: Option<String>, outcome: Option<ProvisionedResource>) -> PendingOperation {
        account.next_serial += 1;
        let token = format!("op-{:04}", account.next_serial);
        account.operations.insert(
            token.clone(),
            Operation {
                remaining_polls: polls,
                outcome,
            },
        );
        PendingOperation::new(token, provider_id)
    }
}

#[async_trait]
impl Provider for InMemoryProvider {
    async fn create(&self, resource: &ResolvedResource) -> ProviderResult<Completion<ProvisionedResource>> {
        let (_guard, delay) = self.begin(OperationKind::Create, &resource.id).await?;
        let mut account = self.account();

        account.next_serial += 1;
        let provider_id = format!("{}-{:04}", resource.id.resource_type, account.next_serial);

        let mut attributes = resource.attributes.clone();
        attributes.insert(String::from("id"), AttributeValue::from(provider_id.clone()));
        attributes.insert(
            String::from("arn"),
            AttributeValue::from(format!(
                "arn:terrace:{}:{provider_id}",
                resource.id.resource_type
            )),
        );

        account.objects.insert(
            provider_id.clone(),
            StoredObject {
                id: resource.id.clone(),
                attributes: attributes.clone(),
            },
        );
        let provisioned = ProvisionedResource::new(provider_id.clone(), attributes);

        Ok(match delay {
            Some(polls) => Completion::Pending(Self::pending(
                &mut account,
                polls,
                Some(provider_id),
                Some(provisioned),
            )),
            None => Completion::Done(provisioned),
        })
    }

    async fn read(&self, id: &ResourceId, provider_id: &str) -> ProviderResult<ProvisionedResource> {
        let _ = self.begin(OperationKind::Read, id).await?;
        self.account()
            .objects
            .get(provider_id)
            .map(|object| ProvisionedResource::new(provider_id, object.attributes.clone()))
            .ok_or_else(|| ProviderError::NotFound {
                provider_id: provider_id.to_string(),
            })
    }

    async fn update(
        &self,
        id: &ResourceId,
        provider_id: &str,
        resource: &ResolvedResource,
        changes: &[AttributeChange],
    ) -> ProviderResult<Completion<ProvisionedResource>> {
        let (_guard, delay) = self.begin(OperationKind::Update, id).await?;
        let mut account = self.account();

        let Some(object) = account.objects.get_mut(provider_id) else {
            return Err(ProviderError::NotFound {
                provider_id: provider_id.to_string(),
            });
        };

        for change in changes {
            match resource.attributes.get(&change.attribute) {
                Some(value) => {
                    object.attributes.insert(change.attribute.clone(), value.clone());
                }
                None => {
                    object.attributes.remove(&change.attribute);
                }
            }
        }
        let provisioned = ProvisionedResource::new(provider_id, object.attributes.clone());

        Ok(match delay {
            Some(polls) => Completion::Pending(Self::pending(
                &mut account,
                polls,
                Some(provider_id.to_string()),
                Some(provisioned),
            )),
            None => Completion::Done(provisioned),
        })
    }

    async fn delete(&self, id: &ResourceId, provider_id: &str) -> ProviderResult<Completion<()>> {
        let (_guard, delay) = self.begin(OperationKind::Delete, id).await?;
        let mut account = self.account();

        if account.objects.remove(provider_id).is_none() {
            return Err(ProviderError::NotFound {
                provider_id: provider_id.to_string(),
            });
        }

        Ok(match delay {
            Some(polls) => Completion::Pending(Self::pending(
                &mut account,
                polls,
                Some(provider_id.to_string()),
                None,
            )),
            None => Completion::Done(()),
        })
    }

    async fn poll(
        &self,
        operation: &PendingOperation,
    ) -> ProviderResult<Completion<Option<ProvisionedResource>>> {
        let mut account = self.account();
        let Some(state) = account.operations.get_mut(&operation.token) else {
            return Err(ProviderError::permanent(format!(
                "unknown operation {}",
                operation.token
            )));
        };

        if state.remaining_polls > 0 {
            state.remaining_polls -= 1;
            return Ok(Completion::Pending(operation.clone()));
        }

        let outcome = account
            .operations
            .remove(&operation.token)
            .and_then(|op| op.outcome);
        Ok(Completion::Done(outcome))
    }
}
