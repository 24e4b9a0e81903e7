//! Provider interface.
//!
//! This module defines how the engine talks to a cloud account:
//! - The abstract [`Provider`] trait and its call and result types
//! - A REST binding over HTTP and an in-memory simulated account
//! - Live state observation for drift detection and refresh
//! - Retry and polling policies

mod http;
mod memory;
mod observer;
mod retry;
mod types;

pub use http::{DEFAULT_TIMEOUT_SECS, HttpProvider};
pub use memory::{InMemoryProvider, ProviderCall};
pub use observer::{ObservedResource, ObservedState, StateObserver};
pub use retry::{PollPolicy, RetryPolicy};
#[cfg(test)]
pub use types::MockProvider;
pub use types::{
    Completion, OperationKind, PendingOperation, Provider, ProviderResult, ProvisionedResource,
    ResolvedResource,
};
