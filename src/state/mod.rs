//! State management module.
//!
//! This module provides persistent storage of the last-applied snapshot,
//! compare-and-swap writes keyed on the snapshot serial, and the state lock
//! that serializes convergence runs.

mod local;
mod lock;
mod s3;
mod store;
mod types;

pub use local::{LocalStateStore, STATE_DIR};
pub use lock::{
    DEFAULT_LOCK_TTL_SECS, LockHeartbeat, LockInfo, LockManager, generate_holder_id,
};
pub use s3::S3StateStore;
pub use store::StateStore;
pub use types::{
    HistoryEntry, HistoryOperation, MAX_HISTORY, ResourceState, ResourceStatus, STATE_VERSION,
    StateSnapshot,
};
