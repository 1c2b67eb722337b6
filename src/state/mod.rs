//! State management module.
//!
//! This module provides persistent storage for the recorded state of a
//! stack: provider identifiers, outputs, and input hashes of every resource
//! that was successfully applied, plus run history and advisory locking.

mod local;
mod lock;
mod memory;
mod store;
mod types;

pub use local::{LocalStateStore, STATE_DIR};
pub use lock::{LOCK_EXPIRY_SECS, LockInfo, generate_holder_id};
pub use memory::MemoryStateStore;
pub use store::StateStore;
pub use types::{
    ResourceState, RunCounts, RunHistoryEntry, RunOperation, STATE_VERSION, StateSnapshot,
};
