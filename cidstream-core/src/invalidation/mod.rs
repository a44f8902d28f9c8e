//! Persistent known-bad state.
//!
//! Remembers CIDs that failed to load so source selection can skip them for
//! a validity window, and keeps provider error counters across restarts.

pub mod cache;
pub mod store;

pub use cache::{CID_VALIDITY_KEY, InvalidCidEntry, InvalidationCache, PROVIDER_ERRORS_KEY};
pub use store::{FileStore, KeyValueStore, MemoryStore, StoreError};
