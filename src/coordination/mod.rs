//! Coordination against the external key–value store.
//!
//! Provides the shared client pool and the key-watcher long-poll primitive
//! backed by keyspace notifications.

pub mod keywatcher;
pub mod redis;

pub use keywatcher::{KeyWatcher, WatchResult};
