//! Snapshot synchronization over the relay.
//!
//! Two pieces: [`protocol`] defines the `map_sync` wire message, and
//! [`engine`] merges incoming snapshots (last-writer-wins) and debounces
//! outgoing ones.

pub mod engine;
pub mod protocol;

pub use engine::{merge_snapshot, remote_wins, SyncEngine, DEFAULT_DEBOUNCE};
pub use protocol::{SyncMessage, MAP_SYNC_CHANNEL};
