//! Shared party-map synchronization core.
//!
//! A group of tabletop players each run a client holding a local copy of the
//! party's map pins. Clients converge on the same pin set by exchanging full
//! snapshots over a dumb websocket relay: every local edit debounces into
//! one outgoing snapshot, every incoming snapshot merges under
//! last-writer-wins, and deletions travel as tombstones so they survive
//! peers being offline.
//!
//! The pieces compose by injection, with no globals:
//!
//! - [`store::PinStore`]: durable pin collection over SQLite
//! - [`transport::RelayTransport`]: one reconnecting websocket to the relay
//! - [`sync::SyncEngine`]: LWW merge and debounced snapshot sends
//! - [`notify::ChangeNotifier`]: in-process "pins changed" pub/sub
//! - [`relay::MapRelay`]: the fan-out server clients connect to

pub mod config;
pub mod error;
pub mod notify;
pub mod relay;
pub mod store;
pub mod sync;
pub mod transport;

pub use config::Config;
pub use error::{Error, Result};
pub use notify::{ChangeNotifier, ChangeSubscription};
pub use relay::MapRelay;
pub use store::{Pin, PinCategory, PinDraft, PinId, PinStore};
pub use sync::{SyncEngine, SyncMessage, MAP_SYNC_CHANNEL};
pub use transport::{BackoffPolicy, RelayTransport, TransportSubscription};
