//! Wire protocol for relay traffic.
//!
//! Every frame is a JSON text message carrying a `type` field that names its
//! channel. The sync core speaks one channel, `map_sync`, whose payload is a
//! complete pin snapshot. There are no acks and no sequence numbers; the
//! format is safe under duplication and reordering because the receiver
//! merges by per-pin timestamps.

use crate::error::Result;
use crate::store::Pin;
use serde::{Deserialize, Serialize};

/// Channel name for full-snapshot map messages.
pub const MAP_SYNC_CHANNEL: &str = "map_sync";

/// Messages exchanged over the relay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SyncMessage {
    /// Complete pin state of the sending client, tombstones included.
    MapSync { pins: Vec<Pin> },
}

impl SyncMessage {
    /// The channel this message travels on, as it appears in the `type`
    /// field.
    pub fn channel(&self) -> &'static str {
        match self {
            Self::MapSync { .. } => MAP_SYNC_CHANNEL,
        }
    }

    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode(raw: &str) -> Result<Self> {
        Ok(serde_json::from_str(raw)?)
    }
}
