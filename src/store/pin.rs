//! Pin model: named, categorized geographic markers with authorship and
//! modification history.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Author stamped on pins created without an active identity.
pub const UNKNOWN_AUTHOR: &str = "Unknown";

/// Unique, stable identifier for a pin, assigned at creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PinId(Uuid);

impl PinId {
    /// Generate a new random pin ID.
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_string(&self) -> String {
        self.0.to_string()
    }
}

impl fmt::Display for PinId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for PinId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Marker category, shown as the pin's icon/label by presentation code.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PinCategory {
    #[default]
    Location,
    Quest,
    Danger,
    Safe,
    Resource,
    Other,
}

impl PinCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Location => "location",
            Self::Quest => "quest",
            Self::Danger => "danger",
            Self::Safe => "safe",
            Self::Resource => "resource",
            Self::Other => "other",
        }
    }
}

impl fmt::Display for PinCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PinCategory {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "location" => Ok(Self::Location),
            "quest" => Ok(Self::Quest),
            "danger" => Ok(Self::Danger),
            "safe" => Ok(Self::Safe),
            "resource" => Ok(Self::Resource),
            "other" => Ok(Self::Other),
            other => Err(format!("unknown pin category: {other}")),
        }
    }
}

/// A shared map marker.
///
/// `updated_at` is monotonically non-decreasing per pin and drives
/// last-writer-wins conflict resolution. Deleted pins are retained as
/// tombstones (`deleted` + `deleted_at`) so that snapshot-based sync can
/// distinguish "never existed on this peer" from "was deleted".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Pin {
    pub id: PinId,
    pub lat: f64,
    pub lng: f64,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub category: PinCategory,
    pub author: String,
    /// Creation timestamp, Unix milliseconds.
    pub created_at: i64,
    /// Last-modified timestamp, Unix milliseconds.
    pub updated_at: i64,
    #[serde(default)]
    pub deleted: bool,
    /// Deletion timestamp for tombstones, Unix milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<i64>,
}

impl Pin {
    /// Stamp a new pin from user-supplied fields.
    pub fn new(draft: PinDraft, author: &str, now_ms: i64) -> Self {
        Self {
            id: PinId::generate(),
            lat: draft.lat,
            lng: draft.lng,
            name: draft.name,
            description: draft.description,
            category: draft.category,
            author: author.to_string(),
            created_at: now_ms,
            updated_at: now_ms,
            deleted: false,
            deleted_at: None,
        }
    }

    /// Schema validation shared by local creation and incoming snapshots.
    pub fn validate(&self) -> Result<(), String> {
        if !self.lat.is_finite() || !(-90.0..=90.0).contains(&self.lat) {
            return Err(format!("latitude {} out of range [-90, 90]", self.lat));
        }
        if !self.lng.is_finite() || !(-180.0..=180.0).contains(&self.lng) {
            return Err(format!("longitude {} out of range [-180, 180]", self.lng));
        }
        if self.name.trim().is_empty() {
            return Err("name must not be empty".to_string());
        }
        Ok(())
    }

    pub fn is_tombstone(&self) -> bool {
        self.deleted
    }

    /// The instant the tombstone was created; falls back to `updated_at`
    /// for tombstones received from peers that omit `deletedAt`.
    pub fn tombstoned_at(&self) -> Option<i64> {
        self.deleted.then(|| self.deleted_at.unwrap_or(self.updated_at))
    }
}

/// User-editable pin fields, before authorship and timestamps are stamped.
#[derive(Debug, Clone, Default)]
pub struct PinDraft {
    pub lat: f64,
    pub lng: f64,
    pub name: String,
    pub description: Option<String>,
    pub category: PinCategory,
}
