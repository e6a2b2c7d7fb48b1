//! Durable per-device pin storage.
//!
//! A keyed collection of [`Pin`] records over SQLite. Pure CRUD with no
//! network awareness; deletion tombstones rather than removing rows, and
//! writes that are older than the stored record are rejected so that stale
//! snapshots can never roll a pin backwards.
//!
//! All operations run to completion under a single connection mutex: the
//! unit of atomicity is one call, and callers never observe a partial write.

mod pin;

pub use pin::{Pin, PinCategory, PinDraft, PinId, UNKNOWN_AUTHOR};

use crate::error::{Error, Result};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;

/// How long tombstones are retained before [`PinStore::purge_expired`] may
/// physically remove them. Long enough to outlast realistic offline periods
/// for a weekly party.
pub const DEFAULT_RETENTION_MS: i64 = 30 * 24 * 3600 * 1000;

/// Outcome of an [`PinStore::upsert`] call.
#[derive(Debug)]
pub enum UpsertOutcome {
    /// The write was applied.
    Applied,
    /// The write carried an older `updated_at` than the stored record and
    /// was rejected; the current record is returned untouched.
    Stale(Pin),
}

impl UpsertOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, Self::Applied)
    }
}

/// SQLite-backed pin collection for one device.
pub struct PinStore {
    conn: Mutex<Connection>,
    retention_ms: i64,
}

impl PinStore {
    /// Open (or create) the pin database at the given path.
    pub fn open(path: &Path, retention_ms: i64) -> Result<Self> {
        let conn = Connection::open(path)?;
        Self::init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            retention_ms,
        })
    }

    /// In-memory store, used by tests and throwaway sessions.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            retention_ms: DEFAULT_RETENTION_MS,
        })
    }

    fn init_schema(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS pins (
                id TEXT PRIMARY KEY,
                lat REAL NOT NULL,
                lng REAL NOT NULL,
                name TEXT NOT NULL,
                description TEXT,
                category TEXT NOT NULL,
                author TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                deleted INTEGER NOT NULL DEFAULT 0,
                deleted_at INTEGER
            );
            CREATE INDEX IF NOT EXISTS idx_pins_updated_at ON pins(updated_at DESC);",
        )?;
        Ok(())
    }

    pub fn retention_ms(&self) -> i64 {
        self.retention_ms
    }

    /// Current wall clock in Unix milliseconds.
    pub fn now_ms() -> i64 {
        chrono::Utc::now().timestamp_millis()
    }

    /// Validate, stamp, and insert a new pin.
    ///
    /// `author` is the active identity resolved by the caller; pins created
    /// without one are attributed to [`UNKNOWN_AUTHOR`].
    pub fn create(&self, draft: PinDraft, author: Option<&str>) -> Result<Pin> {
        let author = author.filter(|a| !a.trim().is_empty()).unwrap_or(UNKNOWN_AUTHOR);
        let pin = Pin::new(draft, author, Self::now_ms());
        pin.validate().map_err(Error::InvalidPin)?;

        let conn = self.conn.lock();
        Self::write_pin(&conn, &pin)?;
        tracing::debug!(id = %pin.id, name = %pin.name, author = %pin.author, "created pin");
        Ok(pin)
    }

    pub fn get(&self, id: &PinId) -> Result<Option<Pin>> {
        let conn = self.conn.lock();
        Self::get_inner(&conn, id)
    }

    /// All non-purged pins, tombstones included, newest-modified first.
    pub fn list(&self) -> Result<Vec<Pin>> {
        self.select("SELECT * FROM pins ORDER BY updated_at DESC, id ASC")
    }

    /// Live pins only, for presentation code.
    pub fn list_live(&self) -> Result<Vec<Pin>> {
        self.select("SELECT * FROM pins WHERE deleted = 0 ORDER BY updated_at DESC, id ASC")
    }

    /// Insert or replace by identifier, rejecting writes older than the
    /// stored record. Equal timestamps replace (idempotent re-application).
    pub fn upsert(&self, pin: &Pin) -> Result<UpsertOutcome> {
        pin.validate().map_err(Error::InvalidPin)?;

        let conn = self.conn.lock();
        if let Some(current) = Self::get_inner(&conn, &pin.id)? {
            if pin.updated_at < current.updated_at {
                return Ok(UpsertOutcome::Stale(current));
            }
        }
        Self::write_pin(&conn, pin)?;
        Ok(UpsertOutcome::Applied)
    }

    /// Apply a whole remote snapshot in one critical section.
    ///
    /// Every pin is validated before anything is written, and the
    /// get/compare/write loop then runs inside one transaction under a
    /// single hold of the connection lock: readers observe none or all of
    /// the batch, and no local write can interleave with the comparisons.
    ///
    /// `incoming_wins` decides conflicts against the stored record. Unknown
    /// tombstones older than `purge_cutoff` are skipped, since inserting
    /// them would only feed the next purge. Returns how many pins changed.
    pub fn merge_batch<F>(
        &self,
        pins: &[Pin],
        purge_cutoff: i64,
        incoming_wins: F,
    ) -> Result<usize>
    where
        F: Fn(&Pin, &Pin) -> bool,
    {
        for pin in pins {
            pin.validate()
                .map_err(|e| Error::InvalidPin(format!("{} in pin {}", e, pin.id)))?;
        }

        let conn = self.conn.lock();
        let tx = conn.unchecked_transaction()?;
        let mut changed = 0usize;
        for incoming in pins {
            match Self::get_inner(&tx, &incoming.id)? {
                Some(current) => {
                    if incoming_wins(&current, incoming) {
                        Self::write_pin(&tx, incoming)?;
                        changed += 1;
                    }
                }
                None => {
                    if incoming.is_tombstone()
                        && incoming.tombstoned_at().is_some_and(|ts| ts < purge_cutoff)
                    {
                        tracing::debug!(id = %incoming.id, "skipping expired tombstone");
                        continue;
                    }
                    Self::write_pin(&tx, incoming)?;
                    changed += 1;
                }
            }
        }
        tx.commit()?;
        Ok(changed)
    }

    /// Apply an edit to a live pin, bumping `updated_at` strictly past its
    /// previous value so peers always see the edit as newer.
    pub fn update(&self, id: &PinId, draft: PinDraft) -> Result<Pin> {
        let conn = self.conn.lock();
        let current = Self::get_inner(&conn, id)?
            .filter(|p| !p.deleted)
            .ok_or_else(|| Error::NotFound(id.to_string()))?;

        let updated = Pin {
            lat: draft.lat,
            lng: draft.lng,
            name: draft.name,
            description: draft.description,
            category: draft.category,
            updated_at: Self::next_ts(current.updated_at),
            ..current
        };
        updated.validate().map_err(Error::InvalidPin)?;
        Self::write_pin(&conn, &updated)?;
        Ok(updated)
    }

    /// Convert a pin to a tombstone. The row is retained so peers that were
    /// offline during the deletion still learn about it; idempotent when the
    /// pin is already tombstoned.
    pub fn delete(&self, id: &PinId) -> Result<Pin> {
        let conn = self.conn.lock();
        let current =
            Self::get_inner(&conn, id)?.ok_or_else(|| Error::NotFound(id.to_string()))?;
        if current.deleted {
            return Ok(current);
        }

        let ts = Self::next_ts(current.updated_at);
        let tombstone = Pin {
            deleted: true,
            deleted_at: Some(ts),
            updated_at: ts,
            ..current
        };
        Self::write_pin(&conn, &tombstone)?;
        tracing::debug!(id = %tombstone.id, "tombstoned pin");
        Ok(tombstone)
    }

    /// Remove tombstones whose deletion timestamp has aged past the
    /// retention window. Live pins are never purged.
    pub fn purge_expired(&self, now_ms: i64) -> Result<usize> {
        let cutoff = now_ms.saturating_sub(self.retention_ms);
        let conn = self.conn.lock();
        let purged = conn.execute(
            "DELETE FROM pins WHERE deleted = 1 AND COALESCE(deleted_at, updated_at) < ?1",
            params![cutoff],
        )?;
        if purged > 0 {
            tracing::info!(purged, "purged expired tombstones");
        }
        Ok(purged)
    }

    /// Full snapshot of this device's known state, tombstones included.
    pub fn snapshot(&self) -> Result<Vec<Pin>> {
        self.list()
    }

    // ── Internals ───────────────────────────────────────────────────

    fn next_ts(prev: i64) -> i64 {
        Self::now_ms().max(prev + 1)
    }

    fn get_inner(conn: &Connection, id: &PinId) -> Result<Option<Pin>> {
        conn.query_row(
            "SELECT * FROM pins WHERE id = ?1",
            params![id.as_string()],
            Self::row_to_pin,
        )
        .optional()
        .map_err(Error::from)
    }

    fn write_pin(conn: &Connection, pin: &Pin) -> Result<()> {
        conn.execute(
            "INSERT OR REPLACE INTO pins
                (id, lat, lng, name, description, category, author,
                 created_at, updated_at, deleted, deleted_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                pin.id.as_string(),
                pin.lat,
                pin.lng,
                pin.name,
                pin.description,
                pin.category.as_str(),
                pin.author,
                pin.created_at,
                pin.updated_at,
                i32::from(pin.deleted),
                pin.deleted_at,
            ],
        )?;
        Ok(())
    }

    fn select(&self, sql: &str) -> Result<Vec<Pin>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(sql)?;
        let pins = stmt
            .query_map([], Self::row_to_pin)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(pins)
    }

    fn row_to_pin(row: &rusqlite::Row<'_>) -> rusqlite::Result<Pin> {
        let id: String = row.get("id")?;
        let category: String = row.get("category")?;
        Ok(Pin {
            id: id.parse().map_err(|e| {
                rusqlite::Error::FromSqlConversionFailure(
                    0,
                    rusqlite::types::Type::Text,
                    Box::new(e),
                )
            })?,
            lat: row.get("lat")?,
            lng: row.get("lng")?,
            name: row.get("name")?,
            description: row.get("description")?,
            category: category.parse().unwrap_or_default(),
            author: row.get("author")?,
            created_at: row.get("created_at")?,
            updated_at: row.get("updated_at")?,
            deleted: row.get::<_, i32>("deleted")? != 0,
            deleted_at: row.get("deleted_at")?,
        })
    }
}

// ── Tests ───────────────────────────────────────────────────────────
