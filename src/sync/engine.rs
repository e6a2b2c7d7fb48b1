//! Snapshot synchronization engine.
//!
//! Sits between the pin store and the relay transport. Local mutations go
//! through the engine so it can mark itself dirty; a pump task coalesces
//! dirty marks over a short debounce window and then sends one complete
//! snapshot on the `map_sync` channel. Incoming snapshots are merged
//! pin-by-pin under last-writer-wins.
//!
//! The merge direction never marks the engine dirty. A received snapshot
//! only updates the local store and fires the change notifier; if it echoed
//! our own state back (the relay forwards to everyone, sender included) the
//! merge changes nothing and stays silent. This is what keeps a party of
//! clients from ping-ponging snapshots at each other forever.

use crate::error::Result;
use crate::notify::ChangeNotifier;
use crate::store::{Pin, PinDraft, PinId, PinStore};
use crate::sync::protocol::{SyncMessage, MAP_SYNC_CHANNEL};
use crate::transport::{RelayTransport, TransportSubscription};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

/// How long the pump waits after a dirty mark before sending, so bursts of
/// edits collapse into one snapshot.
pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(250);

/// Last-writer-wins: greater `updated_at` wins; on an exact tie the
/// lexicographically greater author wins, so every client breaks the tie
/// the same way.
pub fn remote_wins(local: &Pin, remote: &Pin) -> bool {
    remote.updated_at > local.updated_at
        || (remote.updated_at == local.updated_at && remote.author > local.author)
}

/// Merge a remote snapshot into the store. Returns how many pins changed.
///
/// One invalid pin rejects the entire message, and the whole batch is
/// applied in one critical section, so a receiver never applies or exposes
/// half a snapshot. Remote tombstones older than the retention window with
/// no local counterpart are skipped, since inserting them would only feed
/// the next purge.
pub fn merge_snapshot_at(store: &PinStore, pins: &[Pin], now_ms: i64) -> Result<usize> {
    let purge_cutoff = now_ms.saturating_sub(store.retention_ms());
    store.merge_batch(pins, purge_cutoff, remote_wins)
}

/// [`merge_snapshot_at`] against the current wall clock.
pub fn merge_snapshot(store: &PinStore, pins: &[Pin]) -> Result<usize> {
    merge_snapshot_at(store, pins, PinStore::now_ms())
}

struct EngineInner {
    store: Arc<PinStore>,
    transport: RelayTransport,
    notifier: ChangeNotifier,
    author: Option<String>,
    debounce: Duration,
    dirty: AtomicBool,
    dirty_signal: Notify,
    stopped: AtomicBool,
    stop_signal: Notify,
    subscription: Mutex<Option<TransportSubscription>>,
}

/// Orchestrates local mutations, the outgoing pump, and incoming merges.
#[derive(Clone)]
pub struct SyncEngine {
    inner: Arc<EngineInner>,
}

impl SyncEngine {
    /// `author` is the active identity stamped on pins created through this
    /// engine; `None` falls back to the unknown-author marker.
    pub fn new(
        store: Arc<PinStore>,
        transport: RelayTransport,
        notifier: ChangeNotifier,
        author: Option<String>,
        debounce: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                store,
                transport,
                notifier,
                author,
                debounce,
                dirty: AtomicBool::new(false),
                dirty_signal: Notify::new(),
                stopped: AtomicBool::new(false),
                stop_signal: Notify::new(),
                subscription: Mutex::new(None),
            }),
        }
    }

    /// Subscribe to incoming snapshots and spawn the pump and reconnect
    /// watcher. Call once, after the transport exists (the transport itself
    /// may connect before or after).
    pub fn start(&self) -> Result<()> {
        self.inner.store.purge_expired(PinStore::now_ms())?;

        let weak = Arc::downgrade(&self.inner);
        let sub = self
            .inner
            .transport
            .subscribe(MAP_SYNC_CHANNEL, move |raw| {
                if let Some(inner) = weak.upgrade() {
                    handle_incoming(&inner, raw);
                }
            });
        *self.inner.subscription.lock() = Some(sub);

        let pump = self.inner.clone();
        tokio::spawn(async move { run_pump(pump).await });

        let watcher = self.inner.clone();
        tokio::spawn(async move { watch_reconnects(watcher).await });
        Ok(())
    }

    /// Stop the pump and detach from the transport. Terminal.
    pub fn stop(&self) {
        self.inner.stopped.store(true, Ordering::SeqCst);
        self.inner.stop_signal.notify_waiters();
        self.inner.subscription.lock().take();
    }

    /// Create a pin locally and schedule a snapshot send.
    pub fn create_pin(&self, draft: PinDraft) -> Result<Pin> {
        let pin = self
            .inner
            .store
            .create(draft, self.inner.author.as_deref())?;
        self.after_local_mutation();
        Ok(pin)
    }

    /// Edit a live pin and schedule a snapshot send.
    pub fn update_pin(&self, id: &PinId, draft: PinDraft) -> Result<Pin> {
        let pin = self.inner.store.update(id, draft)?;
        self.after_local_mutation();
        Ok(pin)
    }

    /// Tombstone a pin and schedule a snapshot send. Unconditional; any
    /// confirmation belongs in the caller's UI.
    pub fn delete_pin(&self, id: &PinId) -> Result<Pin> {
        let pin = self.inner.store.delete(id)?;
        self.after_local_mutation();
        Ok(pin)
    }

    pub fn store(&self) -> &Arc<PinStore> {
        &self.inner.store
    }

    fn after_local_mutation(&self) {
        self.inner.notifier.notify();
        mark_dirty(&self.inner);
    }
}

fn mark_dirty(inner: &EngineInner) {
    inner.dirty.store(true, Ordering::SeqCst);
    inner.dirty_signal.notify_one();
}

fn handle_incoming(inner: &EngineInner, raw: &str) {
    let msg = match SyncMessage::decode(raw) {
        Ok(msg) => msg,
        Err(err) => {
            tracing::warn!(error = %err, "dropping malformed sync frame");
            return;
        }
    };
    let SyncMessage::MapSync { pins } = msg;
    match merge_snapshot(&inner.store, &pins) {
        Ok(0) => {
            tracing::trace!(pins = pins.len(), "snapshot merge was a no-op");
        }
        Ok(changed) => {
            tracing::debug!(pins = pins.len(), changed, "merged remote snapshot");
            inner.notifier.notify();
        }
        Err(err) => {
            tracing::warn!(error = %err, "discarding snapshot");
        }
    }
}

async fn run_pump(inner: Arc<EngineInner>) {
    loop {
        if inner.stopped.load(Ordering::SeqCst) {
            return;
        }
        if !inner.dirty.load(Ordering::SeqCst) {
            tokio::select! {
                _ = inner.dirty_signal.notified() => {}
                _ = inner.stop_signal.notified() => return,
            }
            continue;
        }

        // Coalescing window: further marks during the sleep ride along in
        // the snapshot built below.
        tokio::select! {
            _ = tokio::time::sleep(inner.debounce) => {}
            _ = inner.stop_signal.notified() => return,
        }
        inner.dirty.store(false, Ordering::SeqCst);

        if let Err(err) = send_snapshot(&inner) {
            tracing::warn!(error = %err, "failed to build snapshot");
        }
    }
}

fn send_snapshot(inner: &EngineInner) -> Result<()> {
    inner.store.purge_expired(PinStore::now_ms())?;
    let pins = inner.store.snapshot()?;
    let frame = SyncMessage::MapSync { pins }.encode()?;
    inner.transport.send(MAP_SYNC_CHANNEL, frame);
    Ok(())
}

/// Mark dirty on every transition to connected, so the first send of each
/// session is always the complete current state. Edits made while offline
/// thus reach peers in exactly one snapshot.
async fn watch_reconnects(inner: Arc<EngineInner>) {
    let mut rx = inner.transport.watch_connected();
    let mut was_connected = *rx.borrow();
    if was_connected {
        mark_dirty(&inner);
    }
    loop {
        tokio::select! {
            changed = rx.changed() => {
                if changed.is_err() {
                    return;
                }
            }
            _ = inner.stop_signal.notified() => return,
        }
        let connected = *rx.borrow();
        if connected && !was_connected {
            tracing::debug!("reconnected, scheduling full snapshot push");
            mark_dirty(&inner);
        }
        was_connected = connected;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::store::{PinCategory, DEFAULT_RETENTION_MS};

    fn pin_at(name: &str, updated_at: i64, author: &str) -> Pin {
        Pin {
            id: PinId::generate(),
            lat: 10.0,
            lng: 20.0,
            name: name.into(),
            description: None,
            category: PinCategory::Location,
            author: author.into(),
            created_at: updated_at.min(100),
            updated_at,
            deleted: false,
            deleted_at: None,
        }
    }

    fn tombstone_of(pin: &Pin, at: i64) -> Pin {
        Pin {
            deleted: true,
            deleted_at: Some(at),
            updated_at: at,
            ..pin.clone()
        }
    }

    #[test]
    fn remote_wins_on_newer_timestamp() {
        let local = pin_at("a", 100, "aria");
        let mut remote = local.clone();
        remote.updated_at = 101;
        assert!(remote_wins(&local, &remote));
        remote.updated_at = 99;
        assert!(!remote_wins(&local, &remote));
    }

    #[test]
    fn remote_wins_tie_breaks_on_greater_author() {
        let local = pin_at("a", 100, "aria");
        let mut remote = local.clone();
        remote.author = "bram".into();
        assert!(remote_wins(&local, &remote));
        remote.author = "aaron".into();
        assert!(!remote_wins(&local, &remote));
        // Identical author and timestamp: local wins, so an echo of our own
        // state never counts as a change.
        remote.author = "aria".into();
        assert!(!remote_wins(&local, &remote));
    }

    #[test]
    fn merge_into_empty_store_adopts_snapshot() {
        let store = PinStore::open_in_memory().unwrap();
        let snapshot = vec![pin_at("a", 100, "aria"), pin_at("b", 200, "bram")];

        let changed = merge_snapshot_at(&store, &snapshot, 300).unwrap();
        assert_eq!(changed, 2);

        let pins = store.list().unwrap();
        assert_eq!(pins.len(), 2);
        assert_eq!(pins[0].name, "b");
        assert_eq!(pins[1].name, "a");
    }

    #[test]
    fn merge_is_idempotent() {
        let store = PinStore::open_in_memory().unwrap();
        let snapshot = vec![pin_at("a", 100, "aria")];

        assert_eq!(merge_snapshot_at(&store, &snapshot, 300).unwrap(), 1);
        assert_eq!(merge_snapshot_at(&store, &snapshot, 300).unwrap(), 0);
        assert_eq!(store.list().unwrap().len(), 1);
    }

    #[test]
    fn merge_is_order_independent() {
        let base = pin_at("v1", 100, "aria");
        let newer = Pin {
            name: "v2".into(),
            updated_at: 200,
            ..base.clone()
        };

        let forward = PinStore::open_in_memory().unwrap();
        merge_snapshot_at(&forward, &[base.clone()], 300).unwrap();
        merge_snapshot_at(&forward, &[newer.clone()], 300).unwrap();

        let backward = PinStore::open_in_memory().unwrap();
        merge_snapshot_at(&backward, &[newer.clone()], 300).unwrap();
        merge_snapshot_at(&backward, &[base.clone()], 300).unwrap();

        let f = forward.get(&base.id).unwrap().unwrap();
        let b = backward.get(&base.id).unwrap().unwrap();
        assert_eq!(f, b);
        assert_eq!(f.name, "v2");
    }

    #[test]
    fn older_live_pin_does_not_resurrect_newer_tombstone() {
        let store = PinStore::open_in_memory().unwrap();
        let live = pin_at("a", 100, "aria");
        let dead = tombstone_of(&live, 200);

        merge_snapshot_at(&store, &[dead], 300).unwrap();
        assert_eq!(merge_snapshot_at(&store, &[live.clone()], 300).unwrap(), 0);
        assert!(store.get(&live.id).unwrap().unwrap().deleted);
    }

    #[test]
    fn newer_live_pin_resurrects_older_tombstone() {
        let store = PinStore::open_in_memory().unwrap();
        let live = pin_at("a", 100, "aria");
        let dead = tombstone_of(&live, 150);
        let edited = Pin {
            name: "a again".into(),
            updated_at: 200,
            ..live.clone()
        };

        merge_snapshot_at(&store, &[dead], 300).unwrap();
        assert_eq!(merge_snapshot_at(&store, &[edited], 300).unwrap(), 1);

        let current = store.get(&live.id).unwrap().unwrap();
        assert!(!current.deleted);
        assert_eq!(current.name, "a again");
    }

    // Client A deletes at t=150 while client B edits the same pin at t=200.
    // Whatever order the snapshots arrive, both sides settle on the live
    // edit.
    #[test]
    fn concurrent_delete_and_edit_converge_on_the_edit() {
        let original = pin_at("camp", 100, "aria");
        let a_store = PinStore::open_in_memory().unwrap();
        let b_store = PinStore::open_in_memory().unwrap();
        merge_snapshot_at(&a_store, &[original.clone()], 300).unwrap();
        merge_snapshot_at(&b_store, &[original.clone()], 300).unwrap();

        let a_tombstone = tombstone_of(&original, 150);
        let b_edit = Pin {
            name: "fortified camp".into(),
            updated_at: 200,
            author: "bram".into(),
            ..original.clone()
        };
        a_store.upsert(&a_tombstone).unwrap();
        b_store.upsert(&b_edit).unwrap();

        // Exchange snapshots in both directions.
        merge_snapshot_at(&a_store, &[b_edit.clone()], 300).unwrap();
        assert_eq!(merge_snapshot_at(&b_store, &[a_tombstone], 300).unwrap(), 0);

        for store in [&a_store, &b_store] {
            let pin = store.get(&original.id).unwrap().unwrap();
            assert!(!pin.deleted);
            assert_eq!(pin.name, "fortified camp");
            assert_eq!(pin.updated_at, 200);
        }
    }

    #[test]
    fn expired_unknown_tombstone_is_skipped() {
        let store = PinStore::open_in_memory().unwrap();
        let now = DEFAULT_RETENTION_MS * 2;
        let ancient = tombstone_of(&pin_at("old", 100, "aria"), 100);
        let recent = tombstone_of(&pin_at("new", 100, "aria"), now - 1000);

        let changed =
            merge_snapshot_at(&store, &[ancient.clone(), recent.clone()], now).unwrap();
        assert_eq!(changed, 1);
        assert!(store.get(&ancient.id).unwrap().is_none());
        assert!(store.get(&recent.id).unwrap().is_some());
    }

    #[test]
    fn invalid_pin_rejects_entire_snapshot() {
        let store = PinStore::open_in_memory().unwrap();
        let good = pin_at("fine", 100, "aria");
        let mut bad = pin_at("broken", 100, "aria");
        bad.lat = 95.0;

        let err = merge_snapshot_at(&store, &[good.clone(), bad], 300).unwrap_err();
        assert!(matches!(err, Error::InvalidPin(_)));
        // The valid pin must not have been applied either.
        assert!(store.get(&good.id).unwrap().is_none());
    }

    #[test]
    fn merging_own_snapshot_is_a_no_op() {
        let store = PinStore::open_in_memory().unwrap();
        store
            .create(
                PinDraft {
                    lat: 1.0,
                    lng: 2.0,
                    name: "ours".into(),
                    description: None,
                    category: PinCategory::Location,
                },
                Some("aria"),
            )
            .unwrap();

        let echo = store.snapshot().unwrap();
        assert_eq!(merge_snapshot(&store, &echo).unwrap(), 0);
    }

    #[test]
    fn concurrent_readers_never_observe_a_partial_merge() {
        let store = Arc::new(PinStore::open_in_memory().unwrap());
        let snapshot: Vec<Pin> = (0..500)
            .map(|i| pin_at(&format!("pin {i}"), 100 + i as i64, "aria"))
            .collect();

        let observer = {
            let store = store.clone();
            std::thread::spawn(move || {
                for _ in 0..20_000 {
                    let seen = store.list().unwrap().len();
                    assert!(seen == 0 || seen == 500, "observed {seen} of 500 pins");
                    if seen == 500 {
                        return;
                    }
                    std::thread::yield_now();
                }
            })
        };

        merge_snapshot_at(&store, &snapshot, 1_000).unwrap();
        observer.join().unwrap();
        assert_eq!(store.list().unwrap().len(), 500);
    }

    #[tokio::test]
    async fn subscription_path_survives_bad_frames() {
        use std::sync::atomic::AtomicUsize;

        let store = Arc::new(PinStore::open_in_memory().unwrap());
        let transport =
            RelayTransport::new("ws://127.0.0.1:1", crate::transport::BackoffPolicy::default());
        let notifier = ChangeNotifier::new();
        let engine = SyncEngine::new(
            store.clone(),
            transport,
            notifier.clone(),
            Some("aria".into()),
            Duration::from_millis(10),
        );
        engine.start().unwrap();

        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let _sub = notifier.on_change(move || {
            h.fetch_add(1, Ordering::SeqCst);
        });

        // Garbage and truncated frames are dropped whole.
        handle_incoming(&engine.inner, "not json at all");
        handle_incoming(&engine.inner, r#"{"type":"map_sync"}"#);

        // A snapshot with one out-of-range pin is discarded entirely,
        // valid entries included.
        let good = pin_at("fine", 100, "bram");
        let mut bad = pin_at("broken", 100, "bram");
        bad.lat = 95.0;
        let frame = SyncMessage::MapSync {
            pins: vec![good.clone(), bad],
        }
        .encode()
        .unwrap();
        handle_incoming(&engine.inner, &frame);

        assert_eq!(hits.load(Ordering::SeqCst), 0);
        assert!(store.list().unwrap().is_empty());

        // The next well-formed snapshot still applies.
        let frame = SyncMessage::MapSync {
            pins: vec![good.clone()],
        }
        .encode()
        .unwrap();
        handle_incoming(&engine.inner, &frame);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(store.get(&good.id).unwrap().is_some());

        engine.stop();
    }

    #[tokio::test]
    async fn engine_mutations_notify_subscribers() {
        use std::sync::atomic::AtomicUsize;

        let store = Arc::new(PinStore::open_in_memory().unwrap());
        let transport =
            RelayTransport::new("ws://127.0.0.1:1", crate::transport::BackoffPolicy::default());
        let notifier = ChangeNotifier::new();
        let engine = SyncEngine::new(
            store,
            transport,
            notifier.clone(),
            Some("aria".into()),
            Duration::from_millis(10),
        );
        engine.start().unwrap();

        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let _sub = notifier.on_change(move || {
            h.fetch_add(1, Ordering::SeqCst);
        });

        let pin = engine
            .create_pin(PinDraft {
                lat: 0.0,
                lng: 0.0,
                name: "inn".into(),
                description: None,
                category: PinCategory::Location,
            })
            .unwrap();
        engine
            .update_pin(
                &pin.id,
                PinDraft {
                    lat: 0.0,
                    lng: 0.0,
                    name: "burnt inn".into(),
                    description: None,
                    category: PinCategory::Location,
                },
            )
            .unwrap();
        engine.delete_pin(&pin.id).unwrap();

        assert_eq!(hits.load(Ordering::SeqCst), 3);
        assert_eq!(engine.store().list_live().unwrap().len(), 0);
        engine.stop();
    }
}
