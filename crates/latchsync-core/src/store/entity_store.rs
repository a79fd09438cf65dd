// ── Entity store ──
//
// Thread-safe snapshot storage with three ways to observe it: point reads,
// `watch`-backed streams, and registered callbacks.

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::watch;
use tracing::{debug, warn};

use super::collection::EntityCollection;
use crate::model::{EntityId, Snapshot};
use crate::stream::{EntityStream, SnapshotStream};

type Callback = Arc<dyn Fn(&Arc<Snapshot>) + Send + Sync>;

/// Last snapshot handed to an entity's callbacks. Held while they run.
type Delivered = Arc<Mutex<Option<Arc<Snapshot>>>>;

/// Handle returned by [`EntityStore::subscribe_with`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// Canonical store holding exactly one current snapshot per entity.
///
/// Only the reconciler replaces snapshots; everything public here is
/// read-only.
pub struct EntityStore {
    snapshots: EntityCollection<Snapshot>,
    callbacks: DashMap<EntityId, Vec<(SubscriptionId, Callback)>>,
    delivered: DashMap<EntityId, Delivered>,
    next_subscription: AtomicU64,
    last_push: watch::Sender<Option<DateTime<Utc>>>,
}

impl EntityStore {
    pub fn new() -> Self {
        let (last_push, _) = watch::channel(None);
        Self {
            snapshots: EntityCollection::new(),
            callbacks: DashMap::new(),
            delivered: DashMap::new(),
            next_subscription: AtomicU64::new(1),
            last_push,
        }
    }

    // ── Reads ────────────────────────────────────────────────────────

    pub fn get(&self, id: &EntityId) -> Option<Arc<Snapshot>> {
        self.snapshots.get(id)
    }

    /// Every current snapshot, ordered by entity id.
    pub fn snapshot_all(&self) -> Arc<Vec<Arc<Snapshot>>> {
        self.snapshots.snapshot()
    }

    pub fn len(&self) -> usize {
        self.snapshots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn entity_ids(&self) -> Vec<EntityId> {
        self.snapshots.ids()
    }

    /// Wall-clock time the last push event was applied or discarded.
    pub fn last_push_at(&self) -> Option<DateTime<Utc>> {
        *self.last_push.borrow()
    }

    // ── Subscriptions ────────────────────────────────────────────────

    pub fn subscribe(&self, id: &EntityId) -> SnapshotStream {
        SnapshotStream::new(self.snapshots.subscribe(id))
    }

    pub fn subscribe_all(&self) -> EntityStream<Snapshot> {
        EntityStream::new(self.snapshots.subscribe_all())
    }

    /// Register a callback invoked synchronously with every snapshot
    /// applied to `id`. Callbacks must not block.
    pub fn subscribe_with<F>(&self, id: &EntityId, callback: F) -> SubscriptionId
    where
        F: Fn(&Arc<Snapshot>) + Send + Sync + 'static,
    {
        let sub = SubscriptionId(self.next_subscription.fetch_add(1, Ordering::Relaxed));
        self.callbacks
            .entry(id.clone())
            .or_default()
            .push((sub, Arc::new(callback)));
        debug!(entity = %id, subscription = sub.0, "callback registered");
        sub
    }

    /// Remove one callback. Returns `true` if it was registered.
    pub fn unsubscribe(&self, id: &EntityId, subscription: SubscriptionId) -> bool {
        let Some(mut subs) = self.callbacks.get_mut(id) else {
            return false;
        };
        let before = subs.len();
        subs.retain(|(sub, _)| *sub != subscription);
        let removed = subs.len() != before;
        drop(subs);
        self.callbacks.remove_if(id, |_, subs| subs.is_empty());
        removed
    }

    /// Remove every callback for `id`. Returns how many were removed.
    pub fn unsubscribe_all(&self, id: &EntityId) -> usize {
        let removed = self.callbacks.remove(id).map_or(0, |(_, subs)| subs.len());
        debug!(entity = %id, removed, "callbacks removed");
        removed
    }

    // ── Writes (reconciler only) ─────────────────────────────────────

    /// Atomically replace the snapshot for `id` if `decide` produces one,
    /// then notify callbacks. Returns the installed snapshot.
    pub(crate) fn replace_if<F>(&self, id: &EntityId, decide: F) -> Option<Arc<Snapshot>>
    where
        F: FnOnce(Option<&Snapshot>) -> Option<Snapshot>,
    {
        let installed = self.snapshots.replace_if(id, decide)?;
        self.notify(id);
        Some(installed)
    }

    /// Run the callbacks for `id` with whatever snapshot is current.
    ///
    /// Two writers racing on one entity may reach this in either order, so
    /// the snapshot delivered is re-read under the entity's delivery lock
    /// rather than taken from the caller. The last delivery therefore always
    /// matches the store, and a snapshot is never delivered twice.
    fn notify(&self, id: &EntityId) {
        let delivered: Delivered =
            Arc::clone(self.delivered.entry(id.clone()).or_default().value());
        let mut last = delivered.lock().unwrap_or_else(PoisonError::into_inner);

        let Some(latest) = self.snapshots.get(id) else {
            return;
        };
        if last.as_ref().is_some_and(|prev| Arc::ptr_eq(prev, &latest)) {
            return;
        }
        *last = Some(Arc::clone(&latest));

        // Clone the callback list so none runs under a map lock.
        let callbacks: Vec<Callback> = self
            .callbacks
            .get(id)
            .map(|subs| subs.iter().map(|(_, cb)| Arc::clone(cb)).collect())
            .unwrap_or_default();
        for callback in callbacks {
            callback(&latest);
        }
    }

    pub(crate) fn mark_push(&self) {
        self.last_push.send_replace(Some(Utc::now()));
    }

    /// Drop every snapshot and callback (logout).
    pub(crate) fn clear(&self) {
        let entities = self.snapshots.len();
        self.snapshots.clear();
        self.callbacks.clear();
        self.delivered.clear();
        self.last_push.send_replace(None);
        if entities > 0 {
            warn!(entities, "entity store cleared");
        }
    }
}

impl Default for EntityStore {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for EntityStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntityStore")
            .field("entities", &self.snapshots.len())
            .field("callback_entities", &self.callbacks.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::model::{Origin, Timestamp};

    fn snap(id: &str, state: &str, ts: u64) -> Snapshot {
        Snapshot::new(
            EntityId::from(id),
            [("state".to_owned(), serde_json::json!(state))].into(),
            Timestamp::from_millis(ts),
            Origin::Confirmed,
        )
    }

    #[test]
    fn callbacks_fire_on_replace_and_stop_after_unsubscribe() {
        let store = EntityStore::new();
        let id = EntityId::from("hub-1");
        let seen = Arc::new(Mutex::new(Vec::new()));

        let sink = Arc::clone(&seen);
        let sub = store.subscribe_with(&id, move |s| {
            sink.lock().unwrap().push(s.field_str("state").unwrap().to_owned());
        });

        store.replace_if(&id, |_| Some(snap("hub-1", "locked", 1)));
        // Discarded replacements are silent.
        store.replace_if(&id, |_| None);
        assert_eq!(*seen.lock().unwrap(), vec!["locked".to_owned()]);

        assert!(store.unsubscribe(&id, sub));
        assert!(!store.unsubscribe(&id, sub));
        store.replace_if(&id, |_| Some(snap("hub-1", "unlocked", 2)));
        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[test]
    fn racing_writers_deliver_the_current_snapshot_last() {
        let store = EntityStore::new();
        let id = EntityId::from("hub-1");
        let last_seen = Arc::new(Mutex::new(0));
        let sink = Arc::clone(&last_seen);
        store.subscribe_with(&id, move |s| {
            *sink.lock().unwrap() = s.source_timestamp.as_millis();
        });

        for round in 0..50_u64 {
            let base = round * 100;
            std::thread::scope(|scope| {
                for writer in 1..=8 {
                    let (store, id) = (&store, &id);
                    scope.spawn(move || {
                        let ts = base + writer;
                        store.replace_if(id, |current| {
                            let newer = current
                                .is_none_or(|s| s.source_timestamp < Timestamp::from_millis(ts));
                            newer.then(|| snap("hub-1", "locked", ts))
                        });
                    });
                }
            });

            let current = store.get(&id).unwrap().source_timestamp.as_millis();
            assert_eq!(current, base + 8);
            assert_eq!(*last_seen.lock().unwrap(), current, "round {round}");
        }
    }

    #[test]
    fn unsubscribe_all_counts_callbacks() {
        let store = EntityStore::new();
        let id = EntityId::from("hub-1");
        store.subscribe_with(&id, |_| {});
        store.subscribe_with(&id, |_| {});
        store.subscribe_with(&EntityId::from("hub-2"), |_| {});

        assert_eq!(store.unsubscribe_all(&id), 2);
        assert_eq!(store.unsubscribe_all(&id), 0);
    }

    #[tokio::test]
    async fn streams_observe_replacements() {
        let store = EntityStore::new();
        let id = EntityId::from("hub-1");
        let mut one = store.subscribe(&id);
        let mut all = store.subscribe_all();
        assert!(one.current().is_none());
        assert!(all.current().is_empty());

        store.replace_if(&id, |_| Some(snap("hub-1", "locked", 1)));

        let latest = one.changed().await.unwrap();
        assert_eq!(latest.field_str("state"), Some("locked"));
        let everything = all.changed().await.unwrap();
        assert_eq!(everything.len(), 1);
    }

    #[tokio::test]
    async fn clear_ends_single_entity_streams() {
        let store = EntityStore::new();
        let id = EntityId::from("hub-1");
        store.replace_if(&id, |_| Some(snap("hub-1", "locked", 1)));
        let mut stream = store.subscribe(&id);
        assert!(stream.current().is_some());

        store.clear();
        assert!(stream.changed().await.is_none());
        assert!(store.is_empty());
        assert!(store.get(&id).is_none());
    }
}
