// ── Reactive keyed collection ──
//
// Lock-free concurrent storage with per-entry and whole-collection change
// notification via `watch` channels.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::watch;

use crate::model::EntityId;

/// A concurrent, reactive collection of immutable values keyed by entity.
///
/// Each entry owns a `watch` channel so single-entity subscribers only
/// wake for their own entity. The full snapshot is rebuilt on every
/// mutation for collection-wide subscribers.
pub(crate) struct EntityCollection<T: Send + Sync + 'static> {
    /// Entity id -> current value. `None` marks an entry created by an
    /// early subscriber before the first value arrived.
    by_id: DashMap<EntityId, watch::Sender<Option<Arc<T>>>>,

    /// Full snapshot ordered by entity id.
    snapshot: watch::Sender<Arc<Vec<Arc<T>>>>,
}

impl<T: Send + Sync + 'static> EntityCollection<T> {
    pub(crate) fn new() -> Self {
        let (snapshot, _) = watch::channel(Arc::new(Vec::new()));
        Self {
            by_id: DashMap::new(),
            snapshot,
        }
    }

    /// Atomically compare-and-replace the value for `id`.
    ///
    /// `decide` sees the current value under the entry lock and returns the
    /// replacement, or `None` to keep the current value. Returns the new
    /// value if one was installed.
    pub(crate) fn replace_if<F>(&self, id: &EntityId, decide: F) -> Option<Arc<T>>
    where
        F: FnOnce(Option<&T>) -> Option<T>,
    {
        let installed = {
            let entry = self
                .by_id
                .entry(id.clone())
                .or_insert_with(|| watch::channel(None).0);
            let current = entry.borrow().clone();
            let next = Arc::new(decide(current.as_deref())?);
            entry.send_replace(Some(Arc::clone(&next)));
            next
        };
        self.rebuild_snapshot();
        Some(installed)
    }

    pub(crate) fn get(&self, id: &EntityId) -> Option<Arc<T>> {
        self.by_id.get(id).and_then(|entry| entry.borrow().clone())
    }

    /// Subscribe to one entity, creating an empty entry if it is unknown.
    pub(crate) fn subscribe(&self, id: &EntityId) -> watch::Receiver<Option<Arc<T>>> {
        self.by_id
            .entry(id.clone())
            .or_insert_with(|| watch::channel(None).0)
            .subscribe()
    }

    pub(crate) fn subscribe_all(&self) -> watch::Receiver<Arc<Vec<Arc<T>>>> {
        self.snapshot.subscribe()
    }

    /// Get the current snapshot (cheap `Arc` clone).
    pub(crate) fn snapshot(&self) -> Arc<Vec<Arc<T>>> {
        self.snapshot.borrow().clone()
    }

    /// Remove all values. Per-entity subscribers observe `None`.
    pub(crate) fn clear(&self) {
        for entry in &self.by_id {
            entry.value().send_replace(None);
        }
        self.by_id.clear();
        self.rebuild_snapshot();
    }

    /// Number of entities that currently hold a value.
    pub(crate) fn len(&self) -> usize {
        self.snapshot.borrow().len()
    }

    pub(crate) fn ids(&self) -> Vec<EntityId> {
        let mut ids: Vec<EntityId> = self
            .by_id
            .iter()
            .filter(|entry| entry.value().borrow().is_some())
            .map(|entry| entry.key().clone())
            .collect();
        ids.sort();
        ids
    }

    // ── Private helpers ──────────────────────────────────────────────

    /// Rebuild inside `send_modify` so concurrent rebuilds are serialized and
    /// the last one to run sees every completed write.
    fn rebuild_snapshot(&self) {
        self.snapshot.send_modify(|snap| {
            let mut values: Vec<(EntityId, Arc<T>)> = self
                .by_id
                .iter()
                .filter_map(|entry| {
                    let value = entry.value().borrow().clone()?;
                    Some((entry.key().clone(), value))
                })
                .collect();
            values.sort_by(|a, b| a.0.cmp(&b.0));
            *snap = Arc::new(values.into_iter().map(|(_, v)| v).collect());
        });
    }
}
