// ── State reconciler ──
//
// Merges optimistic projections, effect confirmations, and push events
// into the canonical entity store. Ranking is evaluated under the store's
// per-entity entry lock, so concurrent observations of one entity are
// totally ordered.

use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, trace, warn};

use crate::cache::{self, KvCache, SNAPSHOT_PREFIX};
use crate::effect::Confirmation;
use crate::error::SyncError;
use crate::model::{EntityId, FieldSource, Fields, Origin, PushEvent, Snapshot, Timestamp};
use crate::store::EntityStore;

/// Outcome of ranking an incoming observation against the current snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ranking {
    Replace,
    Keep,
}

/// Decide whether `incoming` replaces `current`. Applied per field by the
/// reconciler, and to whole snapshots on restore.
///
/// 1. `Confirmed` always outranks `LocalOptimistic`, in either direction.
/// 2. Same origin: strictly later timestamp wins, ties keep the current one.
/// 3. `Pushed` outranks `LocalOptimistic` unconditionally and `Confirmed`
///    only when strictly later. A `Confirmed` observation at or after a
///    pushed one replaces it.
pub fn rank(current: Option<(Origin, Timestamp)>, incoming: (Origin, Timestamp)) -> Ranking {
    let Some((current_origin, current_ts)) = current else {
        return Ranking::Replace;
    };
    let (incoming_origin, incoming_ts) = incoming;

    let replace = match (current_origin, incoming_origin) {
        (Origin::LocalOptimistic, Origin::Confirmed | Origin::Pushed) => true,
        (Origin::Confirmed | Origin::Pushed, Origin::LocalOptimistic) => false,
        (Origin::Pushed, Origin::Confirmed) => incoming_ts >= current_ts,
        (Origin::LocalOptimistic, Origin::LocalOptimistic)
        | (Origin::Confirmed, Origin::Confirmed | Origin::Pushed)
        | (Origin::Pushed, Origin::Pushed) => incoming_ts > current_ts,
    };
    if replace { Ranking::Replace } else { Ranking::Keep }
}

/// Overlay one observation onto `current`, field by field.
///
/// Returns `None` when nothing changes. The snapshot-level origin and
/// timestamp only advance when the observation outranks them.
fn merge(
    current: Option<&Snapshot>,
    entity_id: &EntityId,
    fields: Fields,
    source_timestamp: Timestamp,
    origin: Origin,
) -> Option<Snapshot> {
    let Some(current) = current else {
        return Some(Snapshot::new(entity_id.clone(), fields, source_timestamp, origin));
    };

    let incoming = (origin, source_timestamp);
    let outranks_snapshot =
        rank(Some((current.origin, current.source_timestamp)), incoming) == Ranking::Replace;

    let mut next = current.clone();
    if outranks_snapshot {
        next.origin = origin;
        next.source_timestamp = source_timestamp;
    }
    if fields.is_empty() {
        return outranks_snapshot.then_some(next);
    }

    let source = FieldSource {
        origin,
        timestamp: source_timestamp,
    };
    let mut applied = false;
    for (name, value) in fields {
        let written_by = current
            .fields
            .contains_key(&name)
            .then(|| current.source_of(&name));
        if rank(written_by, incoming) == Ranking::Keep {
            continue;
        }
        next.sources.insert(name.clone(), source);
        next.fields.insert(name, value);
        applied = true;
    }
    applied.then_some(next)
}

/// Sole writer of the canonical entity store.
pub struct Reconciler {
    store: Arc<EntityStore>,
    cache: Arc<dyn KvCache>,
    persist: bool,
    persist_lock: Mutex<()>,
}

impl Reconciler {
    pub fn new(store: Arc<EntityStore>, cache: Arc<dyn KvCache>, persist: bool) -> Self {
        Self {
            store,
            cache,
            persist,
            persist_lock: Mutex::new(()),
        }
    }

    pub fn store(&self) -> &Arc<EntityStore> {
        &self.store
    }

    /// Offer an observation. Returns `true` if it changed the snapshot.
    ///
    /// Observations may be partial. Each carried field is ranked against
    /// the observation that last wrote that field, so a push touching only
    /// `battery` is not discarded because a later confirmation wrote
    /// `state`. An observation without fields is ranked against the
    /// snapshot as a whole.
    pub async fn observe(
        &self,
        entity_id: &EntityId,
        fields: Fields,
        source_timestamp: Timestamp,
        origin: Origin,
    ) -> bool {
        let installed = self.store.replace_if(entity_id, |current| {
            merge(current, entity_id, fields, source_timestamp, origin)
        });

        if installed.is_none() {
            trace!(entity = %entity_id, ?origin, ts = %source_timestamp, "stale observation discarded");
            return false;
        }

        debug!(entity = %entity_id, ?origin, ts = %source_timestamp, "snapshot replaced");
        if self.persist {
            self.persist_latest(entity_id).await;
        }
        true
    }

    pub async fn observe_push(&self, event: PushEvent) -> bool {
        self.store.mark_push();
        self.observe(&event.entity_id, event.fields, event.timestamp, Origin::Pushed)
            .await
    }

    pub async fn observe_confirmation(&self, confirmation: &Confirmation) -> bool {
        self.observe(
            &confirmation.entity_id,
            confirmation.fields.clone(),
            confirmation.timestamp,
            Origin::Confirmed,
        )
        .await
    }

    pub async fn observe_optimistic(
        &self,
        entity_id: &EntityId,
        fields: Fields,
        at: Timestamp,
    ) -> bool {
        self.observe(entity_id, fields, at, Origin::LocalOptimistic)
            .await
    }

    /// Load persisted snapshots into the store. Snapshots already present
    /// are ranked against the persisted ones like any other observation.
    /// Unreadable entries are deleted.
    pub async fn restore(&self) -> Result<usize, SyncError> {
        let keys = self.cache.list_keys(SNAPSHOT_PREFIX).await?;
        let mut restored = 0;
        for key in keys {
            let snapshot: Snapshot = match cache::load_json(self.cache.as_ref(), &key).await {
                Ok(Some(snapshot)) => snapshot,
                Ok(None) => continue,
                Err(e) => {
                    warn!(key, error = %e, "dropping unreadable snapshot");
                    self.cache.delete(&key).await?;
                    continue;
                }
            };
            let id = snapshot.entity_id.clone();
            let installed = self.store.replace_if(&id, |current| {
                let ranking = rank(
                    current.map(|s| (s.origin, s.source_timestamp)),
                    (snapshot.origin, snapshot.source_timestamp),
                );
                (ranking == Ranking::Replace).then_some(snapshot)
            });
            if installed.is_some() {
                restored += 1;
            }
        }
        debug!(restored, "snapshots restored");
        Ok(restored)
    }

    /// Delete persisted snapshots and clear the store.
    pub async fn purge(&self) -> Result<(), SyncError> {
        let _guard = self.persist_lock.lock().await;
        for key in self.cache.list_keys(SNAPSHOT_PREFIX).await? {
            self.cache.delete(&key).await?;
        }
        self.store.clear();
        Ok(())
    }

    /// Persist whatever is current for `entity_id`. Re-reading under the
    /// lock keeps the durable copy from moving backwards when two
    /// observations race.
    async fn persist_latest(&self, entity_id: &EntityId) {
        let _guard = self.persist_lock.lock().await;
        let Some(latest) = self.store.get(entity_id) else {
            return;
        };
        let key = cache::snapshot_key(entity_id);
        if let Err(e) = cache::store_json(self.cache.as_ref(), &key, latest.as_ref()).await {
            warn!(entity = %entity_id, error = %e, "could not persist snapshot");
        }
    }
}
