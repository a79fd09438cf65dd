// ── Operation queue & dispatcher ──
//
// Owns the operation lifecycle and the durability of the pending queue.
//
// One slot per operation key. A slot's `worker` field is the single-flight
// token: only the worker whose id is stored there may move the operation
// to `InFlight`, and it is assigned under the slot's map entry lock. Later
// submissions for the key coalesce into the slot; if they land while an
// effect runs, the worker reruns with the newest intent afterwards.

mod event;
mod worker;

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::{Mutex, broadcast, oneshot, watch};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::cache::{self, KvCache, QUEUE_PREFIX};
use crate::config::SyncConfig;
use crate::connectivity::ConnectivityMonitor;
use crate::effect::EffectExecutor;
use crate::error::SyncError;
use crate::model::{
    Intent, LogicalClock, Operation, OperationKey, OperationKind, OperationStatus, Timestamp,
};
use crate::progress::ProgressTracker;
use crate::reconcile::Reconciler;

pub use event::{DispatchEvent, SubmitOutcome};

/// Queue entry for one operation key.
struct Slot {
    op: Operation,
    /// Whether the durable cache holds the current revision.
    durable: bool,
    /// Id of the worker task that owns this key, if any.
    worker: Option<u64>,
    /// Callers awaiting the outcome of the current run.
    waiters: Vec<oneshot::Sender<SubmitOutcome>>,
}

impl Slot {
    fn new(op: Operation) -> Self {
        Self {
            op,
            durable: false,
            worker: None,
            waiters: Vec::new(),
        }
    }

    fn restored(op: Operation) -> Self {
        Self {
            durable: true,
            ..Self::new(op)
        }
    }
}

/// Collaborators the dispatcher drives.
pub(crate) struct DispatcherParts {
    pub config: SyncConfig,
    pub cache: Arc<dyn KvCache>,
    pub executor: Arc<dyn EffectExecutor>,
    pub connectivity: Arc<ConnectivityMonitor>,
    pub progress: Arc<ProgressTracker>,
    pub reconciler: Arc<Reconciler>,
    pub clock: Arc<LogicalClock>,
    pub cancel: CancellationToken,
}

/// Connectivity-aware, single-flight operation dispatcher.
///
/// Cheaply cloneable via `Arc<DispatcherInner>`.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<DispatcherInner>,
}

struct DispatcherInner {
    config: SyncConfig,
    cache: Arc<dyn KvCache>,
    executor: Arc<dyn EffectExecutor>,
    connectivity: Arc<ConnectivityMonitor>,
    progress: Arc<ProgressTracker>,
    reconciler: Arc<Reconciler>,
    clock: Arc<LogicalClock>,
    slots: DashMap<OperationKey, Slot>,
    next_worker: AtomicU64,
    pending: watch::Sender<usize>,
    events: broadcast::Sender<DispatchEvent>,
    /// Serializes queue writes to the durable cache.
    persist_lock: Mutex<()>,
    cancel: CancellationToken,
    tracker: TaskTracker,
}

impl Dispatcher {
    pub(crate) fn new(parts: DispatcherParts) -> Self {
        let (pending, _) = watch::channel(0);
        let (events, _) = broadcast::channel(parts.config.event_channel_size.max(1));
        Self {
            inner: Arc::new(DispatcherInner {
                config: parts.config,
                cache: parts.cache,
                executor: parts.executor,
                connectivity: parts.connectivity,
                progress: parts.progress,
                reconciler: parts.reconciler,
                clock: parts.clock,
                slots: DashMap::new(),
                next_worker: AtomicU64::new(1),
                pending,
                events,
                persist_lock: Mutex::new(()),
                cancel: parts.cancel,
                tracker: TaskTracker::new(),
            }),
        }
    }

    // ── Submission ───────────────────────────────────────────────────

    /// Submit intent for `key`. See [`submit_intent`](Self::submit_intent).
    pub async fn submit(
        &self,
        key: impl Into<OperationKey>,
        kind: OperationKind,
        payload: serde_json::Value,
    ) -> Result<SubmitOutcome, SyncError> {
        self.submit_intent(Intent::new(key, kind, payload)).await
    }

    /// Enqueue an intent.
    ///
    /// An existing entry for the key absorbs the submission (latest intent
    /// wins). The entry is written to the durable cache before any effect
    /// runs. Offline, this returns [`SubmitOutcome::Deferred`] without
    /// waiting; online, it resolves once the key's effect settles.
    ///
    /// If the durable write fails the operation is still held in memory and
    /// re-persisted on the next [`resume`](Self::resume). Offline, that
    /// failure is returned as [`SyncError::QueuePersistence`]; online the
    /// effect runs regardless.
    pub async fn submit_intent(&self, intent: Intent) -> Result<SubmitOutcome, SyncError> {
        if self.inner.cancel.is_cancelled() {
            return Err(SyncError::SessionClosed);
        }

        let Intent {
            key,
            kind,
            payload,
            optimistic,
        } = intent;
        let created_at = self.inner.clock.now();
        let online = self.inner.connectivity.is_online();
        let (tx, rx) = oneshot::channel();

        match self.inner.slots.entry(key.clone()) {
            Entry::Occupied(mut entry) => {
                let slot = entry.get_mut();
                slot.op.coalesce(kind, payload);
                slot.durable = false;
                if online {
                    slot.waiters.push(tx);
                }
                debug!(key = %key, revision = slot.op.revision, status = %slot.op.status, "submission coalesced");
            }
            Entry::Vacant(entry) => {
                let mut slot = Slot::new(Operation::new(key.clone(), kind, payload, created_at));
                if online {
                    slot.waiters.push(tx);
                }
                debug!(key = %key, id = %slot.op.id, %kind, "operation accepted");
                entry.insert(slot);
            }
        }
        self.publish_pending();

        if !online {
            self.inner.progress.queued(&key);
        }

        if let Some((entity, fields)) = optimistic {
            self.inner
                .reconciler
                .observe_optimistic(&entity, fields, created_at)
                .await;
        }

        let persisted = self.sync_entry(&key).await;
        if let Err(e) = &persisted {
            warn!(key = %key, error = %e, "write-ahead failed; operation held in memory");
        }

        if !online {
            self.emit(DispatchEvent::Queued { key: key.clone() });
            info!(key = %key, "offline; operation deferred");
            return persisted.map(|()| SubmitOutcome::Deferred);
        }

        self.ensure_worker(&key);
        rx.await.map_err(|_| SyncError::SessionClosed)
    }

    // ── Queue lifecycle ──────────────────────────────────────────────

    /// Reload the persisted queue after a restart.
    ///
    /// Entries persisted as `InFlight` were interrupted mid-effect and go
    /// back to `Pending` (at-least-once). Unreadable entries are deleted.
    /// Keys already live in memory are left untouched. Drains if online.
    pub async fn restore(&self) -> Result<usize, SyncError> {
        let keys = self.inner.cache.list_keys(QUEUE_PREFIX).await?;
        let mut restored = 0;

        for cache_key in keys {
            let mut op: Operation = match cache::load_json(self.inner.cache.as_ref(), &cache_key).await {
                Ok(Some(op)) => op,
                Ok(None) => continue,
                Err(e) => {
                    warn!(key = cache_key, error = %e, "dropping unreadable queue entry");
                    self.inner.cache.delete(&cache_key).await?;
                    continue;
                }
            };

            if op.status == OperationStatus::InFlight {
                debug!(key = %op.key, attempt = op.attempt, "interrupted effect will be replayed");
            }
            op.status = OperationStatus::Pending;
            self.inner.clock.observe(op.created_at);

            let key = op.key.clone();
            let inserted = match self.inner.slots.entry(key.clone()) {
                Entry::Occupied(_) => false,
                Entry::Vacant(entry) => {
                    entry.insert(Slot::restored(op));
                    true
                }
            };
            if inserted {
                self.inner.progress.queued(&key);
                restored += 1;
            }
        }

        self.publish_pending();
        info!(restored, "operation queue restored");
        if restored > 0 && self.inner.connectivity.is_online() {
            self.drain();
        }
        Ok(restored)
    }

    /// Re-persist entries whose durable write failed, drop persisted
    /// entries with no live operation, then drain if online.
    ///
    /// Called on every reconnect and whenever the host returns to the
    /// foreground. Returns the number of workers started.
    pub async fn resume(&self) -> Result<usize, SyncError> {
        let unsynced: Vec<OperationKey> = self
            .inner
            .slots
            .iter()
            .filter(|slot| !slot.durable)
            .map(|slot| slot.key().clone())
            .collect();

        let mut first_error = None;
        for key in unsynced {
            if let Err(e) = self.sync_entry(&key).await {
                warn!(key = %key, error = %e, "queue entry still not persisted");
                first_error.get_or_insert(e);
            }
        }

        if let Err(e) = self.remove_orphans().await {
            warn!(error = %e, "could not prune persisted queue");
            first_error.get_or_insert(e);
        }

        let started = if self.inner.connectivity.is_online() {
            self.drain()
        } else {
            0
        };

        match first_error {
            Some(e) => Err(e),
            None => Ok(started),
        }
    }

    /// Start workers for every idle entry, oldest first.
    pub fn drain(&self) -> usize {
        let mut idle: Vec<(Timestamp, OperationKey)> = self
            .inner
            .slots
            .iter()
            .filter(|slot| slot.worker.is_none())
            .map(|slot| (slot.op.created_at, slot.key().clone()))
            .collect();
        idle.sort_by_key(|(created_at, _)| *created_at);

        for (_, key) in &idle {
            self.ensure_worker(key);
        }
        if !idle.is_empty() {
            info!(started = idle.len(), "draining operation queue");
        }
        idle.len()
    }

    /// Drop every queued operation, in memory and on disk. Callers still
    /// awaiting an outcome observe [`SyncError::SessionClosed`].
    pub async fn purge(&self) -> Result<usize, SyncError> {
        let guard = self.inner.persist_lock.lock().await;
        let dropped = self.inner.slots.len();
        self.inner.slots.clear();
        for key in self.inner.cache.list_keys(QUEUE_PREFIX).await? {
            self.inner.cache.delete(&key).await?;
        }
        drop(guard);

        self.publish_pending();
        info!(dropped, "operation queue purged");
        Ok(dropped)
    }

    /// Stop starting effects and wait for running workers. An effect
    /// already in flight is allowed to finish or time out.
    pub async fn shutdown(&self) {
        self.inner.cancel.cancel();
        self.inner.tracker.close();
        self.inner.tracker.wait().await;
        debug!("dispatcher stopped");
    }

    // ── Observation ──────────────────────────────────────────────────

    /// Number of operations not yet settled.
    pub fn pending_count(&self) -> usize {
        *self.inner.pending.borrow()
    }

    pub fn watch_pending(&self) -> watch::Receiver<usize> {
        self.inner.pending.subscribe()
    }

    /// Resolve once the queue is empty.
    pub async fn wait_idle(&self) {
        let mut rx = self.inner.pending.subscribe();
        // The sender lives as long as `self`, so this cannot fail.
        let _ = rx.wait_for(|pending| *pending == 0).await;
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<DispatchEvent> {
        self.inner.events.subscribe()
    }

    /// A clone of the queued operation for `key`.
    pub fn operation(&self, key: &OperationKey) -> Option<Operation> {
        self.inner.slots.get(key).map(|slot| slot.op.clone())
    }

    // ── Private helpers ──────────────────────────────────────────────

    /// Make the durable cache reflect the in-memory entry for `key`:
    /// write it if present, delete it if not.
    async fn sync_entry(&self, key: &OperationKey) -> Result<(), SyncError> {
        let _guard = self.inner.persist_lock.lock().await;
        let op = self.inner.slots.get(key).map(|slot| slot.op.clone());
        let cache_key = cache::queue_key(key);

        let result = match &op {
            Some(op) => cache::store_json(self.inner.cache.as_ref(), &cache_key, op).await,
            None => self.inner.cache.delete(&cache_key).await,
        };

        match result {
            Ok(()) => {
                if let Some(written) = op {
                    if let Some(mut slot) = self.inner.slots.get_mut(key) {
                        if slot.op.revision == written.revision && slot.op.attempt == written.attempt {
                            slot.durable = true;
                        }
                    }
                }
                Ok(())
            }
            Err(source) => {
                if let Some(mut slot) = self.inner.slots.get_mut(key) {
                    slot.durable = false;
                }
                Err(SyncError::QueuePersistence {
                    key: key.to_string(),
                    source,
                })
            }
        }
    }

    /// Delete persisted entries whose operation is no longer queued, e.g.
    /// after a failed delete on completion.
    async fn remove_orphans(&self) -> Result<(), SyncError> {
        let _guard = self.inner.persist_lock.lock().await;
        for cache_key in self.inner.cache.list_keys(QUEUE_PREFIX).await? {
            let Some(raw) = cache_key.strip_prefix(QUEUE_PREFIX) else {
                continue;
            };
            if !self.inner.slots.contains_key(&OperationKey::from(raw)) {
                debug!(key = raw, "removing orphaned queue entry");
                self.inner.cache.delete(&cache_key).await?;
            }
        }
        Ok(())
    }

    /// Spawn a worker for `key` unless one already owns it.
    fn ensure_worker(&self, key: &OperationKey) {
        let worker_id = {
            let Some(mut slot) = self.inner.slots.get_mut(key) else {
                return;
            };
            if slot.worker.is_some() {
                return;
            }
            let id = self.inner.next_worker.fetch_add(1, Ordering::Relaxed);
            slot.worker = Some(id);
            id
        };

        let dispatcher = self.clone();
        let key = key.clone();
        self.inner
            .tracker
            .spawn(async move { dispatcher.run_key(key, worker_id).await });
    }

    fn emit(&self, event: DispatchEvent) {
        // No receivers is fine.
        let _ = self.inner.events.send(event);
    }

    /// Must not be called while holding a slot guard.
    fn publish_pending(&self) {
        self.inner.pending.send_if_modified(|pending| {
            let now = self.inner.slots.len();
            if *pending == now {
                false
            } else {
                *pending = now;
                true
            }
        });
    }
}
