// ── Sync session ──
//
// Owns every component of the sync core for one signed-in session and
// runs the background tasks that connect them: the reconnect drain and
// push ingestion.

use std::sync::Arc;

use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::cache::KvCache;
use crate::config::SyncConfig;
use crate::connectivity::{Connectivity, ConnectivityMonitor, Reconnections};
use crate::dispatch::{Dispatcher, DispatcherParts, SubmitOutcome};
use crate::effect::EffectExecutor;
use crate::error::SyncError;
use crate::model::{
    EntityId, Intent, LogicalClock, OperationKey, OperationKind, ProgressRecord, PushEvent,
    Snapshot,
};
use crate::progress::ProgressTracker;
use crate::reconcile::Reconciler;
use crate::store::{EntityStore, SubscriptionId};
use crate::stream::SnapshotStream;

/// Lifecycle of a [`Session`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum SessionState {
    /// Built but not started.
    Idle,
    /// State restored and background tasks running.
    Running,
    /// Shut down; durable state kept unless logged out.
    Stopped,
}

/// The main entry point for hosts.
///
/// Cheaply cloneable via `Arc<SessionInner>`. Build with [`Session::new`],
/// call [`start`](Self::start) to restore durable state, and feed it
/// connectivity reports and push events.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

struct SessionInner {
    config: SyncConfig,
    store: Arc<EntityStore>,
    connectivity: Arc<ConnectivityMonitor>,
    progress: Arc<ProgressTracker>,
    reconciler: Arc<Reconciler>,
    dispatcher: Dispatcher,
    state: watch::Sender<SessionState>,
    cancel: CancellationToken,
    tasks: TaskTracker,
}

impl Session {
    /// Build a session. Does NOT restore state -- call
    /// [`start()`](Self::start). Connectivity starts `Offline` until the
    /// host reports otherwise.
    pub fn new(
        config: SyncConfig,
        cache: Arc<dyn KvCache>,
        executor: Arc<dyn EffectExecutor>,
    ) -> Self {
        let store = Arc::new(EntityStore::new());
        let connectivity = Arc::new(ConnectivityMonitor::new(Connectivity::Offline));
        let progress = Arc::new(ProgressTracker::new());
        let reconciler = Arc::new(Reconciler::new(
            Arc::clone(&store),
            Arc::clone(&cache),
            config.persist_snapshots,
        ));
        let cancel = CancellationToken::new();

        let dispatcher = Dispatcher::new(DispatcherParts {
            config: config.clone(),
            cache,
            executor,
            connectivity: Arc::clone(&connectivity),
            progress: Arc::clone(&progress),
            reconciler: Arc::clone(&reconciler),
            clock: Arc::new(LogicalClock::new()),
            cancel: cancel.child_token(),
        });
        let (state, _) = watch::channel(SessionState::Idle);

        Self {
            inner: Arc::new(SessionInner {
                config,
                store,
                connectivity,
                progress,
                reconciler,
                dispatcher,
                state,
                cancel,
                tasks: TaskTracker::new(),
            }),
        }
    }

    // ── Lifecycle ────────────────────────────────────────────────────

    /// Restore persisted snapshots and the operation queue, then start the
    /// reconnect drain. Calling it on a running session is a no-op.
    ///
    /// Only a queue restore failure is returned; snapshot restore failures
    /// are logged.
    pub async fn start(&self) -> Result<(), SyncError> {
        match *self.inner.state.borrow() {
            SessionState::Running => return Ok(()),
            SessionState::Stopped => return Err(SyncError::SessionClosed),
            SessionState::Idle => {}
        }

        // Subscribe before restoring so an edge during restore is not lost.
        let edges = self.inner.connectivity.reconnections();

        // Snapshots are a cache of remote state; losing them must not keep
        // queued intents from being recovered.
        let snapshots = if self.inner.config.persist_snapshots {
            self.inner.reconciler.restore().await.unwrap_or_else(|e| {
                warn!(error = %e, "snapshot restore failed, starting without cached state");
                0
            })
        } else {
            0
        };
        let operations = self.inner.dispatcher.restore().await?;

        self.inner.tasks.spawn(reconnect_task(
            self.clone(),
            edges,
            self.inner.cancel.clone(),
        ));

        self.inner.state.send_replace(SessionState::Running);
        info!(snapshots, operations, online = self.inner.connectivity.is_online(), "sync session started");
        Ok(())
    }

    /// Feed push events from a real-time channel until it closes or the
    /// session shuts down.
    pub fn attach_push(&self, receiver: broadcast::Receiver<PushEvent>) {
        self.inner.tasks.spawn(push_ingest_task(
            self.clone(),
            receiver,
            self.inner.cancel.clone(),
        ));
    }

    /// Re-persist and drain the queue, e.g. when the app returns to the
    /// foreground.
    pub async fn resume(&self) -> Result<usize, SyncError> {
        self.inner.dispatcher.resume().await
    }

    /// Stop background tasks and wait for in-flight effects. Durable
    /// state (queue and snapshots) is kept for the next start.
    pub async fn shutdown(&self) {
        self.inner.cancel.cancel();
        self.inner.tasks.close();
        self.inner.tasks.wait().await;
        self.inner.dispatcher.shutdown().await;
        self.inner.state.send_replace(SessionState::Stopped);
        debug!("sync session stopped");
    }

    /// Shut down and discard all session state: queued operations,
    /// persisted snapshots, the entity store, and progress records.
    pub async fn logout(&self) -> Result<(), SyncError> {
        self.shutdown().await;
        let dropped = self.inner.dispatcher.purge().await?;
        self.inner.reconciler.purge().await?;
        self.inner.progress.clear();
        info!(dropped, "session state purged");
        Ok(())
    }

    pub fn state(&self) -> watch::Receiver<SessionState> {
        self.inner.state.subscribe()
    }

    // ── Operations ───────────────────────────────────────────────────

    pub async fn submit(
        &self,
        key: impl Into<OperationKey>,
        kind: OperationKind,
        payload: serde_json::Value,
    ) -> Result<SubmitOutcome, SyncError> {
        self.inner.dispatcher.submit(key, kind, payload).await
    }

    pub async fn submit_intent(&self, intent: Intent) -> Result<SubmitOutcome, SyncError> {
        self.inner.dispatcher.submit_intent(intent).await
    }

    pub fn read_progress(&self, key: &OperationKey) -> ProgressRecord {
        self.inner.progress.read(key)
    }

    pub fn watch_progress(&self, key: &OperationKey) -> watch::Receiver<ProgressRecord> {
        self.inner.progress.watch(key)
    }

    /// Resolve once no operation is queued or in flight.
    pub async fn wait_idle(&self) {
        self.inner.dispatcher.wait_idle().await;
    }

    // ── Entity state ─────────────────────────────────────────────────

    /// Apply a push event directly. Returns `true` if it was applied.
    pub async fn ingest_push(&self, event: PushEvent) -> bool {
        self.inner.reconciler.observe_push(event).await
    }

    pub fn snapshot(&self, entity: &EntityId) -> Option<Arc<Snapshot>> {
        self.inner.store.get(entity)
    }

    pub fn subscribe(&self, entity: &EntityId) -> SnapshotStream {
        self.inner.store.subscribe(entity)
    }

    pub fn subscribe_with<F>(&self, entity: &EntityId, callback: F) -> SubscriptionId
    where
        F: Fn(&Arc<Snapshot>) + Send + Sync + 'static,
    {
        self.inner.store.subscribe_with(entity, callback)
    }

    pub fn unsubscribe(&self, entity: &EntityId, subscription: SubscriptionId) -> bool {
        self.inner.store.unsubscribe(entity, subscription)
    }

    pub fn unsubscribe_all(&self, entity: &EntityId) -> usize {
        self.inner.store.unsubscribe_all(entity)
    }

    // ── Components ───────────────────────────────────────────────────

    pub fn config(&self) -> &SyncConfig {
        &self.inner.config
    }

    pub fn store(&self) -> &Arc<EntityStore> {
        &self.inner.store
    }

    pub fn connectivity(&self) -> &Arc<ConnectivityMonitor> {
        &self.inner.connectivity
    }

    pub fn progress(&self) -> &Arc<ProgressTracker> {
        &self.inner.progress
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.inner.dispatcher
    }
}

// ── Background tasks ─────────────────────────────────────────────────

/// Drain the queue on every offline→online transition.
async fn reconnect_task(session: Session, mut edges: Reconnections, cancel: CancellationToken) {
    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            edge = edges.next() => {
                if edge.is_none() {
                    break;
                }
                match session.inner.dispatcher.resume().await {
                    Ok(started) => debug!(started, "reconnect drain"),
                    Err(e) => warn!(error = %e, "reconnect drain incomplete"),
                }
            }
        }
    }
}

/// Apply push events from a broadcast channel.
async fn push_ingest_task(
    session: Session,
    mut receiver: broadcast::Receiver<PushEvent>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            received = receiver.recv() => match received {
                Ok(event) => {
                    session.ingest_push(event).await;
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "push ingest lagged; events dropped");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    debug!("push channel closed");
                    break;
                }
            },
        }
    }
}
